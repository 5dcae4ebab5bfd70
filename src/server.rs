//! The intercepting proxy.
//!
//! Every accepted connection carries exactly one exchange. Plain requests in
//! absolute-form are forwarded as they are; a `CONNECT` is answered with
//! `200 Connection established`, the tunnel is terminated with a
//! certificate issued for the target host and the one decrypted request is
//! relayed to the origin over a separate TLS connection.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::ca::CertificateAuthority;
use crate::capture::Recorder;
use crate::client::{Client, ClientBuilder};
use crate::errors::{Error, Result};
use crate::redirect::Policy;
use crate::{tls, Request, Response, CONNECTION_ESTABLISHED};

const PROXY_CONNECTION: &str = "proxy-connection";

/// Builder for [`ProxyServer`].
#[derive(Default)]
pub struct ProxyServerBuilder {
  authority: Option<Arc<dyn CertificateAuthority>>,
  client: Option<Client>,
  client_config: Option<Box<dyn FnOnce(ClientBuilder) -> ClientBuilder + Send>>,
  recorder: Option<Recorder>,
}

impl ProxyServerBuilder {
  /// The authority issuing certificates for intercepted hosts. Required.
  pub fn authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
    self.authority = Some(authority);
    self
  }

  /// Use this client for origin exchanges.
  pub fn client(mut self, client: Client) -> Self {
    self.client = Some(client);
    self
  }

  /// Configure the origin client; redirects are never followed regardless
  /// of what the closure sets, the proxied client sees them instead.
  pub fn configure_client<F>(mut self, f: F) -> Self
  where
    F: FnOnce(ClientBuilder) -> ClientBuilder + Send + 'static,
  {
    self.client_config = Some(Box::new(f));
    self
  }

  /// Record every relayed exchange.
  pub fn recorder(mut self, recorder: Recorder) -> Self {
    self.recorder = Some(recorder);
    self
  }

  /// Bind the listener. Port `0` picks an ephemeral port.
  pub async fn bind<A: ToSocketAddrs>(self, addr: A) -> Result<ProxyServer> {
    let authority = self
      .authority
      .ok_or_else(|| Error::Config("proxy needs a certificate authority".to_string()))?;
    let client = match (self.client, self.client_config) {
      (Some(client), _) => client,
      (None, Some(configure)) => configure(Client::builder()).redirect(Policy::none()).build()?,
      (None, None) => Client::builder().redirect(Policy::none()).build()?,
    };
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("proxy listening on {}", local_addr);
    Ok(ProxyServer {
      listener,
      local_addr,
      inner: Arc::new(Interceptor {
        authority,
        client,
        recorder: self.recorder,
      }),
    })
  }
}

/// A bound proxy listener.
pub struct ProxyServer {
  listener: TcpListener,
  local_addr: SocketAddr,
  inner: Arc<Interceptor>,
}

impl ProxyServer {
  /// Creates a `ProxyServerBuilder`.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// The bound address.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Serve in the background until [`ServerHandle::shutdown`].
  pub fn start(self) -> ServerHandle {
    let (tx, rx) = oneshot::channel::<()>();
    let local_addr = self.local_addr;
    let task = tokio::spawn(async move {
      if let Err(e) = self
        .run_until(async {
          let _ = rx.await;
        })
        .await
      {
        tracing::error!("proxy on {} failed: {}", local_addr, e);
      }
    });
    ServerHandle::new(local_addr, tx, task)
  }

  /// Serve until `signal` completes. Connections already accepted run to
  /// completion on their own tasks.
  pub async fn run_until<F>(self, signal: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    tokio::pin!(signal);
    loop {
      tokio::select! {
        _ = &mut signal => {
          tracing::info!("proxy on {} stopped", self.local_addr);
          return Ok(());
        }
        accepted = self.listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let inner = self.inner.clone();
            tokio::spawn(async move {
              if let Err(e) = inner.handle_connection(stream).await {
                tracing::debug!("connection from {} aborted: {}", peer, e);
              }
            });
          }
          Err(e) => tracing::error!("failed to accept connection: {}", e),
        }
      }
    }
  }
}

/// Handle to a proxy started with [`ProxyServer::start`].
#[derive(Debug)]
pub struct ServerHandle {
  local_addr: SocketAddr,
  shutdown: oneshot::Sender<()>,
  task: JoinHandle<()>,
}

impl ServerHandle {
  pub(crate) fn new(
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
  ) -> Self {
    ServerHandle {
      local_addr,
      shutdown,
      task,
    }
  }

  /// The bound address.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stop accepting connections and wait for the accept loop to exit.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(());
    let _ = self.task.await;
  }
}

struct Interceptor {
  authority: Arc<dyn CertificateAuthority>,
  client: Client,
  recorder: Option<Recorder>,
}

impl Interceptor {
  async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
    let mut stream = BufReader::new(stream);
    let request = match Request::read_from(&mut stream).await {
      Ok(request) => request,
      Err(e) => {
        if matches!(e, Error::InvalidRequest(_)) {
          let page = Response::error_page(StatusCode::BAD_REQUEST, e.to_string());
          let _ = write_response(&mut stream, &page).await;
        }
        return Err(e);
      }
    };
    if request.method() == Method::CONNECT {
      self.intercept(stream, request).await
    } else {
      self.forward(stream, request).await
    }
  }

  async fn forward<S>(&self, mut stream: S, mut request: Request) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    if request.uri().host().is_none() {
      let e = Error::invalid_request(format!("not a proxy request: {}", request.uri()));
      let page = Response::error_page(StatusCode::BAD_REQUEST, e.to_string());
      write_response(&mut stream, &page).await?;
      return Err(e);
    }
    request.headers_mut().remove(PROXY_CONNECTION);
    let response = match self.client.round_trip(&request).await {
      Ok(response) => response,
      Err(e) => {
        let page = Response::error_page(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        write_response(&mut stream, &page).await?;
        return Err(e);
      }
    };
    write_response(&mut stream, &response).await?;
    tracing::debug!(
      "{} {} -> {}",
      request.method(),
      request.uri(),
      response.status_code()
    );
    self.record(&request, &response).await;
    Ok(())
  }

  async fn intercept<S>(&self, mut stream: S, connect: Request) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let authority = match connect.uri().authority() {
      Some(authority) => authority.clone(),
      None => {
        let e = Error::invalid_request(format!("invalid CONNECT target {}", connect.uri()));
        let page = Response::error_page(StatusCode::BAD_REQUEST, e.to_string());
        write_response(&mut stream, &page).await?;
        return Err(e);
      }
    };
    let host = authority.host();
    let port = authority.port_u16().unwrap_or(443);
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;
    // the channel carries TLS from here on, errors can only close it
    let issued = self.authority.issue_certificate(host).await?;
    let acceptor = TlsAcceptor::from(tls::server_config(issued.chain, issued.key)?);
    let client_tls = acceptor
      .accept(stream)
      .await
      .map_err(|e| Error::tls_error(format!("client handshake for {} failed: {}", host, e)))?;
    let connector = self.client.connector();
    let origin = connector.connect(host, port).await?;
    let mut origin = connector.upgrade_to_tls(origin, host).await?;

    let mut client_tls = BufReader::new(client_tls);
    let mut request = Request::read_from(&mut client_tls).await?;
    let target = if port == 443 {
      host.to_string()
    } else {
      format!("{}:{}", host, port)
    };
    let path = request
      .uri()
      .path_and_query()
      .map(|p| p.as_str())
      .unwrap_or("/");
    *request.uri_mut() = http::Uri::try_from(format!("https://{}{}", target, path))?;
    request.headers_mut().remove(PROXY_CONNECTION);

    origin.write_all(&request.to_raw()).await?;
    origin.flush().await?;
    let response = origin.read_response(request.method()).await?;
    write_response(&mut client_tls, &response).await?;
    let _ = client_tls.shutdown().await;
    tracing::debug!(
      "{} {} -> {} (intercepted)",
      request.method(),
      request.uri(),
      response.status_code()
    );
    self.record(&request, &response).await;
    Ok(())
  }

  async fn record(&self, request: &Request, response: &Response) {
    if let Some(recorder) = &self.recorder {
      recorder.record(request, response).await;
    }
  }
}

async fn write_response<S>(stream: &mut S, response: &Response) -> Result<()>
where
  S: AsyncWrite + Unpin,
{
  stream.write_all(&response.to_raw()).await?;
  stream.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ca::IssuedCertificate;
  use async_trait::async_trait;
  use tokio::io::AsyncReadExt;

  struct Refusing;

  #[async_trait]
  impl CertificateAuthority for Refusing {
    async fn issue_certificate(&self, host: &str) -> Result<IssuedCertificate> {
      Err(Error::certificate_error(format!("no certificate for {}", host)))
    }
  }

  async fn proxy() -> ServerHandle {
    ProxyServer::builder()
      .authority(Arc::new(Refusing))
      .bind("127.0.0.1:0")
      .await
      .unwrap()
      .start()
  }

  async fn exchange(addr: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    received
  }

  #[tokio::test]
  async fn builder_requires_an_authority() {
    assert!(matches!(
      ProxyServer::builder().bind("127.0.0.1:0").await,
      Err(Error::Config(_))
    ));
  }

  #[tokio::test]
  async fn malformed_request_gets_400() {
    let handle = proxy().await;
    let received = exchange(handle.local_addr(), b"garbage\r\n\r\n").await;
    assert!(received.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    let received = exchange(handle.local_addr(), b"GET /relative HTTP/1.1\r\nHost: a\r\n\r\n").await;
    assert!(received.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    handle.shutdown().await;
  }

  #[tokio::test]
  async fn unreachable_origin_gets_503() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);
    let handle = proxy().await;
    let request = format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");
    let received = exchange(handle.local_addr(), request.as_bytes()).await;
    assert!(received.starts_with(b"HTTP/1.1 503 Service Unavailable\r\n"));
    handle.shutdown().await;
  }

  #[tokio::test]
  async fn failed_issuance_closes_the_tunnel_after_the_established_line() {
    let handle = proxy().await;
    let received = exchange(
      handle.local_addr(),
      b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n",
    )
    .await;
    assert_eq!(received, CONNECTION_ESTABLISHED);
    handle.shutdown().await;
  }
}
