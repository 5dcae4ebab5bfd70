#![allow(dead_code)]
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snare::{CertificateAuthority, GeneratedAuthority, Repo, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

/// A throw-away origin answering every request with its handler.
pub struct Origin {
  pub addr: SocketAddr,
  hits: Arc<AtomicUsize>,
  seen: Arc<Mutex<Vec<Request>>>,
}

impl Origin {
  pub fn hits(&self) -> usize {
    self.hits.load(Ordering::SeqCst)
  }

  pub fn seen(&self) -> Vec<Request> {
    self.seen.lock().unwrap().clone()
  }

  pub fn port(&self) -> u16 {
    self.addr.port()
  }
}

type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

pub fn text(status: u16, body: &str) -> Response {
  Response::builder()
    .status(status)
    .header("Content-Type", "text/plain")
    .body(body.to_string())
    .unwrap()
    .into()
}

pub fn scratch_dir(name: &str) -> PathBuf {
  std::env::temp_dir().join(format!(
    "snare-it-{}-{}-{}",
    name,
    std::process::id(),
    rand::random::<u32>()
  ))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

async fn serve_one<S>(stream: S, handler: Handler, hits: Arc<AtomicUsize>, seen: Arc<Mutex<Vec<Request>>>)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut stream = BufReader::new(stream);
  let request = match Request::read_from(&mut stream).await {
    Ok(request) => request,
    Err(_) => return,
  };
  hits.fetch_add(1, Ordering::SeqCst);
  let response = handler(&request);
  seen.lock().unwrap().push(request);
  let _ = stream.write_all(&response.to_raw()).await;
  let _ = stream.shutdown().await;
}

/// Plain HTTP origin on an ephemeral port.
pub async fn origin<F>(handler: F) -> Origin
where
  F: Fn(&Request) -> Response + Send + Sync + 'static,
{
  start_origin(Arc::new(handler), None).await
}

/// TLS origin for `127.0.0.1`; also returns the PEM root its certificate
/// chains to.
pub async fn tls_origin<F>(handler: F) -> (Origin, String)
where
  F: Fn(&Request) -> Response + Send + Sync + 'static,
{
  let ca = GeneratedAuthority::new(scratch_dir("origin-ca")).await.unwrap();
  let issued = ca.issue_certificate("127.0.0.1").await.unwrap();
  let config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(issued.chain, issued.key)
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let origin = start_origin(Arc::new(handler), Some(acceptor)).await;
  (origin, ca.ca_cert_pem().to_string())
}

async fn start_origin(handler: Handler, tls: Option<TlsAcceptor>) -> Origin {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  let seen = Arc::new(Mutex::new(Vec::new()));
  let (h, s) = (hits.clone(), seen.clone());
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let (handler, hits, seen, tls) = (handler.clone(), h.clone(), s.clone(), tls.clone());
      tokio::spawn(async move {
        match tls {
          None => serve_one(stream, handler, hits, seen).await,
          Some(acceptor) => {
            if let Ok(stream) = acceptor.accept(stream).await {
              serve_one(stream, handler, hits, seen).await
            }
          }
        }
      });
    }
  });
  Origin { addr, hits, seen }
}

/// TLS client configuration trusting only `root_pem`.
pub fn client_tls(root_pem: &str) -> Arc<rustls::ClientConfig> {
  let mut roots = rustls::RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut root_pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  Arc::new(
    rustls::ClientConfig::builder_with_provider(provider())
      .with_safe_default_protocol_versions()
      .unwrap()
      .with_root_certificates(roots)
      .with_no_client_auth(),
  )
}

/// Recording happens after the response is relayed; wait for it.
pub async fn wait_for_requests(repo: &dyn Repo, count: usize) -> Vec<snare::record::RequestRecord> {
  for _ in 0..100 {
    let all = repo.all_requests().await.unwrap();
    if all.len() >= count {
      return all;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  panic!("expected {} recorded requests", count);
}
