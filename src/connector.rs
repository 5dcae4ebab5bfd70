use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use tokio::net::TcpSocket;
use tokio_rustls::TlsConnector;

use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls::{self, Certificate};

/// ConnectorBuilder
#[derive(Clone)]
pub struct ConnectorBuilder {
  accept_invalid_certs: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  certificate: Vec<Certificate>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      accept_invalid_certs: false,
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      certificate: vec![],
    }
  }
}

impl ConnectorBuilder {
  /// Controls the use of certificate validation on origin connections.
  ///
  /// Defaults to `false`.
  ///
  /// # Warning
  ///
  /// If invalid certificates are trusted, *any* certificate for *any* site
  /// will be trusted for use, including expired certificates.
  pub fn accept_invalid_certs(mut self, value: bool) -> ConnectorBuilder {
    self.accept_invalid_certs = value;
    self
  }
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Adds certificates to the set of roots that the connector will trust.
  pub fn certificate(mut self, value: Vec<Certificate>) -> ConnectorBuilder {
    self.certificate.extend(value);
    self
  }
  /// Enables a read timeout.
  ///
  /// Bounds reading one whole response. Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
}

impl ConnectorBuilder {
  /// Combine the configuration of this builder with a connector to create a `Connector`.
  pub fn build(&self) -> Result<Connector> {
    let tls = tls::client_config(&self.certificate, self.accept_invalid_certs)?;
    Ok(Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      tls: TlsConnector::from(tls),
    })
  }
}

/// Opens origin connections: DNS resolution, TCP connect, TLS upgrade.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish()
  }
}

impl Connector {
  /// A builder with the default timeouts and the platform trust roots.
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }

  /// Resolve `host` and connect to the first address that accepts.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((bare, port))
      .await
      .map_err(|e| Error::connection_error(format!("failed to resolve {}: {}", host, e)))?
      .collect();
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => {
          tracing::debug!("connected to {} ({})", host, addr);
          return Ok(socket);
        }
        Err(e) => last_error = Some(e),
      }
    }
    Err(match last_error {
      Some(e) => Error::connection_error(format!("failed to connect to {}:{}: {}", host, port, e)),
      None => Error::connection_error(format!("no address found for {}", host)),
    })
  }

  /// Connect to the authority of `target`, upgrading to TLS for `https`.
  pub async fn connect_with_uri(&self, target: &http::Uri) -> Result<Socket> {
    let host = target
      .host()
      .ok_or_else(|| Error::invalid_request(format!("missing host in {}", target)))?;
    let https = target.scheme() == Some(&http::uri::Scheme::HTTPS);
    let port = target
      .port_u16()
      .unwrap_or(if https { 443 } else { 80 });
    let socket = self.connect(host, port).await?;
    if https {
      self.upgrade_to_tls(socket, host).await
    } else {
      Ok(socket)
    }
  }

  /// Run the client side TLS handshake on an established connection.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = tls::server_name(domain)?;
    let this = self.tls.clone();
    let handshake = stream.tls(move |t| async move { this.connect(domain, t).await });
    let tls = match self.connect_timeout {
      None => handshake.await,
      Some(timeout) => tokio::time::timeout(timeout, handshake).await?,
    }
    .map_err(|e| Error::tls_error(format!("origin handshake failed: {}", e)))?;
    Ok(tls)
  }
}
