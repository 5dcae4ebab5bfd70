use std::sync::Arc;
use std::time::Duration;

use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderValue, Method, StatusCode};

use crate::connector::{Connector, ConnectorBuilder};
use crate::errors::Result;
use crate::redirect::{next_location, remove_sensitive_headers, Action, Policy};
use crate::tls::Certificate;
use crate::{Request, Response};

/// An HTTP/1.1 client that opens a fresh origin connection per exchange.
///
/// Clients are built explicitly with [`ClientBuilder`] wherever one is
/// needed; there is no shared default client, and nothing is pooled.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn run() -> Result<(), snare::Error> {
/// let client = snare::Client::builder()
///     .timeout(Some(std::time::Duration::from_secs(10)))
///     .build()?;
/// let request: snare::Request = snare::Request::builder()
///     .uri("http://example.test/")
///     .body(Vec::<u8>::new())?
///     .into();
/// let response = client.execute(request).await?;
/// println!("{}", response.status_code());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
  inner: Arc<ClientRef>,
}

#[derive(Debug)]
struct ClientRef {
  timeout: Option<Duration>,
  connector: Arc<Connector>,
  redirect_policy: Policy,
}

impl Client {
  /// Creates a `ClientBuilder` to configure a `Client`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::default()
  }

  /// The connector used for origin connections.
  pub fn connector(&self) -> Arc<Connector> {
    self.inner.connector.clone()
  }

  /// Send one request on a new connection and read one response, without
  /// following redirects.
  ///
  /// The whole exchange is bounded by the client timeout.
  pub async fn round_trip(&self, request: &Request) -> Result<Response> {
    let exchange = self.exchange(request);
    match self.inner.timeout {
      None => exchange.await,
      Some(t) => tokio::time::timeout(t, exchange).await?,
    }
  }

  async fn exchange(&self, request: &Request) -> Result<Response> {
    let mut socket = self.inner.connector.connect_with_uri(request.uri()).await?;
    let mut outgoing = request.clone();
    // the connection is never reused
    outgoing
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));
    socket.write_all(&outgoing.to_raw()).await?;
    socket.flush().await?;
    let mut response = socket.read_response(request.method()).await?;
    *response.uri_mut() = request.uri().clone();
    tracing::debug!(
      "{} {} -> {}",
      request.method(),
      request.uri(),
      response.status_code()
    );
    Ok(response)
  }

  /// Executes a `Request`, following redirects according to the client's
  /// [`Policy`].
  ///
  /// `301`, `302` and `303` switch a non-`GET`/`HEAD` request to `GET` and
  /// drop its body; `307` and `308` resend method and body unchanged.
  /// Credentials are removed when a redirect leaves the host.
  pub async fn execute<R: Into<Request>>(&self, request: R) -> Result<Response> {
    let mut request = request.into();
    let mut uris: Vec<http::Uri> = vec![];
    loop {
      let response = self.round_trip(&request).await?;
      let status = response.status_code();
      let rewrite_to_get = match status {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => true,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => false,
        _ => return Ok(response),
      };
      let next = match next_location(response.headers(), request.uri())? {
        Some(next) => next,
        None => return Ok(response),
      };
      uris.push(request.uri().clone());
      if self.inner.redirect_policy.check(status, &next, &uris) == Action::Stop {
        return Ok(response);
      }
      tracing::debug!("following {} redirect to {}", status.as_u16(), next);
      if rewrite_to_get && !matches!(request.method(), &Method::GET | &Method::HEAD) {
        *request.method_mut() = Method::GET;
        *request.body_mut() = None;
        for header in &[TRANSFER_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, CONTENT_LENGTH] {
          request.headers_mut().remove(header);
        }
      }
      remove_sensitive_headers(request.headers_mut(), &next, &uris);
      if next.authority() != request.uri().authority() {
        request.headers_mut().remove(http::header::HOST);
      }
      *request.uri_mut() = next;
    }
  }
}

/// A `ClientBuilder` can be used to create a `Client` with custom configuration.
///
/// # Example
///
/// ```
/// # fn run() -> Result<(), snare::Error> {
/// use std::time::Duration;
///
/// let client = snare::Client::builder()
///     .timeout(Some(Duration::from_secs(10)))
///     .redirect(snare::redirect::Policy::none())
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[must_use]
#[derive(Clone, Debug)]
pub struct ClientBuilder {
  timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  redirect_policy: Policy,
  accept_invalid_certs: bool,
  root_certs: Vec<Certificate>,
  connector: Option<Arc<Connector>>,
}

impl Default for ClientBuilder {
  fn default() -> Self {
    Self {
      timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      redirect_policy: Policy::default(),
      accept_invalid_certs: false,
      root_certs: vec![],
      connector: None,
    }
  }
}

impl ClientBuilder {
  /// Returns a `Client` that uses this `ClientBuilder` configuration.
  ///
  /// # Errors
  ///
  /// This method fails if the TLS configuration cannot be initialized.
  pub fn build(self) -> Result<Client> {
    let connector = match self.connector {
      Some(connector) => connector,
      None => Arc::new(
        ConnectorBuilder::default()
          .connect_timeout(self.connect_timeout)
          .read_timeout(self.timeout)
          .write_timeout(self.timeout)
          .accept_invalid_certs(self.accept_invalid_certs)
          .certificate(self.root_certs)
          .build()?,
      ),
    };
    Ok(Client {
      inner: Arc::new(ClientRef {
        timeout: self.timeout,
        connector,
        redirect_policy: self.redirect_policy,
      }),
    })
  }
  /// Set a `redirect::Policy` for this client.
  ///
  /// Default will follow redirects up to a maximum of 10.
  pub fn redirect(mut self, policy: Policy) -> ClientBuilder {
    self.redirect_policy = policy;
    self
  }
  /// Set a timeout for one whole exchange of a `Client`.
  ///
  /// Default is 30 seconds. Pass `None` to disable timeout.
  pub fn timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase of a `Client`.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Add a custom root certificate.
  ///
  /// This allows connecting to a server that has a self-signed
  /// certificate for example.
  pub fn add_root_certificate(mut self, cert: Certificate) -> ClientBuilder {
    self.root_certs.push(cert);
    self
  }
  /// Controls the use of certificate validation.
  ///
  /// Defaults to `false`.
  ///
  /// # Warning
  ///
  /// You should think very carefully before using this method. If
  /// invalid certificates are trusted, *any* certificate for *any* site
  /// will be trusted for use.
  pub fn danger_accept_invalid_certs(mut self, accept_invalid_certs: bool) -> ClientBuilder {
    self.accept_invalid_certs = accept_invalid_certs;
    self
  }
  /// Use an existing connector instead of building one; the connect
  /// timeout and certificate settings of this builder are then ignored.
  pub fn connector(mut self, connector: Arc<Connector>) -> ClientBuilder {
    self.connector = Some(connector);
    self
  }
}
