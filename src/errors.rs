//! engine error
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `snare::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while proxying, recording, replaying or scanning.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  Io(#[from] std::io::Error),
  /// TLS error raised by rustls
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// TLS handshake or TLS configuration failure
  #[error("tls error: {0}")]
  Handshake(String),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// Certificate issuance or loading failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// The peer sent something that is not a valid HTTP message
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Dialing or talking to the origin failed
  #[error("connection error: {0}")]
  Connection(String),
  /// An operation ran past its deadline
  #[error("timed out: {0}")]
  Timeout(String),
  /// A stored record does not exist
  #[error("{kind} {id} not found")]
  NotFound {
    /// record kind, `request` or `response`
    kind: &'static str,
    /// the missing id
    id: i64,
  },
  /// The persistence collaborator failed
  #[error("storage error: {0}")]
  Storage(String),
  /// A stored record cannot be turned back into a live request
  #[error("malformed record: {0}")]
  MalformedRecord(String),
  /// Configuration could not be loaded
  #[error("config error: {0}")]
  Config(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a storage error and log it
  pub fn storage_error(msg: impl Into<String>) -> Self {
    let error = Error::Storage(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a malformed record error
  pub fn malformed_record(msg: impl Into<String>) -> Self {
    Error::MalformedRecord(msg.into())
  }

  /// True when the error came from talking to the network rather than from
  /// stored data or local state.
  pub fn is_transport(&self) -> bool {
    matches!(
      self,
      Error::Io(_)
        | Error::Tls(_)
        | Error::Handshake(_)
        | Error::Connection(_)
        | Error::Timeout(_)
    )
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(value: tokio::time::error::Elapsed) -> Self {
    Error::Timeout(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::Io(std::io::Error::new(error_kind, msg.to_string()))
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}
