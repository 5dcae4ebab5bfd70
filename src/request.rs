use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::body::{read_chunked, read_sized, trim_line, Body};
use crate::errors::{Error, Result};
use crate::response::{parser_version, read_headers};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Upper bound for the request line plus all header lines.
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// A live HTTP/1.1 request, either read off a client connection or built
/// from a stored record for replay.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Serialize the request in wire form.
  ///
  /// The request target is written in origin-form, a `Host` header is added
  /// when missing and a decoded body is re-framed with `Content-Length`.
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    let path = self.uri.path();
    http_requests.extend(if path.is_empty() { "/" } else { path }.as_bytes());
    if let Some(q) = self.uri.query() {
      http_requests.extend(b"?");
      http_requests.extend(q.as_bytes());
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      http_requests.extend(http::header::HOST.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      if let Some(s) = self.uri.authority() {
        http_requests.extend(s.as_str().as_bytes());
      }
      http_requests.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    headers.remove(http::header::TRANSFER_ENCODING);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(b.len()));
      }
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_requests.extend(b.as_ref());
      }
    }
    Bytes::from(http_requests)
  }

  /// Read exactly one request off a client connection.
  ///
  /// The body is framed by `Transfer-Encoding: chunked` or `Content-Length`;
  /// without either the request has no body. `CONNECT` never carries one.
  pub async fn read_from<R>(reader: &mut R) -> Result<Request>
  where
    R: AsyncBufRead + Unpin,
  {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(Error::invalid_request(
        "connection closed before the request line",
      ));
    }
    if line.len() > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("request line too long"));
    }
    let mut parts = trim_line(&line).splitn(3, |b| b == &b' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() => (m, t, v),
      _ => {
        return Err(Error::invalid_request(format!(
          "malformed request line: {}",
          line.escape_ascii()
        )))
      }
    };
    let method = Method::from_bytes(method)
      .map_err(|e| Error::invalid_request(format!("invalid method: {e}")))?;
    let uri = http::Uri::try_from(target)
      .map_err(|e| Error::invalid_request(format!("invalid request target: {e}")))?;
    let version = parser_version(version)
      .ok_or_else(|| Error::invalid_request("invalid http version"))?;
    let headers = read_headers(reader, MAX_HEAD_SIZE - line.len())
      .await
      .map_err(|e| Error::invalid_request(e.to_string()))?;
    let body = if method == Method::CONNECT {
      Vec::new()
    } else if is_chunked(&headers) {
      read_chunked(reader).await?
    } else if let Some(length) = header_content_length(&headers)? {
      read_sized(reader, length).await?
    } else {
      Vec::new()
    };
    Ok(Request {
      uri,
      version,
      method,
      headers,
      body: if body.is_empty() {
        None
      } else {
        Some(body.into())
      },
    })
  }

  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// The HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Mutable access to the HTTP method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// The request target as it was received or built.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Mutable access to the request target.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// The request headers.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Mutable access to the request headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// The decoded body, `None` when the request has none.
  #[inline]
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Mutable access to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Returns the associated version.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Returns a mutable reference to the associated version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
}

pub(crate) fn header_content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(v) => {
      let length = v
        .to_str()
        .map_err(|_| Error::invalid_request("invalid content-length"))?
        .trim()
        .parse::<u64>()?;
      Ok(Some(length))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use tokio::io::BufReader;

  async fn parse(raw: &[u8]) -> Result<Request> {
    let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
    Request::read_from(&mut reader).await
  }

  #[tokio::test]
  async fn absolute_form_request_is_parsed() {
    let req = parse(
      b"POST http://example.test/login?next=%2F HTTP/1.1\r\nHost: example.test\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 9\r\nProxy-Connection: keep-alive\r\n\r\nuser=bob&",
    )
    .await
    .unwrap();
    assert_eq!(req.method(), Method::POST);
    assert_eq!(req.uri().host(), Some("example.test"));
    assert_eq!(req.uri().query(), Some("next=%2F"));
    assert_eq!(req.version(), Version::HTTP_11);
    assert_eq!(req.body().unwrap().as_ref(), b"user=bob&");
    assert!(req.headers().contains_key("proxy-connection"));
  }

  #[tokio::test]
  async fn connect_request_has_authority_target() {
    let req = parse(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
      .await
      .unwrap();
    assert_eq!(req.method(), Method::CONNECT);
    assert_eq!(req.uri().host(), Some("example.test"));
    assert_eq!(req.uri().port_u16(), Some(443));
    assert!(req.body().is_none());
  }

  #[tokio::test]
  async fn chunked_request_is_reframed_with_content_length() {
    let req = parse(
      b"PUT /upload HTTP/1.1\r\nHost: a.test\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
    )
    .await
    .unwrap();
    let raw = String::from_utf8(req.to_raw().to_vec()).unwrap();
    assert!(raw.starts_with("PUT /upload HTTP/1.1\r\n"));
    assert!(raw.contains("content-length: 3\r\n"));
    assert!(!raw.contains("transfer-encoding"));
    assert!(raw.ends_with("\r\n\r\nabc"));
  }

  #[tokio::test]
  async fn garbage_request_line_is_rejected() {
    assert!(matches!(
      parse(b"NONSENSE\r\n\r\n").await,
      Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(parse(b"").await, Err(Error::InvalidRequest(_))));
  }

  #[test]
  fn to_raw_uses_origin_form_and_adds_host() {
    let req: Request = Request::builder()
      .method("GET")
      .uri("http://example.test:8080/search?q=foo")
      .header("Accept", "*/*")
      .body(Vec::<u8>::new())
      .unwrap()
      .into();
    let raw = String::from_utf8(req.to_raw().to_vec()).unwrap();
    assert_eq!(
      raw,
      "GET /search?q=foo HTTP/1.1\r\nhost: example.test:8080\r\naccept: */*\r\n\r\n"
    );
  }
}
