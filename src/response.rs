use std::fmt::Debug;

use bytes::Bytes;
use http::{HeaderValue, Method, Response as HttpResponse};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::body::{read_chunked, read_sized, read_to_close, trim_line, Body};
use crate::cookies;
use crate::errors::{new_io_error, Error, Result};
use crate::request::{header_content_length, is_chunked, MAX_HEAD_SIZE};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A Response read from an origin, or built locally by the proxy.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  uri: http::Uri,
  status_code: http::StatusCode,
  headers: http::HeaderMap<http::HeaderValue>,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      uri: Default::default(),
      status_code: parts.status,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// Serialize the response in wire form.
  ///
  /// A decoded chunked or close-delimited body is re-framed with
  /// `Content-Length`; every other header is written verbatim.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(format!("{}", self.status_code).as_bytes());
    http_response.extend(CR_LF);
    let mut headers = self.headers.clone();
    if may_have_body(self.status_code)
      && (headers.remove(http::header::TRANSFER_ENCODING).is_some()
        || !headers.contains_key(http::header::CONTENT_LENGTH))
    {
      let length = self.body.as_ref().map(|b| b.len()).unwrap_or_default();
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    for (k, v) in headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_response.extend(b.as_ref());
      }
    }
    Bytes::from(http_response)
  }

  /// Read exactly one final response off an origin connection.
  ///
  /// Interim `1xx` responses other than `101` are skipped. Responses to
  /// `HEAD` and `1xx`, `204`, `304` responses carry no body; otherwise the
  /// body is framed by chunked coding, `Content-Length` or the origin
  /// closing the connection.
  pub async fn read_from<R>(reader: &mut R, method: &Method) -> Result<Response>
  where
    R: AsyncBufRead + Unpin,
  {
    loop {
      let (version, status_code) = read_status_line(reader).await?;
      let headers = read_headers(reader, MAX_HEAD_SIZE).await?;
      if status_code.is_informational() && status_code != http::StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!("skipping interim response {}", status_code);
        continue;
      }
      let body = if method == Method::HEAD || !may_have_body(status_code) {
        Vec::new()
      } else if is_chunked(&headers) {
        read_chunked(reader).await?
      } else if let Some(length) = header_content_length(&headers)? {
        read_sized(reader, length).await?
      } else {
        read_to_close(reader).await?
      };
      return Ok(Response {
        version,
        uri: Default::default(),
        status_code,
        headers,
        body: if body.is_empty() {
          None
        } else {
          Some(body.into())
        },
      });
    }
  }

  /// An HTTP response builder
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }

  /// A plain-text response generated by the proxy itself.
  pub(crate) fn error_page(status_code: http::StatusCode, message: impl Into<String>) -> Response {
    let mut headers = http::HeaderMap::new();
    headers.insert(
      http::header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    let body: Body = message.into().into();
    Response {
      version: http::Version::HTTP_11,
      uri: Default::default(),
      status_code,
      headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// Retrieve the cookies set by the response.
  ///
  /// Note that invalid 'Set-Cookie' headers will be ignored.
  pub fn cookies(&self) -> impl Iterator<Item = cookie::Cookie<'static>> + '_ {
    cookies::extract_response_cookies(&self.headers)
  }
  /// Get the response text, invalid UTF-8 replaced.
  pub fn text(&self) -> String {
    self.body.as_ref().map(|b| b.to_text()).unwrap_or_default()
  }
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> http::StatusCode {
    self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response as announced by the origin.
  ///
  /// `None` when the origin did not send a `Content-Length` header, for
  /// example with a chunked body.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.trim().parse().ok())
  }
  /// Get the final `http::Uri` of this `Response`, after redirects.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  #[inline]
  pub(crate) fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the full response body.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Mutable access to the body.
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
}

fn may_have_body(status_code: http::StatusCode) -> bool {
  !(status_code.is_informational()
    || status_code == http::StatusCode::NO_CONTENT
    || status_code == http::StatusCode::NOT_MODIFIED)
}

pub(crate) fn parser_version(raw: &[u8]) -> Option<http::Version> {
  match raw {
    b"HTTP/0.9" => Some(http::Version::HTTP_09),
    b"HTTP/1.0" => Some(http::Version::HTTP_10),
    b"HTTP/1.1" => Some(http::Version::HTTP_11),
    b"HTTP/2.0" | b"HTTP/2" => Some(http::Version::HTTP_2),
    b"HTTP/3.0" | b"HTTP/3" => Some(http::Version::HTTP_3),
    _ => None,
  }
}

async fn read_status_line<R>(reader: &mut R) -> Result<(http::Version, http::StatusCode)>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  if reader.read_until(b'\n', &mut line).await? == 0 {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "connection closed before the status line",
    ));
  }
  let mut parts = trim_line(&line).splitn(3, |b| b == &b' ');
  let version = parts.next().and_then(parser_version).ok_or_else(|| {
    new_io_error(
      std::io::ErrorKind::InvalidData,
      "invalid http version and status_code data",
    )
  })?;
  let status_code = match parts.next() {
    Some(sc) if !sc.is_empty() => {
      http::StatusCode::from_bytes(sc).map_err(|x| Error::Http(http::Error::from(x)))?
    }
    _ => {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "invalid http version and status_code data",
      ));
    }
  };
  Ok((version, status_code))
}

/// Read header lines up to and including the empty line.
pub(crate) async fn read_headers<R>(reader: &mut R, limit: usize) -> Result<http::HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = http::HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0;
  loop {
    header_line.clear();
    let length = reader.read_until(b'\n', &mut header_line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside the header section",
      ));
    }
    total += length;
    if total > limit {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "header section too large",
      ));
    }
    if trim_line(&header_line).is_empty() {
      break;
    }
    let (k, v) = parser_headers(&header_line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(http::HeaderName, http::HeaderValue)> {
  let buffer = trim_line(buffer);
  let mut split = buffer.splitn(2, |s| s == &b':');
  let (name, value) = match (split.next(), split.next()) {
    (Some(name), Some(value)) => (name, value),
    _ => {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "header line without a colon",
      ))
    }
  };
  let k = http::HeaderName::from_bytes(name)?;
  let v = http::HeaderValue::from_bytes(value.trim_ascii())?;
  Ok((k, v))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use tokio::io::BufReader;

  async fn parse(raw: &[u8], method: Method) -> Result<Response> {
    let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
    Response::read_from(&mut reader, &method).await
  }

  #[tokio::test]
  async fn content_length_response() {
    let resp = parse(
      b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\nSet-Cookie: sid=1; Path=/\r\n\r\nhello trailing",
      Method::GET,
    )
    .await
    .unwrap();
    assert_eq!(resp.status_code(), http::StatusCode::OK);
    assert_eq!(resp.content_length(), Some(5));
    assert_eq!(resp.text(), "hello");
    let cookies: Vec<_> = resp.cookies().collect();
    assert_eq!(cookies.len(), 1);
    assert_eq!(cookies[0].name(), "sid");
  }

  #[tokio::test]
  async fn chunked_response_has_no_content_length_until_reframed() {
    let resp = parse(
      b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
      Method::GET,
    )
    .await
    .unwrap();
    assert_eq!(resp.content_length(), None);
    assert_eq!(resp.text(), "hello");
    let raw = String::from_utf8(resp.to_raw().to_vec()).unwrap();
    assert_eq!(raw, "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello");
  }

  #[tokio::test]
  async fn close_delimited_and_bodyless_responses() {
    let resp = parse(b"HTTP/1.0 200 OK\r\n\r\nuntil close", Method::GET)
      .await
      .unwrap();
    assert_eq!(resp.text(), "until close");
    let resp = parse(b"HTTP/1.1 304 Not Modified\r\nETag: x\r\n\r\n", Method::GET)
      .await
      .unwrap();
    assert!(resp.body().is_none());
    let resp = parse(
      b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
      Method::HEAD,
    )
    .await
    .unwrap();
    assert!(resp.body().is_none());
    assert_eq!(resp.content_length(), Some(10));
    let raw = String::from_utf8(resp.to_raw().to_vec()).unwrap();
    assert!(raw.contains("content-length: 10\r\n"));
  }

  #[tokio::test]
  async fn interim_response_is_skipped() {
    let resp = parse(
      b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok",
      Method::POST,
    )
    .await
    .unwrap();
    assert_eq!(resp.status_code(), http::StatusCode::CREATED);
    assert_eq!(resp.text(), "ok");
  }

  #[tokio::test]
  async fn status_line_without_reason() {
    let resp = parse(b"HTTP/1.1 204\r\n\r\n", Method::DELETE).await.unwrap();
    assert_eq!(resp.status_code(), http::StatusCode::NO_CONTENT);
  }

  #[tokio::test]
  async fn malformed_status_line_is_an_error() {
    assert!(parse(b"SSH-2.0-OpenSSH\r\n\r\n", Method::GET).await.is_err());
  }

  #[test]
  fn header_line_parsing() {
    let (k, v) = parser_headers(b"X-Forwarded-For:  10.0.0.1 \r\n").unwrap();
    assert_eq!(k.as_str(), "x-forwarded-for");
    assert_eq!(v, "10.0.0.1");
    assert!(parser_headers(b"no colon here\r\n").is_err());
  }
}
