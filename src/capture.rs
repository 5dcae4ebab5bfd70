//! Conversions between live messages and records, and the [`Recorder`] the
//! proxy hands every relayed exchange to.
use std::sync::Arc;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Method};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::cookies::{cookie_header, extract_request_cookies};
use crate::errors::{Error, Result};
use crate::record::{HeaderBlock, Param, RequestRecord, ResponseRecord};
use crate::repo::Repo;
use crate::{Request, Response};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Headers a request record keeps elsewhere or drops.
const REQUEST_SKIP: [HeaderName; 4] = [HOST, COOKIE, CONTENT_LENGTH, TRANSFER_ENCODING];

/// Convert a live request into a record with id `0`.
///
/// Post parameters are extracted only for `POST` requests with a form
/// encoded content type; the body is stored either way.
pub fn request_to_record(request: &Request) -> RequestRecord {
  let uri = request.uri();
  let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
  let host = match uri.host() {
    Some(host) => host_with_port(&scheme, host, uri.port_u16()),
    None => request
      .headers()
      .get(HOST)
      .and_then(|h| h.to_str().ok())
      .unwrap_or_default()
      .to_string(),
  };
  let body = request.body().map(|b| b.to_text()).unwrap_or_default();
  let get_params = uri.query().map(parse_params).unwrap_or_default();
  let post_params = if request.method() == Method::POST && is_form(request.headers().get(CONTENT_TYPE)) {
    parse_params(&body)
  } else {
    Vec::new()
  };
  RequestRecord {
    id: 0,
    method: request.method().as_str().to_string(),
    scheme,
    host,
    path: uri.path().to_string(),
    headers: HeaderBlock::from_header_map(request.headers(), &REQUEST_SKIP),
    cookies: extract_request_cookies(request.headers()),
    get_params,
    post_params,
    body,
  }
}

/// Convert a live response into a record owned by `request_id`.
pub fn response_to_record(request_id: i64, response: &Response) -> ResponseRecord {
  ResponseRecord {
    id: 0,
    request_id,
    code: response.status_code().as_u16(),
    content_length: response.content_length(),
    headers: HeaderBlock::from_header_map(response.headers(), &[]),
    cookies: response.cookies().map(|c| (&c).into()).collect(),
    body: response.text(),
  }
}

/// Rebuild a live outgoing request from a record.
///
/// The query is re-encoded from the get parameters and the cookies are
/// joined into one `Cookie` header. With post parameters present the body
/// is the re-encoded form and, unless the record carries its own, the
/// content type is set to form encoding; otherwise the stored body is sent
/// as is.
pub fn record_to_request(record: &RequestRecord) -> Result<Request> {
  let method = Method::from_bytes(record.method.as_bytes())
    .map_err(|e| Error::malformed_record(format!("invalid method {:?}: {}", record.method, e)))?;
  let mut target = record.url();
  if !record.get_params.is_empty() {
    target.push('?');
    target.push_str(&encode_params(&record.get_params));
  }
  let uri = http::Uri::try_from(target.as_str())
    .map_err(|e| Error::malformed_record(format!("invalid url {:?}: {}", target, e)))?;
  let mut headers = record.headers.to_header_map(&REQUEST_SKIP)?;
  if let Some(cookie) = cookie_header(&record.cookies) {
    headers.insert(COOKIE, cookie);
  }
  let body = if !record.post_params.is_empty() {
    if !headers.contains_key(CONTENT_TYPE) {
      headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_URLENCODED));
    }
    encode_params(&record.post_params)
  } else {
    record.body.clone()
  };
  let mut request = Request::default();
  *request.method_mut() = method;
  *request.uri_mut() = uri;
  *request.headers_mut() = headers;
  if !body.is_empty() {
    *request.body_mut() = Some(body.into());
  }
  Ok(request)
}

fn host_with_port(scheme: &str, host: &str, port: Option<u16>) -> String {
  match (scheme, port) {
    (_, None) | ("http", Some(80)) | ("https", Some(443)) => host.to_string(),
    (_, Some(port)) => format!("{}:{}", host, port),
  }
}

fn is_form(content_type: Option<&HeaderValue>) -> bool {
  content_type
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.split(';').next())
    .map(|v| v.trim().eq_ignore_ascii_case(FORM_URLENCODED))
    .unwrap_or(false)
}

// application/x-www-form-urlencoded: everything but `*-._` and
// alphanumerics is escaped, spaces become `+`
const FORM: &AsciiSet = &NON_ALPHANUMERIC.remove(b'*').remove(b'-').remove(b'.').remove(b'_');

fn decode_component(raw: &str) -> String {
  percent_decode_str(&raw.replace('+', " "))
    .decode_utf8_lossy()
    .into_owned()
}

fn encode_component(value: &str) -> String {
  utf8_percent_encode(value, FORM).to_string().replace("%20", "+")
}

fn parse_params(raw: &str) -> Vec<Param> {
  raw
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(|pair| {
      let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
      Param::new(decode_component(key), decode_component(value))
    })
    .collect()
}

fn encode_params(params: &[Param]) -> String {
  params
    .iter()
    .map(|p| format!("{}={}", encode_component(&p.key), encode_component(&p.value)))
    .collect::<Vec<_>>()
    .join("&")
}

/// Saves every relayed exchange through a [`Repo`].
///
/// Recording is best-effort: failures are logged and never reach the
/// proxied client.
#[derive(Clone)]
pub struct Recorder {
  repo: Arc<dyn Repo>,
}

impl Recorder {
  /// Record into `repo`.
  pub fn new(repo: Arc<dyn Repo>) -> Self {
    Recorder { repo }
  }

  /// Save the request record and its response record.
  ///
  /// Returns the new request id, or `None` when the request could not be
  /// saved.
  pub async fn record(&self, request: &Request, response: &Response) -> Option<i64> {
    let record = request_to_record(request);
    let request_id = match self.repo.save_request(&record).await {
      Ok(id) => id,
      Err(e) => {
        tracing::warn!("failed to save request {} {}: {}", record.method, record.url(), e);
        return None;
      }
    };
    let response = response_to_record(request_id, response);
    if let Err(e) = self.repo.save_response(request_id, &response).await {
      tracing::warn!("failed to save response for request {}: {}", request_id, e);
    }
    Some(request_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn live(method: &str, uri: &str, headers: &[(&str, &str)], body: &str) -> Request {
    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
      builder = builder.header(*k, *v);
    }
    builder.body(body.to_string()).unwrap().into()
  }

  #[test]
  fn form_post_becomes_a_record() {
    let request = live(
      "POST",
      "https://example.test:443/login?next=%2Fhome&next=x",
      &[
        ("Host", "example.test"),
        ("Content-Type", "application/x-www-form-urlencoded; charset=UTF-8"),
        ("Content-Length", "22"),
        ("Cookie", "sid=1; theme=dark"),
        ("X-Requested-With", "fetch"),
      ],
      "user=bob&pass=p%40ss+1",
    );
    let record = request_to_record(&request);
    assert_eq!(record.method, "POST");
    assert_eq!(record.scheme, "https");
    assert_eq!(record.host, "example.test");
    assert_eq!(record.path, "/login");
    assert_eq!(
      record.get_params,
      vec![Param::new("next", "/home"), Param::new("next", "x")]
    );
    assert_eq!(
      record.post_params,
      vec![Param::new("user", "bob"), Param::new("pass", "p@ss 1")]
    );
    assert_eq!(record.cookies.len(), 2);
    let names: Vec<_> = record.headers.iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["content-type", "x-requested-with"]);
    assert_eq!(record.body, "user=bob&pass=p%40ss+1");
  }

  #[test]
  fn non_form_bodies_have_no_post_params() {
    let json = live(
      "POST",
      "http://example.test/api",
      &[("Content-Type", "application/json")],
      r#"{"a":1}"#,
    );
    assert!(request_to_record(&json).post_params.is_empty());
    let put = live(
      "PUT",
      "http://example.test/api",
      &[("Content-Type", FORM_URLENCODED)],
      "a=1",
    );
    assert!(request_to_record(&put).post_params.is_empty());
  }

  #[test]
  fn non_default_port_stays_in_host() {
    let request = live("GET", "http://127.0.0.1:8081/", &[], "");
    assert_eq!(request_to_record(&request).host, "127.0.0.1:8081");
  }

  #[test]
  fn record_round_trips_through_a_live_request() {
    let original = live(
      "POST",
      "http://example.test/search?q=foo&page=2",
      &[
        ("Content-Type", FORM_URLENCODED),
        ("Cookie", "sid=1"),
        ("Accept", "*/*"),
      ],
      "term=a+b&x=%27",
    );
    let record = request_to_record(&original);
    let rebuilt = record_to_request(&record).unwrap();
    assert_eq!(rebuilt.uri().to_string(), "http://example.test/search?q=foo&page=2");
    assert_eq!(rebuilt.headers()[COOKIE], "sid=1");
    assert_eq!(rebuilt.headers()[CONTENT_TYPE], FORM_URLENCODED);
    let again = request_to_record(&rebuilt);
    assert_eq!(again.method, record.method);
    assert_eq!(again.scheme, record.scheme);
    assert_eq!(again.host, record.host);
    assert_eq!(again.path, record.path);
    assert_eq!(again.get_params, record.get_params);
    assert_eq!(again.post_params, record.post_params);
    assert_eq!(again.cookies, record.cookies);
    assert_eq!(again.headers, record.headers);
    assert_eq!(again.body, "term=a+b&x=%27");
  }

  #[test]
  fn raw_body_is_kept_without_post_params() {
    let record = RequestRecord {
      method: "PUT".into(),
      scheme: "http".into(),
      host: "example.test".into(),
      path: "/doc".into(),
      body: "plain text".into(),
      ..Default::default()
    };
    let request = record_to_request(&record).unwrap();
    assert_eq!(request.body().unwrap().to_text(), "plain text");
    assert!(request.headers().get(CONTENT_TYPE).is_none());
  }

  #[test]
  fn stored_content_type_wins_over_the_form_default() {
    let mut record = RequestRecord {
      method: "POST".into(),
      scheme: "http".into(),
      host: "example.test".into(),
      path: "/login".into(),
      post_params: vec![Param::new("a", "1")],
      ..Default::default()
    };
    let request = record_to_request(&record).unwrap();
    assert_eq!(request.headers()[CONTENT_TYPE], FORM_URLENCODED);

    record.headers.push("content-type", "'");
    let request = record_to_request(&record).unwrap();
    let values: Vec<_> = request.headers().get_all(CONTENT_TYPE).iter().collect();
    assert_eq!(values, ["'"]);
    assert_eq!(request.body().unwrap().to_text(), "a=1");
  }

  #[test]
  fn bad_stored_method_is_malformed() {
    let record = RequestRecord {
      method: "GE T".into(),
      scheme: "http".into(),
      host: "example.test".into(),
      path: "/".into(),
      ..Default::default()
    };
    assert!(matches!(
      record_to_request(&record),
      Err(Error::MalformedRecord(_))
    ));
  }

  #[test]
  fn response_record_copies_status_length_and_cookies() {
    let response: Response = Response::builder()
      .status(404)
      .header("Content-Length", "9")
      .header("Set-Cookie", "seen=1; Path=/")
      .body("not found".to_string())
      .unwrap()
      .into();
    let record = response_to_record(3, &response);
    assert_eq!(record.request_id, 3);
    assert_eq!(record.code, 404);
    assert_eq!(record.content_length, Some(9));
    assert_eq!(record.cookies[0].name, "seen");
    assert_eq!(record.headers.len(), 2);
    assert_eq!(record.body, "not found");
  }
}
