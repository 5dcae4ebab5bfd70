use bytes::Bytes;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};

use crate::record;

/// Cookies sent by a client, from every `Cookie` header, in order.
///
/// Malformed pairs are skipped.
pub(crate) fn extract_request_cookies(headers: &HeaderMap) -> Vec<record::Cookie> {
  headers
    .get_all(COOKIE)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| cookie::Cookie::split_parse(v.to_string()))
    .filter_map(|c| c.ok())
    .map(|c| record::Cookie::new(c.name(), c.value()))
    .collect()
}

/// Cookies set by a response. Invalid `Set-Cookie` headers are ignored.
pub(crate) fn extract_response_cookies(
  headers: &HeaderMap,
) -> impl Iterator<Item = cookie::Cookie<'static>> + '_ {
  headers
    .get_all(SET_COOKIE)
    .iter()
    .filter_map(|v| std::str::from_utf8(v.as_bytes()).ok())
    .filter_map(|v| cookie::Cookie::parse(v.to_string()).ok())
}

/// Render a single `Cookie` header from name/value pairs, `a=1; b=2`.
pub(crate) fn cookie_header(cookies: &[record::Cookie]) -> Option<HeaderValue> {
  if cookies.is_empty() {
    return None;
  }
  let s = cookies
    .iter()
    .map(|c| format!("{}={}", c.name, c.value))
    .collect::<Vec<_>>()
    .join("; ");
  HeaderValue::from_maybe_shared(Bytes::from(s)).ok()
}

impl From<&cookie::Cookie<'_>> for record::Cookie {
  fn from(c: &cookie::Cookie<'_>) -> Self {
    record::Cookie {
      name: c.name().to_string(),
      value: c.value().to_string(),
      path: c.path().map(str::to_string),
      domain: c.domain().map(str::to_string),
      max_age: c.max_age().map(|d| d.whole_seconds()),
      expires: c.expires_datetime().map(|d| d.unix_timestamp()),
      secure: c.secure().unwrap_or(false),
      http_only: c.http_only().unwrap_or(false),
      same_site: c.same_site().map(|s| s.to_string()),
    }
  }
}
