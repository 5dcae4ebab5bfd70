use http::header::{AUTHORIZATION, COOKIE, LOCATION, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode};

use crate::errors::{Error, Result};

/// A type that controls the policy on how to handle the following of redirects.
///
/// The default value has a maximum of 10 redirects it will follow in a chain
/// before returning the last 3xx response as is.
///
/// - `limited` adjusts the allowed maximum redirect hops in a chain.
/// - `none` disables all redirect behavior; the proxy forwards with it.
/// - `custom` can be used to create a customized policy.
#[derive(Clone, Debug, PartialEq)]
pub enum Policy {
  /// Decide per hop with a function, see [`only_same_origin`].
  Custom(fn(Attempt) -> Action),
  /// Follow at most this many hops.
  Limit(usize),
  /// Never follow.
  None,
}

/// A type that holds information on the next request and previous requests
/// in redirect chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Attempt<'a> {
  status: StatusCode,
  next: &'a http::Uri,
  previous: &'a [http::Uri],
}

/// An action to perform when a redirect status code is found.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
  /// Follow
  Follow,
  /// Stop
  Stop,
}

impl Policy {
  /// Create a `Policy` with a maximum number of redirects, `0` disables
  /// redirects.
  pub fn limited(max: usize) -> Self {
    if max == 0 {
      Policy::None
    } else {
      Policy::Limit(max)
    }
  }
  /// Create a `Policy` that does not follow any redirect.
  pub fn none() -> Self {
    Policy::None
  }
  /// Create a custom `Policy` using the passed function.
  ///
  /// The custom variant has no built-in hop limit; the function has to
  /// stop loops itself by looking at [`Attempt::previous`].
  pub fn custom(policy: fn(Attempt) -> Action) -> Self {
    Policy::Custom(policy)
  }

  pub(crate) fn check(
    &self,
    status: StatusCode,
    next: &http::Uri,
    previous: &[http::Uri],
  ) -> Action {
    let attempt = Attempt {
      status,
      next,
      previous,
    };
    match self {
      Policy::Custom(ref custom) => custom(attempt),
      Policy::Limit(max) => {
        if attempt.previous.len() > *max {
          attempt.stop()
        } else {
          attempt.follow()
        }
      }
      Policy::None => attempt.stop(),
    }
  }
}

impl Default for Policy {
  fn default() -> Policy {
    Policy::limited(10)
  }
}

impl Attempt<'_> {
  /// Get the type of redirect.
  pub fn status(&self) -> StatusCode {
    self.status
  }
  /// Get the next URL to redirect to.
  pub fn url(&self) -> &http::Uri {
    self.next
  }
  /// Get the list of previous URLs that have already been requested in this chain.
  pub fn previous(&self) -> &[http::Uri] {
    self.previous
  }
  /// Returns an action meaning the client should follow the next URL.
  pub fn follow(self) -> Action {
    Action::Follow
  }
  /// Returns an action meaning the client should not follow the next URL.
  ///
  /// The 30x response will be returned as the `Ok` result.
  pub fn stop(self) -> Action {
    Action::Stop
  }
}

/// Follow redirects only while they stay on the same host, up to 10 hops.
pub fn only_same_origin(attempt: Attempt) -> Action {
  match attempt.previous().last() {
    Some(p) if p.host() != attempt.url().host() => attempt.stop(),
    Some(_) if attempt.previous().len() > 10 => attempt.stop(),
    _ => attempt.follow(),
  }
}

/// Resolve the `Location` of a redirect response against the current URL.
pub(crate) fn next_location(headers: &HeaderMap, current: &http::Uri) -> Result<Option<http::Uri>> {
  let location = match headers.get(LOCATION).and_then(|l| l.to_str().ok()) {
    Some(location) => location,
    None => return Ok(None),
  };
  let location = location.split('#').next().unwrap_or_default();
  let scheme = current.scheme_str().unwrap_or("http");
  let authority = current.authority().map(|a| a.as_str()).unwrap_or_default();
  let lower = location.to_ascii_lowercase();
  let next = if lower.starts_with("http://") || lower.starts_with("https://") {
    location.to_string()
  } else if location.starts_with("//") {
    format!("{}:{}", scheme, location)
  } else if location.starts_with('/') {
    format!("{}://{}{}", scheme, authority, location)
  } else if has_scheme(location) {
    return Ok(None);
  } else {
    let path = current.path();
    let dir = &path[..path.rfind('/').map(|i| i + 1).unwrap_or(0)];
    let (relative, query) = match location.split_once('?') {
      Some((relative, query)) => (relative, Some(query)),
      None => (location, None),
    };
    let mut joined = remove_dot_segments(&format!("{}{}", dir, relative));
    if !joined.starts_with('/') {
      joined.insert(0, '/');
    }
    if let Some(query) = query {
      joined.push('?');
      joined.push_str(query);
    }
    format!("{}://{}{}", scheme, authority, joined)
  };
  http::Uri::try_from(next.as_str())
    .map(Some)
    .map_err(|e| Error::invalid_request(format!("invalid redirect location {}: {}", location, e)))
}

fn has_scheme(location: &str) -> bool {
  match location.find(':') {
    Some(i) => location[..i]
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
    None => false,
  }
}

fn remove_dot_segments(path: &str) -> String {
  let mut segments: Vec<&str> = Vec::new();
  for segment in path.split('/') {
    match segment {
      "." => {}
      ".." => {
        if segments.len() > 1 {
          segments.pop();
        }
      }
      s => segments.push(s),
    }
  }
  segments.join("/")
}

pub(crate) fn remove_sensitive_headers(
  headers: &mut HeaderMap,
  next: &http::Uri,
  previous: &[http::Uri],
) {
  if let Some(previous) = previous.last() {
    let cross_host = next.host() != previous.host() || next.port_u16() != previous.port_u16();
    if cross_host {
      headers.remove(AUTHORIZATION);
      headers.remove(COOKIE);
      headers.remove("cookie2");
      headers.remove(PROXY_AUTHORIZATION);
      headers.remove(WWW_AUTHENTICATE);
    }
  }
}
