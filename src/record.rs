//! Stored forms of captured traffic.
//!
//! Records are plain values: a [`RequestRecord`] is never updated once a
//! repository assigned its id, and every replay stores a new one.
use std::fmt;

use http::{HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Characters escaped in header names: the entry delimiter `:` and space.
const NAME_ESCAPE: &AsciiSet = &CONTROLS.add(b'%').add(b':').add(b' ');
/// Characters escaped in header values, CR and LF among the controls.
const VALUE_ESCAPE: &AsciiSet = &CONTROLS.add(b'%');

/// A query or form parameter. Keys repeat when the source repeated them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
  /// parameter name
  pub key: String,
  /// parameter value, decoded
  pub value: String,
}

impl Param {
  /// Build a parameter from anything string-like.
  pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
    Param {
      key: key.into(),
      value: value.into(),
    }
  }
}

/// A cookie as sent in a `Cookie` header or set by `Set-Cookie`.
///
/// Request cookies carry only name and value; the attributes are filled for
/// response cookies and kept untouched when a value is mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
  /// cookie name
  pub name: String,
  /// cookie value
  pub value: String,
  /// `Path` attribute
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  /// `Domain` attribute
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub domain: Option<String>,
  /// `Max-Age` attribute in seconds
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_age: Option<i64>,
  /// `Expires` attribute as a unix timestamp
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires: Option<i64>,
  /// `Secure` attribute
  #[serde(default)]
  pub secure: bool,
  /// `HttpOnly` attribute
  #[serde(default)]
  pub http_only: bool,
  /// `SameSite` attribute
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub same_site: Option<String>,
}

impl Cookie {
  /// A cookie with only a name and a value.
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
    Cookie {
      name: name.into(),
      value: value.into(),
      ..Default::default()
    }
  }
}

/// Ordered header entries, original order and multiplicity preserved.
///
/// Stored as one `name: value` line per entry with `%`, control characters
/// and, in names, `:` and space percent-escaped, which makes the encoding
/// lossless. [`HeaderBlock::to_flat`] and [`HeaderBlock::from_flat`] speak the
/// older space separated format, which is lossy for values containing a
/// newline and for names containing a space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct HeaderBlock {
  entries: Vec<(String, String)>,
}

impl HeaderBlock {
  /// An empty block.
  pub fn new() -> Self {
    Self::default()
  }

  /// Append one entry.
  pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.entries.push((name.into(), value.into()));
  }

  /// Iterate entries in order.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }

  /// First value of `name`, compared case-insensitively.
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Number of entries.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// True when the block has no entry.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Replace the value of the entry at `index`.
  pub(crate) fn set_value(&mut self, index: usize, value: impl Into<String>) {
    if let Some(entry) = self.entries.get_mut(index) {
      entry.1 = value.into();
    }
  }

  /// Copy a header map, leaving out the headers named in `skip`.
  ///
  /// Values that are not valid UTF-8 are stored with replacement characters.
  pub fn from_header_map(headers: &HeaderMap, skip: &[HeaderName]) -> Self {
    let entries = headers
      .iter()
      .filter(|(name, _)| !skip.contains(name))
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).to_string(),
        )
      })
      .collect();
    HeaderBlock { entries }
  }

  /// Rebuild a header map, leaving out the headers named in `skip`.
  pub fn to_header_map(&self, skip: &[HeaderName]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(self.entries.len());
    for (name, value) in &self.entries {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::malformed_record(format!("invalid header name {:?}: {}", name, e)))?;
      if skip.contains(&name) {
        continue;
      }
      let value = HeaderValue::from_str(value)
        .map_err(|e| Error::malformed_record(format!("invalid value for {}: {}", name, e)))?;
      headers.append(name, value);
    }
    Ok(headers)
  }

  /// Storage encoding, one escaped `name: value` line per entry.
  pub fn encode(&self) -> String {
    self
      .entries
      .iter()
      .map(|(name, value)| {
        format!(
          "{}: {}\n",
          utf8_percent_encode(name, NAME_ESCAPE),
          utf8_percent_encode(value, VALUE_ESCAPE)
        )
      })
      .collect()
  }

  /// Inverse of [`HeaderBlock::encode`].
  pub fn decode(encoded: &str) -> Result<Self> {
    let mut entries = Vec::new();
    for line in encoded.split('\n').filter(|l| !l.is_empty()) {
      let (name, value) = line
        .split_once(": ")
        .ok_or_else(|| Error::malformed_record(format!("header line without delimiter: {line:?}")))?;
      entries.push((unescape(name)?, unescape(value)?));
    }
    Ok(HeaderBlock { entries })
  }

  /// Legacy flat encoding: `name value` lines joined by newlines.
  pub fn to_flat(&self) -> String {
    self
      .entries
      .iter()
      .map(|(name, value)| format!("{} {}", name, value))
      .collect::<Vec<_>>()
      .join("\n")
  }

  /// Parse the legacy flat encoding; the value is everything after the
  /// first space of a line.
  pub fn from_flat(flat: &str) -> Self {
    let entries = flat
      .lines()
      .filter(|l| !l.is_empty())
      .map(|line| match line.split_once(' ') {
        Some((name, value)) => (name.to_string(), value.to_string()),
        None => (line.to_string(), String::new()),
      })
      .collect();
    HeaderBlock { entries }
  }
}

fn unescape(raw: &str) -> Result<String> {
  percent_decode_str(raw)
    .decode_utf8()
    .map(|s| s.into_owned())
    .map_err(|e| Error::malformed_record(format!("invalid escape in {raw:?}: {e}")))
}

impl From<HeaderBlock> for String {
  fn from(value: HeaderBlock) -> Self {
    value.encode()
  }
}

impl TryFrom<String> for HeaderBlock {
  type Error = Error;

  fn try_from(value: String) -> Result<Self> {
    HeaderBlock::decode(&value)
  }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderBlock {
  fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
    HeaderBlock {
      entries: iter
        .into_iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect(),
    }
  }
}

/// A captured request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
  /// repository assigned id, `0` until stored
  pub id: i64,
  /// request method
  pub method: String,
  /// `http` or `https`
  pub scheme: String,
  /// `host[:port]`, the scheme's default port omitted
  pub host: String,
  /// request path without the query
  pub path: String,
  /// headers other than `Host`, `Cookie` and message framing
  pub headers: HeaderBlock,
  /// cookies of the `Cookie` header
  pub cookies: Vec<Cookie>,
  /// query parameters in encounter order
  pub get_params: Vec<Param>,
  /// form parameters, only for form encoded `POST` requests
  pub post_params: Vec<Param>,
  /// raw body
  pub body: String,
}

impl RequestRecord {
  /// `scheme://host/path` without the query.
  pub fn url(&self) -> String {
    format!("{}://{}{}", self.scheme, self.host, self.path)
  }
}

impl fmt::Display for RequestRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{} {} {}", self.id, self.method, self.url())
  }
}

/// A captured response, weakly linked to the request that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
  /// repository assigned id, `0` until stored
  pub id: i64,
  /// id of the owning request record
  pub request_id: i64,
  /// status code
  pub code: u16,
  /// announced `Content-Length`, `None` when the origin sent none
  pub content_length: Option<u64>,
  /// all headers, verbatim
  pub headers: HeaderBlock,
  /// cookies set by the response
  pub cookies: Vec<Cookie>,
  /// raw body
  pub body: String,
}
