//! Quote-injection probing of stored requests.
//!
//! Every injection point of a stored request is probed with `'` and then
//! `"`. A point is flagged when the probe's status code or announced
//! content length differs from the baseline; the first flagged point ends
//! the scan. Probes are sent one at a time and each one is rendered fresh
//! from the stored record, which is never modified.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::record_to_request;
use crate::errors::{Error, Result};
use crate::record::{RequestRecord, ResponseRecord};
use crate::replay::Replayer;
use crate::Response;

/// Probe payloads, in the order they are tried.
pub const PAYLOADS: [&str; 2] = ["'", "\""];

/// What probe responses are compared against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselinePolicy {
  /// Replay the request once before probing and compare with that response.
  #[default]
  Replay,
  /// Compare with the response stored with the request.
  Stored,
}

/// Where an injection point lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
  /// query parameter
  GetParam,
  /// form parameter of a `POST`
  PostParam,
  /// request cookie
  Cookie,
  /// request header
  Header,
}

impl fmt::Display for Location {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Location::GetParam => "GetParam",
      Location::PostParam => "PostParam",
      Location::Cookie => "Cookie",
      Location::Header => "Header",
    })
  }
}

/// The part of a response the detection compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
  /// status code
  pub code: u16,
  /// announced content length
  pub content_length: Option<u64>,
}

impl From<&ResponseRecord> for Shape {
  fn from(record: &ResponseRecord) -> Self {
    Shape {
      code: record.code,
      content_length: record.content_length,
    }
  }
}

impl From<&Response> for Shape {
  fn from(response: &Response) -> Self {
    Shape {
      code: response.status_code().as_u16(),
      content_length: response.content_length(),
    }
  }
}

/// The first injection point whose probe changed the response shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
  /// kind of the point
  pub location: Location,
  /// parameter, cookie or header name
  pub name: String,
  /// payload that triggered the difference
  pub payload: String,
  /// baseline shape
  pub baseline: Shape,
  /// shape of the flagged probe
  pub observed: Shape,
}

impl fmt::Display for Finding {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "vulnerable parameter: {} {}", self.location, self.name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Point {
  GetParam(String),
  PostParam(String),
  Cookie(usize),
  Header(usize),
}

impl Point {
  fn location(&self) -> Location {
    match self {
      Point::GetParam(_) => Location::GetParam,
      Point::PostParam(_) => Location::PostParam,
      Point::Cookie(_) => Location::Cookie,
      Point::Header(_) => Location::Header,
    }
  }

  fn name(&self, record: &RequestRecord) -> String {
    match self {
      Point::GetParam(key) | Point::PostParam(key) => key.clone(),
      Point::Cookie(index) => record.cookies[*index].name.clone(),
      Point::Header(index) => record
        .headers
        .iter()
        .nth(*index)
        .map(|(name, _)| name.to_string())
        .unwrap_or_default(),
    }
  }

  /// A copy of `record` with this point set to `payload`. Every occurrence
  /// of a repeated parameter key is replaced.
  fn apply(&self, record: &RequestRecord, payload: &str) -> RequestRecord {
    let mut mutated = record.clone();
    match self {
      Point::GetParam(key) => mutated
        .get_params
        .iter_mut()
        .filter(|p| &p.key == key)
        .for_each(|p| p.value = payload.to_string()),
      Point::PostParam(key) => mutated
        .post_params
        .iter_mut()
        .filter(|p| &p.key == key)
        .for_each(|p| p.value = payload.to_string()),
      Point::Cookie(index) => mutated.cookies[*index].value = payload.to_string(),
      Point::Header(index) => mutated.headers.set_value(*index, payload),
    }
    mutated
  }
}

fn distinct_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<String> {
  let mut seen: Vec<String> = Vec::new();
  for key in keys {
    if !seen.iter().any(|k| k == key) {
      seen.push(key.to_string());
    }
  }
  seen
}

/// Injection points in traversal order: query keys, form keys (`POST`
/// only), cookies, headers.
fn injection_points(record: &RequestRecord) -> Vec<Point> {
  let mut points: Vec<Point> = distinct_keys(record.get_params.iter().map(|p| p.key.as_str()))
    .into_iter()
    .map(Point::GetParam)
    .collect();
  if record.method.eq_ignore_ascii_case("POST") {
    points.extend(
      distinct_keys(record.post_params.iter().map(|p| p.key.as_str()))
        .into_iter()
        .map(Point::PostParam),
    );
  }
  points.extend((0..record.cookies.len()).map(Point::Cookie));
  points.extend((0..record.headers.len()).map(Point::Header));
  points
}

/// Probes stored requests for quote injection.
#[derive(Clone)]
pub struct Scanner {
  replayer: Replayer,
  baseline: BaselinePolicy,
}

impl Scanner {
  /// Scan with `replayer`, comparing against a fresh replay.
  pub fn new(replayer: Replayer) -> Self {
    Scanner {
      replayer,
      baseline: BaselinePolicy::default(),
    }
  }

  /// Choose the baseline.
  pub fn baseline(mut self, policy: BaselinePolicy) -> Self {
    self.baseline = policy;
    self
  }

  /// The replayer used for baselines.
  pub fn replayer(&self) -> &Replayer {
    &self.replayer
  }

  /// Scan request `request_id`.
  ///
  /// Returns the first flagged point, or `None` when no probe changed the
  /// response shape. A failed probe aborts the scan with its error.
  pub async fn scan(&self, request_id: i64) -> Result<Option<Finding>> {
    let repo = self.replayer.repo();
    let record = repo.get_request(request_id).await?;
    let baseline = match self.baseline {
      BaselinePolicy::Replay => Shape::from(&self.replayer.repeat(request_id).await?),
      BaselinePolicy::Stored => repo
        .response_for_request(request_id)
        .await?
        .map(|r| Shape::from(&r))
        .ok_or(Error::NotFound {
          kind: "response",
          id: request_id,
        })?,
    };
    let client = self.replayer.client()?;
    let points = injection_points(&record);
    tracing::info!(
      "scanning {} at {} points against {:?}",
      record,
      points.len(),
      baseline
    );
    for point in &points {
      for payload in PAYLOADS {
        let probe = record_to_request(&point.apply(&record, payload))?;
        let response = client.execute(probe).await?;
        let observed = Shape::from(&response);
        if observed != baseline {
          let finding = Finding {
            location: point.location(),
            name: point.name(&record),
            payload: payload.to_string(),
            baseline,
            observed,
          };
          tracing::info!("{} of {} with {}", finding, record, payload);
          return Ok(Some(finding));
        }
      }
    }
    tracing::info!("no finding for {}", record);
    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{Cookie, HeaderBlock, Param};

  const FORM_URLENCODED_TYPE: &str = "application/x-www-form-urlencoded";

  fn record() -> RequestRecord {
    let headers: HeaderBlock = [("accept", "*/*"), ("x-token", "abc")].into_iter().collect();
    RequestRecord {
      id: 1,
      method: "POST".into(),
      scheme: "http".into(),
      host: "example.test".into(),
      path: "/search".into(),
      headers,
      cookies: vec![Cookie::new("sid", "1")],
      get_params: vec![
        Param::new("q", "foo"),
        Param::new("page", "2"),
        Param::new("q", "bar"),
      ],
      post_params: vec![Param::new("term", "x")],
      body: "term=x".into(),
    }
  }

  #[test]
  fn points_follow_the_traversal_order() {
    let points = injection_points(&record());
    assert_eq!(
      points,
      vec![
        Point::GetParam("q".into()),
        Point::GetParam("page".into()),
        Point::PostParam("term".into()),
        Point::Cookie(0),
        Point::Header(0),
        Point::Header(1),
      ]
    );
    let mut get = record();
    get.method = "GET".into();
    assert!(!injection_points(&get)
      .iter()
      .any(|p| matches!(p, Point::PostParam(_))));
  }

  #[test]
  fn mutation_touches_only_its_point() {
    let original = record();
    let mutated = Point::GetParam("q".into()).apply(&original, "'");
    let values: Vec<_> = mutated.get_params.iter().map(|p| p.value.as_str()).collect();
    assert_eq!(values, ["'", "2", "'"]);
    assert_eq!(mutated.cookies, original.cookies);
    assert_eq!(mutated.headers, original.headers);

    let cookie = Point::Cookie(0).apply(&original, "\"");
    assert_eq!(cookie.cookies[0].value, "\"");
    assert_eq!(cookie.get_params, original.get_params);

    let header = Point::Header(1).apply(&original, "'");
    assert_eq!(header.headers.get("x-token"), Some("'"));
    assert_eq!(header.headers.get("accept"), Some("*/*"));
    assert_eq!(Point::Header(1).name(&original), "x-token");
    assert_eq!(record(), original);
  }

  #[test]
  fn probes_render_as_requests() {
    let original = record();
    let probe = record_to_request(&Point::PostParam("term".into()).apply(&original, "'")).unwrap();
    assert_eq!(probe.body().unwrap().to_text(), "term=%27");
    let probe = record_to_request(&Point::GetParam("page".into()).apply(&original, "\"")).unwrap();
    assert_eq!(probe.uri().query(), Some("q=foo&page=%22&q=bar"));
  }

  #[test]
  fn content_type_of_a_form_post_is_mutated() {
    let mut original = record();
    original.headers = [("content-type", FORM_URLENCODED_TYPE)].into_iter().collect();
    for payload in PAYLOADS {
      let probe = record_to_request(&Point::Header(0).apply(&original, payload)).unwrap();
      assert_eq!(probe.headers()[http::header::CONTENT_TYPE], payload);
      assert_eq!(probe.body().unwrap().to_text(), "term=x");
    }
  }

  #[test]
  fn finding_text() {
    let finding = Finding {
      location: Location::GetParam,
      name: "q".into(),
      payload: "'".into(),
      baseline: Shape {
        code: 200,
        content_length: Some(120),
      },
      observed: Shape {
        code: 500,
        content_length: Some(35),
      },
    };
    assert_eq!(finding.to_string(), "vulnerable parameter: GetParam q");
  }
}
