//! Persistence of captured records.
use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::{Error, Result};
use crate::record::{RequestRecord, ResponseRecord};

/// Storage for request and response records.
///
/// Ids are assigned by the repository, start at `1` and are never reused.
/// Implementations must be safe to share between the proxy, the replay
/// service and the admin API.
#[async_trait]
pub trait Repo: Send + Sync {
  /// Store a new request record and return its id. The `id` field of
  /// `record` is ignored.
  async fn save_request(&self, record: &RequestRecord) -> Result<i64>;
  /// Store a response record for an existing request and return its id.
  async fn save_response(&self, request_id: i64, record: &ResponseRecord) -> Result<i64>;
  /// Load one request record, [`Error::NotFound`] when the id is unknown.
  async fn get_request(&self, id: i64) -> Result<RequestRecord>;
  /// All request records in id order.
  async fn all_requests(&self) -> Result<Vec<RequestRecord>>;
  /// The first response stored for `request_id`, if any.
  async fn response_for_request(&self, request_id: i64) -> Result<Option<ResponseRecord>>;
}

#[derive(Debug, Default)]
struct Tables {
  requests: BTreeMap<i64, RequestRecord>,
  responses: BTreeMap<i64, ResponseRecord>,
  last_request_id: i64,
  last_response_id: i64,
}

/// An in-process [`Repo`]; records live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryRepo {
  tables: RwLock<Tables>,
}

impl MemoryRepo {
  /// An empty repository.
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Repo for MemoryRepo {
  async fn save_request(&self, record: &RequestRecord) -> Result<i64> {
    let mut tables = self.tables.write().await;
    tables.last_request_id += 1;
    let id = tables.last_request_id;
    let mut record = record.clone();
    record.id = id;
    tables.requests.insert(id, record);
    Ok(id)
  }

  async fn save_response(&self, request_id: i64, record: &ResponseRecord) -> Result<i64> {
    let mut tables = self.tables.write().await;
    if !tables.requests.contains_key(&request_id) {
      return Err(Error::storage_error(format!(
        "response for unknown request {request_id}"
      )));
    }
    tables.last_response_id += 1;
    let id = tables.last_response_id;
    let mut record = record.clone();
    record.id = id;
    record.request_id = request_id;
    tables.responses.insert(id, record);
    Ok(id)
  }

  async fn get_request(&self, id: i64) -> Result<RequestRecord> {
    self
      .tables
      .read()
      .await
      .requests
      .get(&id)
      .cloned()
      .ok_or(Error::NotFound { kind: "request", id })
  }

  async fn all_requests(&self) -> Result<Vec<RequestRecord>> {
    Ok(self.tables.read().await.requests.values().cloned().collect())
  }

  async fn response_for_request(&self, request_id: i64) -> Result<Option<ResponseRecord>> {
    Ok(
      self
        .tables
        .read()
        .await
        .responses
        .values()
        .find(|r| r.request_id == request_id)
        .cloned(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn request(path: &str) -> RequestRecord {
    RequestRecord {
      id: 99,
      method: "GET".into(),
      scheme: "http".into(),
      host: "example.test".into(),
      path: path.into(),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn ids_are_sequential_and_ignore_the_given_id() {
    let repo = MemoryRepo::new();
    assert_eq!(repo.save_request(&request("/a")).await.unwrap(), 1);
    assert_eq!(repo.save_request(&request("/b")).await.unwrap(), 2);
    let all = repo.all_requests().await.unwrap();
    let ids: Vec<_> = all.iter().map(|r| r.id).collect();
    assert_eq!(ids, [1, 2]);
    assert_eq!(repo.get_request(2).await.unwrap().path, "/b");
  }

  #[tokio::test]
  async fn unknown_ids() {
    let repo = MemoryRepo::new();
    assert!(matches!(
      repo.get_request(5).await,
      Err(Error::NotFound { kind: "request", id: 5 })
    ));
    assert!(repo
      .save_response(5, &ResponseRecord::default())
      .await
      .is_err());
    assert!(repo.response_for_request(5).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn response_is_linked_to_its_request() {
    let repo = MemoryRepo::new();
    let request_id = repo.save_request(&request("/")).await.unwrap();
    let response = ResponseRecord {
      code: 200,
      content_length: Some(2),
      body: "ok".into(),
      ..Default::default()
    };
    let response_id = repo.save_response(request_id, &response).await.unwrap();
    let stored = repo.response_for_request(request_id).await.unwrap().unwrap();
    assert_eq!(stored.id, response_id);
    assert_eq!(stored.request_id, request_id);
    assert_eq!(stored.body, "ok");
  }
}
