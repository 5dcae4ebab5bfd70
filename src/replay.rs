//! Replaying stored requests against their origin.
use std::sync::Arc;

use crate::capture::{record_to_request, request_to_record, response_to_record};
use crate::client::{Client, ClientBuilder};
use crate::errors::Result;
use crate::record::{RequestRecord, ResponseRecord};
use crate::repo::Repo;

/// Re-issues stored requests.
///
/// A new [`Client`] is built from the configured builder for every call, so
/// concurrent replays and scans share no connection state.
#[derive(Clone)]
pub struct Replayer {
  repo: Arc<dyn Repo>,
  client: ClientBuilder,
}

impl Replayer {
  /// Replay records of `repo` with a default client.
  pub fn new(repo: Arc<dyn Repo>) -> Self {
    Replayer {
      repo,
      client: Client::builder(),
    }
  }

  /// Use `client` to build the client of every replay.
  pub fn client_builder(mut self, client: ClientBuilder) -> Self {
    self.client = client;
    self
  }

  /// The repository records are loaded from and saved to.
  pub fn repo(&self) -> &Arc<dyn Repo> {
    &self.repo
  }

  pub(crate) fn client(&self) -> Result<Client> {
    self.client.clone().build()
  }

  /// Load request `request_id`, send it again and return the new response.
  ///
  /// The outgoing request is saved as a new record before it is sent and
  /// its response once it arrives; a failure to save is logged and the response is returned anyway, with
  /// the ids that could not be assigned left at `0`.
  pub async fn repeat(&self, request_id: i64) -> Result<ResponseRecord> {
    let stored = self.repo.get_request(request_id).await?;
    self.send(&stored).await
  }

  async fn send(&self, stored: &RequestRecord) -> Result<ResponseRecord> {
    let request = record_to_request(stored)?;
    // the attempt is recorded before it is sent so failed replays stay audited
    let attempt_id = match self.repo.save_request(&request_to_record(&request)).await {
      Ok(id) => Some(id),
      Err(e) => {
        tracing::warn!("failed to save replay of {}: {}", stored, e);
        None
      }
    };
    let response = self.client()?.execute(request).await?;
    tracing::debug!("replayed {} -> {}", stored, response.status_code());
    let mut record = response_to_record(attempt_id.unwrap_or(0), &response);
    if let Some(attempt_id) = attempt_id {
      match self.repo.save_response(attempt_id, &record).await {
        Ok(response_id) => record.id = response_id,
        Err(e) => tracing::warn!("failed to save replayed response of {}: {}", stored, e),
      }
    }
    Ok(record)
  }
}
