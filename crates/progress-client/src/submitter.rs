// crates/progress-client/src/submitter.rs
//! Starts bulk operations on the backend.

use reqwest::{Client, StatusCode};
use tracing::{info, warn};

use todo_progress_core::{CompleteAllResponse, JobId, ListId};

use crate::error::SubmissionError;

#[derive(Debug, Clone)]
pub struct JobSubmitter {
    http: Client,
    base_url: String,
}

impl JobSubmitter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `POST /todolists/{id}/complete-all`. Returns the job id to track.
    ///
    /// Nothing should be tracked when this fails.
    pub async fn start_complete_all(&self, list_id: ListId) -> Result<JobId, SubmissionError> {
        let url = format!("{}/todolists/{list_id}/complete-all", self.base_url);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(SubmissionError::Network)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SubmissionError::ListNotFound(list_id));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(list_id, status = status.as_u16(), "bulk completion rejected");
            return Err(SubmissionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(SubmissionError::Network)?;
        let accepted: CompleteAllResponse = serde_json::from_str(&body)
            .map_err(|e| SubmissionError::InvalidResponse(format!("{e}: {body}")))?;
        if accepted.job_id.as_str().trim().is_empty() {
            return Err(SubmissionError::InvalidResponse("empty job id".into()));
        }

        info!(list_id, job_id = %accepted.job_id, "bulk completion started");
        Ok(accepted.job_id)
    }
}
