// crates/progress-core/src/session.rs
//! Local view of one tracked bulk job.
//!
//! A [`JobSession`] is fed the `JobStatus` payloads pushed by the hub and
//! folds them into a state that only moves forward:
//! `Queued -> Processing -> {Completed | Failed}`. Payloads that would move
//! it backwards (late or re-ordered deliveries, typically across a
//! reconnect) are rejected rather than applied.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{JobId, JobOutcome, JobState, JobStatus};

/// Shown when a job fails without a server-provided message.
pub const DEFAULT_FAILURE_MESSAGE: &str = "The bulk operation failed.";

/// State of one tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSession {
    pub job_id: JobId,
    pub state: JobState,
    pub processed_count: u64,
    pub total_count: u64,
    /// Only present once `state` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, on entering a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Why a status payload was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Payload belongs to a different job.
    ForeignJob,
    /// Payload state is earlier than the session's current state.
    Regressed { current: JobState, incoming: JobState },
    /// Session already reached Completed or Failed.
    AlreadySettled,
}

/// Result of [`JobSession::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Non-terminal update applied.
    Progress,
    /// The session just entered this terminal state. Returned at most once
    /// per session.
    Settled(JobState),
    Rejected(Rejection),
}

impl Applied {
    pub fn changed(self) -> bool {
        !matches!(self, Applied::Rejected(_))
    }
}

impl JobSession {
    /// Fresh session for a just-submitted job.
    pub fn new(job_id: JobId) -> Self {
        Self::new_at(job_id, Utc::now())
    }

    pub fn new_at(job_id: JobId, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            state: JobState::Queued,
            processed_count: 0,
            total_count: 0,
            error_message: None,
            created_at,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Fold a pushed status into the session.
    pub fn apply(&mut self, status: &JobStatus) -> Applied {
        self.apply_at(status, Utc::now())
    }

    /// Like [`apply`](Self::apply), with `now` used as the completion time
    /// when a terminal payload carries none.
    pub fn apply_at(&mut self, status: &JobStatus, now: DateTime<Utc>) -> Applied {
        if status.job_id != self.job_id {
            return Applied::Rejected(Rejection::ForeignJob);
        }
        if self.state.is_terminal() {
            return Applied::Rejected(Rejection::AlreadySettled);
        }
        if status.state.rank() < self.state.rank() {
            return Applied::Rejected(Rejection::Regressed {
                current: self.state,
                incoming: status.state,
            });
        }

        self.state = status.state;
        self.created_at = status.created_at;
        if status.total_count > 0 {
            self.total_count = status.total_count;
        }
        // Counts are taken as sent, even when they go down. Only the upper
        // bound is enforced once the total is known.
        self.processed_count = if self.total_count > 0 && status.processed_count > self.total_count {
            tracing::warn!(
                job_id = %self.job_id,
                processed = status.processed_count,
                total = self.total_count,
                "processed count exceeds total, clamping"
            );
            self.total_count
        } else {
            status.processed_count
        };

        match status.state {
            JobState::Queued | JobState::Processing => Applied::Progress,
            JobState::Completed => {
                self.completed_at = Some(status.completed_at.unwrap_or(now));
                Applied::Settled(JobState::Completed)
            }
            JobState::Failed => {
                self.completed_at = Some(status.completed_at.unwrap_or(now));
                self.error_message = Some(
                    status
                        .error_message
                        .as_deref()
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .unwrap_or(DEFAULT_FAILURE_MESSAGE)
                        .to_string(),
                );
                Applied::Settled(JobState::Failed)
            }
        }
    }

    /// Fraction of items processed, when the total is known.
    pub fn progress_ratio(&self) -> Option<f64> {
        (self.total_count > 0).then(|| self.processed_count as f64 / self.total_count as f64)
    }

    /// Terminal outcome, `None` while the job is still running.
    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Completed => Some(JobOutcome {
                job_id: self.job_id.clone(),
                success: true,
                error_message: None,
            }),
            JobState::Failed => Some(JobOutcome {
                job_id: self.job_id.clone(),
                success: false,
                error_message: self.error_message.clone(),
            }),
            JobState::Queued | JobState::Processing => None,
        }
    }
}
