// crates/progress-core/src/lib.rs
//! Domain types for tracking bulk todo jobs.
//!
//! Provides:
//! - `JobStatus` / `JobState`: the payload pushed by the job-status hub
//! - `JobSession`: the forward-only local state of one tracked job
//! - `hub_protocol`: record-separated JSON framing used on the push channel

pub mod error;
pub mod hub_protocol;
pub mod session;
pub mod types;

pub use error::{JobStateParseError, ProtocolError};
pub use session::{Applied, JobSession, Rejection, DEFAULT_FAILURE_MESSAGE};
pub use types::{
    CompleteAllResponse, JobId, JobOutcome, JobState, JobStatus, ListId, TodoItem, TodoList,
};
