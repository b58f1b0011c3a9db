// crates/progress-client/src/lib.rs
//! Client side of the todo service's bulk-job progress feed.
//!
//! - [`JobChannel`]: one shared, self-reconnecting connection to the job hub
//! - [`JobTracker`]: follows one job's status updates into a `JobSession`
//! - [`JobSubmitter`]: starts a bulk completion and returns its job id
//! - [`Reconciler`] / [`TodoApi`]: refresh list data once a job settles

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod submitter;
pub mod tracker;

pub use api::TodoApi;
pub use channel::{ChannelLease, ConnectionState, EventSubscription, JobChannel};
pub use config::{ChannelConfig, ClientConfig, TrackerConfig};
pub use error::{ApiError, ChannelError, ConfigError, SubmissionError};
pub use reconciler::{ListRefresh, Reconciler, SettledList, ViewSnapshot};
pub use submitter::JobSubmitter;
pub use tracker::{JobTracker, NoRefresh, RefreshCallback, TrackerPhase, TrackerView};

