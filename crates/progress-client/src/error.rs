// crates/progress-client/src/error.rs
use thiserror::Error;

/// Errors surfaced by the push channel.
///
/// Transport failures are retried by the channel's reconnect loop; callers
/// only see them from explicit `connect()` / `join_group()` calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Socket connect or handshake failed or timed out.
    #[error("Connection to job hub failed: {0}")]
    Connection(String),

    /// A group join needed a connection and none could be established.
    #[error("Not connected to job hub: {0}")]
    NotConnected(String),

    /// The hub answered an invocation with an error.
    #[error("Hub rejected {method}: {message}")]
    Invocation { method: String, message: String },

    /// The channel has been shut down.
    #[error("Job channel is closed")]
    Closed,
}

/// Errors starting a bulk operation. No tracking should follow.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Network error submitting bulk job: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Todo list not found: {0}")]
    ListNotFound(i64),

    #[error("Bulk job rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid bulk job response: {0}")]
    InvalidResponse(String),
}

/// Errors from the list/item read side.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Todo list not found: {0}")]
    ListNotFound(i64),

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },
}

/// Invalid client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported scheme {scheme} in {url}")]
    UnsupportedScheme { url: String, scheme: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_display() {
        let err = ChannelError::Invocation {
            method: "JoinJobGroup".into(),
            message: "Unknown job".into(),
        };
        assert_eq!(err.to_string(), "Hub rejected JoinJobGroup: Unknown job");
        assert_eq!(
            ChannelError::NotConnected("connection refused".into()).to_string(),
            "Not connected to job hub: connection refused"
        );
    }

    #[test]
    fn test_submission_error_display() {
        let err = SubmissionError::Rejected {
            status: 409,
            body: "a job is already running".into(),
        };
        assert_eq!(err.to_string(), "Bulk job rejected (409): a job is already running");
        assert_eq!(SubmissionError::ListNotFound(42).to_string(), "Todo list not found: 42");
    }
}
