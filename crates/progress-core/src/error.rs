// crates/progress-core/src/error.rs
use thiserror::Error;

/// Errors decoding a [`JobState`](crate::JobState) from its wire form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStateParseError {
    #[error("Unknown job state code: {0}")]
    UnknownCode(u8),

    #[error("Unknown job state name: {0}")]
    UnknownName(String),
}

/// Errors decoding hub protocol records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed hub record: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Hub message of type {kind} is missing `{field}`")]
    MissingField { kind: u8, field: &'static str },

    #[error("Handshake rejected by hub: {0}")]
    HandshakeRejected(String),

    #[error("Handshake response was empty")]
    EmptyHandshake,
}
