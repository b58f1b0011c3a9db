// crates/progress-core/src/hub_protocol.rs
//! JSON hub protocol spoken on the job-status push channel.
//!
//! Every message is a JSON object terminated by the ASCII record separator
//! (`0x1E`). A single WebSocket text frame can carry several records.
//!
//! The connection starts with a handshake (`{"protocol":"json","version":1}`
//! answered by `{}` or `{"error": ...}`), after which both sides exchange
//! typed messages identified by the numeric `type` field.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;

/// Terminates every record on the wire.
pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const PROTOCOL_NAME: &str = "json";
pub const PROTOCOL_VERSION: u32 = 1;

/// Hub method that adds the caller to a job's group.
pub const JOIN_GROUP_METHOD: &str = "JoinJobGroup";
/// Hub method that removes the caller from a job's group.
pub const LEAVE_GROUP_METHOD: &str = "LeaveJobGroup";
/// Client-side event carrying a `JobStatus` payload.
pub const STATUS_EVENT: &str = "JobStatusUpdate";

mod kind {
    pub const INVOCATION: u8 = 1;
    pub const COMPLETION: u8 = 3;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Call a method on the other side. Server-to-client invocations carry no
    /// `invocation_id` (no completion is expected).
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// Result of an earlier invocation.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    /// The server is closing the connection.
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, stream invocations, cancellations and future types.
    /// The job channel never uses them.
    Other(u8),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: Option<String>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    result: Option<Value>,
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

impl TryFrom<RawMessage> for HubMessage {
    type Error = ProtocolError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        match raw.kind {
            kind::INVOCATION => Ok(HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target: raw.target.ok_or(ProtocolError::MissingField {
                    kind: raw.kind,
                    field: "target",
                })?,
                arguments: raw.arguments,
            }),
            kind::COMPLETION => Ok(HubMessage::Completion {
                invocation_id: raw.invocation_id.ok_or(ProtocolError::MissingField {
                    kind: raw.kind,
                    field: "invocationId",
                })?,
                result: raw.result,
                error: raw.error,
            }),
            kind::PING => Ok(HubMessage::Ping),
            kind::CLOSE => Ok(HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect,
            }),
            other => Ok(HubMessage::Other(other)),
        }
    }
}

impl HubMessage {
    /// A client invocation expecting a completion.
    pub fn invocation(invocation_id: impl Into<String>, target: &str, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.to_string(),
            arguments,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(kind::INVOCATION));
                if let Some(id) = invocation_id {
                    obj.insert("invocationId".into(), json!(id));
                }
                obj.insert("target".into(), json!(target));
                obj.insert("arguments".into(), Value::Array(arguments.clone()));
                Value::Object(obj)
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(kind::COMPLETION));
                obj.insert("invocationId".into(), json!(invocation_id));
                if let Some(error) = error {
                    obj.insert("error".into(), json!(error));
                } else if let Some(result) = result {
                    obj.insert("result".into(), result.clone());
                }
                Value::Object(obj)
            }
            HubMessage::Ping => json!({ "type": kind::PING }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!(kind::CLOSE));
                if let Some(error) = error {
                    obj.insert("error".into(), json!(error));
                }
                obj.insert("allowReconnect".into(), json!(allow_reconnect));
                Value::Object(obj)
            }
            HubMessage::Other(code) => json!({ "type": code }),
        }
    }
}

/// Encode one message as a single record, separator included.
pub fn encode(message: &HubMessage) -> String {
    let mut out = message.to_value().to_string();
    out.push(RECORD_SEPARATOR);
    out
}

/// Split a frame into records and decode each one.
///
/// Blank records (e.g. the empty tail after the last separator) are
/// skipped. A bad record does not poison the ones around it.
pub fn decode_records(frame: &str) -> Vec<Result<HubMessage, ProtocolError>> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .map(decode_record)
        .collect()
}

fn decode_record(record: &str) -> Result<HubMessage, ProtocolError> {
    let raw: RawMessage = serde_json::from_str(record)?;
    HubMessage::try_from(raw)
}

/// The client's opening record.
pub fn handshake_request() -> String {
    let mut out = json!({ "protocol": PROTOCOL_NAME, "version": PROTOCOL_VERSION }).to_string();
    out.push(RECORD_SEPARATOR);
    out
}

#[derive(Deserialize)]
struct HandshakeResponse {
    error: Option<String>,
}

/// Check the hub's handshake answer.
///
/// Returns whatever followed the handshake record in the same frame; the
/// hub may send messages right behind it.
pub fn parse_handshake_response(frame: &str) -> Result<&str, ProtocolError> {
    let (record, rest) = match frame.split_once(RECORD_SEPARATOR) {
        Some((record, rest)) => (record, rest),
        None => (frame, ""),
    };
    if record.trim().is_empty() {
        return Err(ProtocolError::EmptyHandshake);
    }
    let response: HandshakeResponse = serde_json::from_str(record)?;
    match response.error {
        Some(error) => Err(ProtocolError::HandshakeRejected(error)),
        None => Ok(rest),
    }
}

/// Server side of the handshake, used by test hubs.
pub fn parse_handshake_request(frame: &str) -> Result<(String, u32), ProtocolError> {
    #[derive(Deserialize)]
    struct Request {
        protocol: String,
        version: u32,
    }
    let record = frame.split(RECORD_SEPARATOR).next().unwrap_or_default();
    let request: Request = serde_json::from_str(record)?;
    Ok((request.protocol, request.version))
}
