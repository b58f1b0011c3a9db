// crates/progress-core/src/types.rs
//! Wire and domain types shared by the job channel, tracker and CLI.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobStateParseError;

/// Server-issued identifier of one bulk operation.
///
/// Opaque to the client. Doubles as the hub group name the job's status
/// updates are routed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a todo list.
pub type ListId = i64;

/// Lifecycle state of a bulk job.
///
/// The server serializes this enum by discriminant, so the wire form is
/// `0..=3`. Variant names are accepted on input as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "JobStateRepr", into = "u8")]
pub enum JobState {
    Queued = 0,
    Processing = 1,
    Completed = 2,
    Failed = 3,
}

impl JobState {
    /// Position along `Queued < Processing < {Completed, Failed}`.
    /// Both terminal states share the highest rank.
    pub fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Processing => 1,
            JobState::Completed | JobState::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<JobState> for u8 {
    fn from(state: JobState) -> Self {
        state as u8
    }
}

impl TryFrom<u8> for JobState {
    type Error = JobStateParseError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(JobState::Queued),
            1 => Ok(JobState::Processing),
            2 => Ok(JobState::Completed),
            3 => Ok(JobState::Failed),
            other => Err(JobStateParseError::UnknownCode(other)),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = JobStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(JobStateParseError::UnknownName(s.to_string())),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JobStateRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<JobStateRepr> for JobState {
    type Error = JobStateParseError;

    fn try_from(repr: JobStateRepr) -> Result<Self, Self::Error> {
        match repr {
            JobStateRepr::Code(code) => JobState::try_from(code),
            JobStateRepr::Name(name) => name.parse(),
        }
    }
}

/// Payload of the `JobStatusUpdate` push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub processed_count: u64,
    pub total_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a settled job reports to the refresh callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: JobId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Response body of the bulk-complete submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteAllResponse {
    pub job_id: JobId,
}

/// List summary as returned by `GET /todolists`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoList {
    pub id: ListId,
    pub name: String,
    #[serde(default)]
    pub incomplete_item_count: u64,
}

/// Item as returned by `GET /todolists/{id}/todos`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: i64,
    pub description: String,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_list_id: Option<ListId>,
}

/// ISO-8601 timestamps as the job service emits them.
///
/// The server may omit the offset (`2025-03-01T10:00:00.1234567`); such
/// values are taken as UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_job_state_discriminants() {
        assert_eq!(JobState::Queued as u8, 0);
        assert_eq!(JobState::Processing as u8, 1);
        assert_eq!(JobState::Completed as u8, 2);
        assert_eq!(JobState::Failed as u8, 3);
    }

    #[test]
    fn test_job_state_rank_orders_terminal_states_together() {
        assert!(JobState::Queued.rank() < JobState::Processing.rank());
        assert!(JobState::Processing.rank() < JobState::Completed.rank());
        assert_eq!(JobState::Completed.rank(), JobState::Failed.rank());
    }

    #[test]
    fn test_job_state_accepts_code_and_name() {
        let from_code: JobState = serde_json::from_str("1").unwrap();
        let from_name: JobState = serde_json::from_str("\"Completed\"").unwrap();
        assert_eq!(from_code, JobState::Processing);
        assert_eq!(from_name, JobState::Completed);
        assert!(serde_json::from_str::<JobState>("9").is_err());
        assert_eq!(serde_json::to_string(&JobState::Failed).unwrap(), "3");
    }

    #[test]
    fn test_job_status_deserialize_server_payload() {
        let json = r#"{
            "jobId": "7d1c2f0e-5a0b-4e8e-9d43-0c8f9b1f2a11",
            "state": 3,
            "processedCount": 2,
            "totalCount": 5,
            "errorMessage": "disk full",
            "createdAt": "2025-03-01T10:00:00.1234567",
            "completedAt": "2025-03-01T10:00:04Z"
        }"#;
        let status: JobStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.job_id.as_str(), "7d1c2f0e-5a0b-4e8e-9d43-0c8f9b1f2a11");
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error_message.as_deref(), Some("disk full"));
        assert_eq!(
            status.completed_at,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 4).unwrap())
        );
        assert_eq!(status.created_at.format("%H:%M:%S").to_string(), "10:00:00");
    }

    #[test]
    fn test_job_status_optional_fields_absent() {
        let json = r#"{"jobId":"j1","state":0,"processedCount":0,"totalCount":5,
                       "createdAt":"2025-03-01T10:00:00+01:00","completedAt":null}"#;
        let status: JobStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.state, JobState::Queued);
        assert!(status.error_message.is_none());
        assert!(status.completed_at.is_none());
        assert_eq!(status.created_at.format("%H").to_string(), "09");
    }

    #[test]
    fn test_job_status_rejects_bad_timestamp() {
        let json = r#"{"jobId":"j1","state":0,"processedCount":0,"totalCount":5,"createdAt":"yesterday"}"#;
        assert!(serde_json::from_str::<JobStatus>(json).is_err());
    }

    #[test]
    fn test_todo_list_serialize() {
        let list = TodoList {
            id: 42,
            name: "Groceries".to_string(),
            incomplete_item_count: 3,
        };
        let json = serde_json::to_string(&list).unwrap();
        assert!(json.contains("\"incompleteItemCount\":3"));
    }
}
