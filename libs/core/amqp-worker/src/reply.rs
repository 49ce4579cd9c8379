//! Reply envelope published to a request's `reply_to` queue.
//!
//! Wire format (JSON):
//!
//! ```text
//! {"status":"success","data":<handler result>,"processedAt":"2024-01-01T00:00:00.000Z"}
//! {"status":"error","error":{"message":"...","type":"..."},"processedAt":"..."}
//! ```

use crate::error::HandlerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error details carried by [`Reply::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    /// Human-readable description
    pub message: String,
    /// Error-kind tag
    #[serde(rename = "type")]
    pub kind: String,
}

/// Outcome of a handled request, tagged by `status` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Success {
        data: Value,
        #[serde(rename = "processedAt", with = "iso_millis")]
        processed_at: DateTime<Utc>,
    },
    Error {
        error: ReplyError,
        #[serde(rename = "processedAt", with = "iso_millis")]
        processed_at: DateTime<Utc>,
    },
}

impl Reply {
    /// Successful reply stamped with the current time.
    pub fn success(data: Value) -> Self {
        Reply::Success {
            data,
            processed_at: Utc::now(),
        }
    }

    /// Error reply stamped with the current time.
    pub fn failure(error: &HandlerError) -> Self {
        Reply::Error {
            error: ReplyError {
                message: error.to_string(),
                kind: error.kind().to_string(),
            },
            processed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success { .. })
    }

    /// Handler result for a successful reply.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Reply::Success { data, .. } => Some(data),
            Reply::Error { .. } => None,
        }
    }

    /// Error details for an error reply.
    pub fn error(&self) -> Option<&ReplyError> {
        match self {
            Reply::Success { .. } => None,
            Reply::Error { error, .. } => Some(error),
        }
    }

    pub fn processed_at(&self) -> DateTime<Utc> {
        match self {
            Reply::Success { processed_at, .. } | Reply::Error { processed_at, .. } => {
                *processed_at
            }
        }
    }

    /// Serialize to the JSON wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse from the JSON wire format.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// ISO-8601 UTC timestamps with millisecond precision and a `Z` suffix.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, 12, 30, 45).unwrap()
    }

    #[test]
    fn test_success_wire_format() {
        let reply = Reply::Success {
            data: json!({"test": "hello", "value": 42}),
            processed_at: fixed_time(),
        };

        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "success",
                "data": {"test": "hello", "value": 42},
                "processedAt": "2024-05-17T12:30:45.000Z"
            })
        );
    }

    #[test]
    fn test_error_wire_format() {
        let reply = Reply::Error {
            error: ReplyError {
                message: "boom".to_string(),
                kind: "Error".to_string(),
            },
            processed_at: fixed_time(),
        };

        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "error",
                "error": {"message": "boom", "type": "Error"},
                "processedAt": "2024-05-17T12:30:45.000Z"
            })
        );
    }

    #[test]
    fn test_failure_captures_kind_and_message() {
        let reply = Reply::failure(&HandlerError::with_kind("ValidationError", "missing id"));
        let error = reply.error().unwrap();
        assert_eq!(error.kind, "ValidationError");
        assert_eq!(error.message, "missing id");
        assert!(!reply.is_success());
        assert!(reply.data().is_none());
    }

    #[test]
    fn test_parses_replies_from_other_producers() {
        let raw = br#"{"status":"success","data":[1,2,3],"processedAt":"2024-05-17T12:30:45.123+02:00"}"#;
        let reply = Reply::from_slice(raw).unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.data(), Some(&json!([1, 2, 3])));
        assert_eq!(
            reply.processed_at(),
            Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 45).unwrap()
                + chrono::Duration::milliseconds(123)
        );
    }

    #[test]
    fn test_rejects_unknown_status() {
        let raw = br#"{"status":"pending","processedAt":"2024-05-17T12:30:45.000Z"}"#;
        assert!(Reply::from_slice(raw).is_err());
    }
}
