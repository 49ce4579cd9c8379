//! Error types for the worker, its handlers and the RPC client.
//!
//! Errors fall into two groups:
//! - **Transport**: broker failures (`WorkerError`, `RpcError::Broker`). These
//!   are fatal for startup and for ack/nack during normal processing.
//! - **Message-level**: `HandlerError`. Contained per message, converted into
//!   an error reply and a negative acknowledgment without requeue.

use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// Error raised by the worker or by a broker backend.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// AMQP protocol or connection error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Transport failure reported by a non-AMQP backend
    #[error("Channel error: {0}")]
    Channel(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `run()` was called on a worker that already owns a subscription
    #[error("Worker is already consuming from queue '{0}'")]
    AlreadyRunning(String),

    /// `run()` was called after `stop()`
    #[error("Worker has been stopped")]
    Stopped,

    /// Ack/nack for a delivery tag the channel does not know about
    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),
}

impl WorkerError {
    /// Create a channel error.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel(message.into())
    }
}

/// Failure of a user handler, including failure to decode its input.
///
/// Every variant maps to an error reply carrying [`HandlerError::kind`] as
/// `error.type` and the display string as `error.message`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Message body was not valid JSON
    #[error("{0}")]
    Decode(#[from] serde_json::Error),

    /// Handler failure with an explicit kind tag
    #[error("{message}")]
    Failed { kind: String, message: String },

    /// Handler panicked while processing the message
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Arbitrary error report from handler code
    #[error("{0:#}")]
    Other(eyre::Report),
}

impl HandlerError {
    /// Create a failure with the generic `Error` kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            kind: "Error".to_string(),
            message: message.into(),
        }
    }

    /// Create a failure with an explicit kind tag.
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Build from a panic payload caught around the handler future.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }

    /// Error-kind tag published in the reply's `error.type` field.
    pub fn kind(&self) -> &str {
        match self {
            HandlerError::Decode(_) => "DecodeError",
            HandlerError::Failed { kind, .. } => kind,
            HandlerError::Panicked(_) => "Panic",
            HandlerError::Other(_) => "Error",
        }
    }
}

impl From<eyre::Report> for HandlerError {
    fn from(report: eyre::Report) -> Self {
        Self::Other(report)
    }
}

/// Error raised by the RPC client.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Broker failure while setting up, publishing or consuming
    #[error("Broker error: {0}")]
    Broker(#[from] WorkerError),

    /// Request payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Reply body was not a valid reply envelope
    #[error("Invalid reply: {0}")]
    Decode(#[source] serde_json::Error),

    /// No matching reply arrived before the deadline
    #[error("Request timeout after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// Reply subscription ended before a matching reply arrived
    #[error("Reply stream closed before a reply arrived")]
    ReplyStreamClosed,
}

impl From<lapin::Error> for RpcError {
    fn from(err: lapin::Error) -> Self {
        RpcError::Broker(WorkerError::Amqp(err))
    }
}

impl RpcError {
    /// Whether this error is a reply timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_kinds() {
        let decode = serde_json::from_slice::<serde_json::Value>(b"not json").unwrap_err();
        assert_eq!(HandlerError::from(decode).kind(), "DecodeError");
        assert_eq!(HandlerError::msg("boom").kind(), "Error");
        assert_eq!(
            HandlerError::with_kind("ValidationError", "bad input").kind(),
            "ValidationError"
        );
        assert_eq!(HandlerError::Panicked("x".into()).kind(), "Panic");
        assert_eq!(HandlerError::from(eyre::eyre!("wrapped")).kind(), "Error");
    }

    #[test]
    fn test_handler_error_messages_are_human_readable() {
        assert_eq!(HandlerError::msg("boom").to_string(), "boom");

        let decode = serde_json::from_slice::<serde_json::Value>(b"{oops").unwrap_err();
        assert!(!HandlerError::from(decode).to_string().is_empty());
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = HandlerError::from_panic(Box::new("static str"));
        assert_eq!(err.to_string(), "handler panicked: static str");

        let err = HandlerError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.to_string(), "handler panicked: owned");

        let err = HandlerError::from_panic(Box::new(42_u8));
        assert!(err.to_string().contains("unknown panic payload"));
    }

    #[test]
    fn test_rpc_timeout_display() {
        let err = RpcError::Timeout {
            after: Duration::from_millis(30_000),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Request timeout after 30000ms");
    }
}
