//! Broker abstraction consumed by the worker and the RPC client.
//!
//! The traits mirror the subset of AMQP 0-9-1 the worker needs: declare a
//! queue, subscribe with manual or automatic acknowledgment, publish to a
//! queue through the default exchange, ack/nack, cancel and close.
//! [`crate::amqp`] implements them on top of lapin; the `testing` feature
//! adds an in-process broker in `memory`.

use crate::error::WorkerError;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of deliveries for one subscription.
///
/// The stream ends when the subscription terminates (cancelled by the
/// consumer, cancelled by the broker, or channel closed).
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, WorkerError>>;

/// A message delivered by the broker.
///
/// Consumed once per delivery and never mutated; it is acknowledged or
/// negatively acknowledged exactly once through its `delivery_tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Channel-scoped tag used to ack/nack this delivery
    pub delivery_tag: u64,
    /// Raw payload, expected to be JSON-encoded UTF-8
    pub body: Vec<u8>,
    /// Correlation identifier supplied by the publisher
    pub correlation_id: Option<String>,
    /// Queue the publisher expects a reply on
    pub reply_to: Option<String>,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
}

#[cfg(test)]
impl InboundMessage {
    /// Create a message with no correlation metadata.
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            body: body.into(),
            correlation_id: None,
            reply_to: None,
            redelivered: false,
        }
    }

    /// Set the correlation identifier.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reply-to address.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Message properties attached to a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Ask the broker to persist the message (delivery mode 2)
    pub persistent: bool,
}

impl PublishProperties {
    /// Properties for a reply: mirrors the request's correlation id exactly,
    /// including its absence.
    pub fn reply(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            reply_to: None,
            persistent: false,
        }
    }

    /// Properties for an RPC request.
    pub fn request(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            persistent: true,
        }
    }
}

/// Kind of queue to declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Named queue that survives broker restarts
    Durable,
    /// Server-named queue owned by the declaring connection, deleted when
    /// its last consumer is cancelled
    Exclusive,
}

/// Acknowledgment mode of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Consumer must ack/nack every delivery
    Manual,
    /// Broker considers deliveries acknowledged on send
    Auto,
}

/// An active subscription.
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}

/// A channel on a broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare (or assert) a queue and return its name.
    ///
    /// For [`QueueKind::Exclusive`] the name may be empty, in which case the
    /// broker generates one.
    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String, WorkerError>;

    /// Limit the number of unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), WorkerError>;

    /// Start consuming from a queue.
    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Subscription, WorkerError>;

    /// Publish a payload to a queue through the default exchange.
    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<(), WorkerError>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError>;

    /// Negatively acknowledge a single delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError>;

    /// Cancel a subscription.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), WorkerError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), WorkerError>;
}

/// A broker connection owning one or more channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Close the connection.
    async fn close(&self) -> Result<(), WorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_properties_mirror_correlation() {
        let props = PublishProperties::reply(Some("C1".to_string()));
        assert_eq!(props.correlation_id.as_deref(), Some("C1"));
        assert!(props.reply_to.is_none());
        assert!(!props.persistent);

        let props = PublishProperties::reply(None);
        assert!(props.correlation_id.is_none());
    }

    #[test]
    fn test_request_properties_are_persistent() {
        let props = PublishProperties::request("C1", "amq.gen-1");
        assert_eq!(props.correlation_id.as_deref(), Some("C1"));
        assert_eq!(props.reply_to.as_deref(), Some("amq.gen-1"));
        assert!(props.persistent);
    }

    #[test]
    fn test_inbound_message_builder() {
        let message = InboundMessage::new(7, b"{}".to_vec())
            .with_correlation_id("C1")
            .with_reply_to("R");
        assert_eq!(message.delivery_tag, 7);
        assert_eq!(message.correlation_id.as_deref(), Some("C1"));
        assert_eq!(message.reply_to.as_deref(), Some("R"));
        assert!(!message.redelivered);
    }
}
