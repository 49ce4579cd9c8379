//! lapin backend for the broker traits.

use crate::broker::{
    AckMode, BrokerChannel, BrokerConnection, InboundMessage, PublishProperties, QueueKind,
    Subscription,
};
use crate::error::WorkerError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, error, info};

const CONTENT_TYPE_JSON: &str = "application/json";
const PERSISTENT: u8 = 2;

/// Open a connection and a channel on it.
///
/// Broker-initiated closure of the connection is logged; there is no
/// reconnection.
pub async fn connect(url: &str) -> Result<(LapinConnection, LapinChannel), WorkerError> {
    let connection = Connection::connect(url, ConnectionProperties::default()).await?;
    connection.on_error(|err| {
        error!(error = %err, "AMQP connection closed");
    });

    let channel = connection.create_channel().await?;
    info!(channel_id = channel.id(), "Connected to AMQP broker");

    Ok((LapinConnection { connection }, LapinChannel { channel }))
}

/// [`BrokerConnection`] over a lapin connection.
pub struct LapinConnection {
    connection: Connection,
}

impl LapinConnection {
    pub fn inner(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn close(&self) -> Result<(), WorkerError> {
        self.connection.close(200, "Bye").await?;
        Ok(())
    }
}

/// [`BrokerChannel`] over a lapin channel.
#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

fn short_string(value: &ShortString) -> String {
    value.as_str().to_string()
}

fn inbound(delivery: Delivery) -> InboundMessage {
    let props = &delivery.properties;
    InboundMessage {
        delivery_tag: delivery.delivery_tag,
        correlation_id: props.correlation_id().as_ref().map(short_string),
        reply_to: props.reply_to().as_ref().map(short_string),
        redelivered: delivery.redelivered,
        body: delivery.data,
    }
}

/// Exclusive queues are removed by the broker once their last consumer is
/// cancelled, not only when the connection closes.
fn exclusive_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        exclusive: true,
        auto_delete: true,
        ..Default::default()
    }
}

fn basic_properties(properties: PublishProperties) -> BasicProperties {
    let mut props = BasicProperties::default().with_content_type(CONTENT_TYPE_JSON.into());
    if let Some(correlation_id) = properties.correlation_id {
        props = props.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        props = props.with_reply_to(reply_to.into());
    }
    if properties.persistent {
        props = props.with_delivery_mode(PERSISTENT);
    }
    props
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String, WorkerError> {
        let options = match kind {
            QueueKind::Durable => QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            QueueKind::Exclusive => exclusive_options(),
        };

        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await?;
        debug!(
            queue = queue.name().as_str(),
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue declared"
        );
        Ok(short_string(queue.name()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), WorkerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Subscription, WorkerError> {
        let consumer_tag = format!("amqp-worker-{}", uuid::Uuid::new_v4());
        let options = BasicConsumeOptions {
            no_ack: mode == AckMode::Auto,
            ..Default::default()
        };

        let consumer = self
            .channel
            .basic_consume(queue, &consumer_tag, options, FieldTable::default())
            .await?;

        let deliveries = consumer
            .map(|delivery| delivery.map(inbound).map_err(WorkerError::from))
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<(), WorkerError> {
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                basic_properties(properties),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), WorkerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.channel.close(200, "Bye").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_properties() {
        let props = basic_properties(PublishProperties::request("C1", "amq.gen-1"));
        assert_eq!(
            props.correlation_id().as_ref().map(ShortString::as_str),
            Some("C1")
        );
        assert_eq!(
            props.reply_to().as_ref().map(ShortString::as_str),
            Some("amq.gen-1")
        );
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT));
        assert_eq!(
            props.content_type().as_ref().map(ShortString::as_str),
            Some(CONTENT_TYPE_JSON)
        );
    }

    #[test]
    fn test_exclusive_queues_are_auto_deleted() {
        let options = exclusive_options();
        assert!(options.exclusive);
        assert!(options.auto_delete);
        assert!(!options.durable);
    }

    #[test]
    fn test_reply_without_correlation_stays_without() {
        let props = basic_properties(PublishProperties::reply(None));
        assert!(props.correlation_id().is_none());
        assert!(props.reply_to().is_none());
        assert!(props.delivery_mode().is_none());
    }
}
