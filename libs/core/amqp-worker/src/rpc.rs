//! Request/reply client.
//!
//! Each call declares an exclusive server-named reply queue, consumes it with
//! automatic acknowledgment, publishes the request with a fresh correlation
//! id and waits for the matching reply until the configured timeout. The
//! reply queue is deleted by the broker when the call cancels its consumer.

use crate::broker::{
    AckMode, BrokerChannel, BrokerConnection, DeliveryStream, PublishProperties, QueueKind,
};
use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::reply::Reply;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client for request/reply calls against a worker queue.
pub struct RpcClient {
    channel: Arc<dyn BrokerChannel>,
    connection: Arc<dyn BrokerConnection>,
    config: RpcConfig,
}

impl RpcClient {
    /// Connect to the broker.
    pub async fn connect(url: &str, config: RpcConfig) -> Result<Self, RpcError> {
        let (connection, channel) = crate::amqp::connect(url).await?;
        Ok(Self::new(Arc::new(channel), Arc::new(connection), config))
    }

    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        connection: Arc<dyn BrokerConnection>,
        config: RpcConfig,
    ) -> Self {
        Self {
            channel,
            connection,
            config,
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Serialize `payload` as JSON and send it.
    pub async fn call<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Reply, RpcError> {
        let body = serde_json::to_vec(payload).map_err(RpcError::Serialization)?;
        self.call_raw(body).await
    }

    /// Send a raw body under a freshly generated correlation id.
    pub async fn call_raw(&self, body: impl Into<Vec<u8>>) -> Result<Reply, RpcError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        self.request(body, &correlation_id).await
    }

    /// Send a raw body under the given correlation id.
    ///
    /// The body is sent verbatim; no JSON validation is done client-side.
    pub async fn request(
        &self,
        body: impl Into<Vec<u8>>,
        correlation_id: &str,
    ) -> Result<Reply, RpcError> {
        let reply_queue = self.channel.declare_queue("", QueueKind::Exclusive).await?;
        let mut subscription = self.channel.consume(&reply_queue, AckMode::Auto).await?;

        info!(
            queue = %self.config.queue_name,
            correlation_id = %correlation_id,
            reply_to = %reply_queue,
            "Sending request"
        );
        let published = self
            .channel
            .publish(
                &self.config.queue_name,
                body.into(),
                PublishProperties::request(correlation_id, reply_queue.as_str()),
            )
            .await;

        let result = match published {
            Ok(()) => {
                await_reply(&mut subscription.deliveries, correlation_id, self.config.timeout)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = self.channel.cancel(&subscription.consumer_tag).await {
            debug!(error = %e, "Failed to cancel reply subscription");
        }
        result
    }

    /// Close channel and connection. Failures are logged, not returned.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close channel");
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }
    }
}

/// Connect, send one request and close, whatever the outcome.
pub async fn send_request(
    url: &str,
    config: RpcConfig,
    body: impl Into<Vec<u8>>,
) -> Result<Reply, RpcError> {
    let client = RpcClient::connect(url, config).await?;
    call_once(&client, body.into()).await
}

async fn call_once(client: &RpcClient, body: Vec<u8>) -> Result<Reply, RpcError> {
    let result = client.call_raw(body).await;
    client.close().await;
    result
}

/// Wait for the reply carrying `correlation_id`.
///
/// Replies with any other correlation id are ignored. Fails with
/// [`RpcError::Timeout`] when nothing matches within `timeout`.
pub async fn await_reply(
    deliveries: &mut DeliveryStream,
    correlation_id: &str,
    timeout: Duration,
) -> Result<Reply, RpcError> {
    let wait = async {
        while let Some(delivery) = deliveries.next().await {
            let message = delivery?;
            if message.correlation_id.as_deref() != Some(correlation_id) {
                debug!(
                    expected = %correlation_id,
                    received = ?message.correlation_id,
                    "Ignoring reply with mismatched correlation id"
                );
                continue;
            }
            return Reply::from_slice(&message.body).map_err(RpcError::Decode);
        }
        Err(RpcError::ReplyStreamClosed)
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| RpcError::Timeout { after: timeout })?
}
