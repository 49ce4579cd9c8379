//! Per-message protocol wrapped around a [`MessageHandler`].
//!
//! For every delivery:
//! 1. During shutdown: nack with requeue, nothing else.
//! 2. Admit the message (in-flight +1, released by guard on every path).
//! 3. Decode the JSON body; a decode failure takes the handler-failure path.
//! 4. Run the handler inside the message span, catching panics.
//! 5. Publish the reply (if `reply_to` is set), then ack on success or nack
//!    without requeue on failure.

use crate::broker::{BrokerChannel, InboundMessage, PublishProperties};
use crate::context::HandlerContext;
use crate::error::{HandlerError, WorkerError};
use crate::handler::MessageHandler;
use crate::metrics::WorkerMetrics;
use crate::reply::Reply;
use crate::state::WorkerState;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, info, warn};

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed successfully and acknowledged
    Acked,
    /// Handler failed; negatively acknowledged without requeue
    Rejected,
    /// Arrived during shutdown; negatively acknowledged with requeue
    Requeued,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Acked => write!(f, "acked"),
            Outcome::Rejected => write!(f, "rejected"),
            Outcome::Requeued => write!(f, "requeued"),
        }
    }
}

/// Delivery callback shared by all concurrently running message tasks.
pub struct MessageMiddleware<H> {
    handler: Arc<H>,
    channel: Arc<dyn BrokerChannel>,
    state: Arc<WorkerState>,
    metrics: WorkerMetrics,
    queue: String,
}

impl<H: MessageHandler> MessageMiddleware<H> {
    pub fn new(
        handler: Arc<H>,
        channel: Arc<dyn BrokerChannel>,
        state: Arc<WorkerState>,
        queue: impl Into<String>,
    ) -> Self {
        let queue = queue.into();
        let metrics = WorkerMetrics::new(&queue, handler.name());
        Self {
            handler,
            channel,
            state,
            metrics,
            queue,
        }
    }

    /// Handle one delivery.
    ///
    /// Message-level failures never surface here; an `Err` means the broker
    /// could not be told about the outcome (publish/ack/nack failed).
    pub async fn handle(&self, message: InboundMessage) -> Result<Outcome, WorkerError> {
        if self.state.is_shutting_down() {
            debug!(
                delivery_tag = message.delivery_tag,
                "Shutting down, requeuing message"
            );
            self.channel.nack(message.delivery_tag, true).await?;
            self.metrics.message_requeued();
            return Ok(Outcome::Requeued);
        }

        let _guard = self.state.admit();
        self.metrics.message_received();
        self.metrics.set_in_flight(self.state.in_flight());

        let ctx = HandlerContext::new(
            &self.queue,
            message.delivery_tag,
            message.correlation_id.as_deref(),
            message.redelivered,
        );
        let span = ctx.span().clone();

        let result = self.process(&message, ctx).instrument(span).await;
        self.metrics.set_in_flight(self.state.in_flight().saturating_sub(1));
        result
    }

    async fn process(
        &self,
        message: &InboundMessage,
        ctx: HandlerContext,
    ) -> Result<Outcome, WorkerError> {
        let started = Instant::now();

        match self.invoke(message, ctx).await {
            Ok(data) => {
                if let Some(reply_to) = message.reply_to.as_deref() {
                    self.publish_reply(reply_to, message, Reply::success(data))
                        .await?;
                }
                self.channel.ack(message.delivery_tag).await?;
                self.metrics.message_acked(started.elapsed());

                info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Message processed and acked"
                );
                Ok(Outcome::Acked)
            }
            Err(error) => {
                warn!(
                    error = %error,
                    kind = %error.kind(),
                    "Error processing message"
                );

                if let Some(reply_to) = message.reply_to.as_deref() {
                    self.publish_reply(reply_to, message, Reply::failure(&error))
                        .await?;
                }
                self.channel.nack(message.delivery_tag, false).await?;
                self.metrics
                    .message_rejected(error.kind(), started.elapsed());
                Ok(Outcome::Rejected)
            }
        }
    }

    async fn invoke(
        &self,
        message: &InboundMessage,
        ctx: HandlerContext,
    ) -> Result<Value, HandlerError> {
        let content: Value = serde_json::from_slice(&message.body)?;
        debug!(content = %content, "Received message");

        AssertUnwindSafe(self.handler.handle(content, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::from_panic(panic)))
    }

    async fn publish_reply(
        &self,
        reply_to: &str,
        message: &InboundMessage,
        reply: Reply,
    ) -> Result<(), WorkerError> {
        let status = if reply.is_success() { "success" } else { "error" };
        let payload = reply.to_bytes()?;

        debug!(reply_to = %reply_to, status, "Sending reply");
        self.channel
            .publish(
                reply_to,
                payload,
                PublishProperties::reply(message.correlation_id.clone()),
            )
            .await?;
        self.metrics.reply_published(status);
        Ok(())
    }
}
