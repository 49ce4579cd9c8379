//! Per-message capabilities handed to a [`crate::MessageHandler`].

use tracing::Span;

/// Context built fresh for every admitted message.
///
/// Logging goes through `tracing`: the handler future runs inside
/// [`HandlerContext::span`], so plain `tracing::info!` calls inside the
/// handler carry the queue, correlation id and delivery tag. Use
/// [`HandlerContext::child_span`] to derive a span with extra fields.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    correlation_id: String,
    correlation_generated: bool,
    queue: String,
    delivery_tag: u64,
    redelivered: bool,
    span: Span,
}

impl HandlerContext {
    /// Build a context for one delivery.
    ///
    /// When the message carries no correlation id a fresh one is generated.
    /// It is used for log correlation only and never attached to a reply.
    pub fn new(
        queue: impl Into<String>,
        delivery_tag: u64,
        correlation_id: Option<&str>,
        redelivered: bool,
    ) -> Self {
        let queue = queue.into();
        let (correlation_id, correlation_generated) = match correlation_id {
            Some(id) => (id.to_string(), false),
            None => (uuid::Uuid::new_v4().to_string(), true),
        };

        let span = tracing::info_span!(
            "message",
            queue = %queue,
            correlation_id = %correlation_id,
            correlation_generated,
            delivery_tag,
        );

        Self {
            correlation_id,
            correlation_generated,
            queue,
            delivery_tag,
            redelivered,
            span,
        }
    }

    /// Correlation id for logging (inbound or generated).
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Whether the correlation id was generated locally.
    pub fn correlation_generated(&self) -> bool {
        self.correlation_generated
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Span carrying this message's fields.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Child span for a named step of the handler.
    pub fn child_span(&self, step: &str) -> Span {
        tracing::info_span!(parent: &self.span, "handler_step", step = %step)
    }
}
