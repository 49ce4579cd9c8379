//! Handler trait invoked once per admitted message.

use crate::context::HandlerContext;
use crate::error::HandlerError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// User logic run for every decoded message.
///
/// The worker offers at-least-once delivery without deduplication, so
/// implementations must tolerate redelivery of the same message.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_worker::{HandlerContext, HandlerError, MessageHandler};
/// use async_trait::async_trait;
/// use serde_json::Value;
///
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl MessageHandler for ResizeHandler {
///     async fn handle(&self, content: Value, ctx: HandlerContext) -> Result<Value, HandlerError> {
///         let url = content["url"]
///             .as_str()
///             .ok_or_else(|| HandlerError::with_kind("ValidationError", "url is required"))?;
///         tracing::info!(%url, "Resizing image");
///         Ok(serde_json::json!({ "resized": url }))
///     }
///
///     fn name(&self) -> &'static str {
///         "resize_handler"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one decoded message.
    ///
    /// The returned value becomes `data` of the success reply when the
    /// request asked for one.
    async fn handle(&self, content: Value, ctx: HandlerContext) -> Result<Value, HandlerError>;

    /// Handler name for logging and metrics labels.
    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

/// Wrap an async closure as a handler.
///
/// ```rust,ignore
/// let handler = handler_fn("echo", |content, _ctx| async move { Ok(content) });
/// ```
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    FnHandler { name, f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, content: Value, ctx: HandlerContext) -> Result<Value, HandlerError> {
        (self.f)(content, ctx).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Returns its input unchanged, optionally after a fixed delay.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    delay: Duration,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate work by sleeping before replying.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, content: Value, _ctx: HandlerContext) -> Result<Value, HandlerError> {
        if !self.delay.is_zero() {
            tracing::debug!(delay_ms = self.delay.as_millis() as u64, "Processing message");
            tokio::time::sleep(self.delay).await;
        }
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "echo_handler"
    }
}
