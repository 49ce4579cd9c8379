//! Single-queue AMQP worker with correlated replies and graceful drain.
//!
//! The worker consumes one durable queue with manual acknowledgment, runs a
//! user handler for every message and, when the request names a `reply_to`
//! queue, publishes a correlated reply before settling the message.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   request    ┌──────────────────┐   delivery   ┌────────────────┐
//! │   RpcClient    │─────────────▶│  RabbitMQ queue  │─────────────▶│   AmqpWorker   │
//! │ (reply queue)  │              │    (durable)     │              │ (dispatch loop)│
//! └────────────────┘              └──────────────────┘              └────────────────┘
//!         ▲                                                                  │
//!         │                 reply (correlation id)                           ▼
//!         │                                                        ┌──────────────────┐
//!         └────────────────────────────────────────────────────────│ MessageMiddleware│
//!                                                                  │ (your handler)   │
//!                                                                  └──────────────────┘
//! ```
//!
//! # Message protocol
//!
//! | Situation | Reply (if `reply_to`) | Settlement |
//! |-----------|-----------------------|------------|
//! | Handler succeeded | `{"status":"success","data":…}` | ack |
//! | Handler failed / panicked | `{"status":"error","error":{…}}` | nack, no requeue |
//! | Body is not JSON | `{"status":"error","error":{"type":"DecodeError"}}` | nack, no requeue |
//! | Delivered during shutdown | none | nack, requeue |
//!
//! Delivery is at-least-once; handlers must tolerate redelivery.
//!
//! # Example
//!
//! ```rust,ignore
//! use amqp_worker::{AmqpWorker, HandlerContext, HandlerError, WorkerConfig, handler_fn};
//!
//! let handler = handler_fn("uppercase", |content, _ctx: HandlerContext| async move {
//!     let text = content["text"]
//!         .as_str()
//!         .ok_or_else(|| HandlerError::with_kind("ValidationError", "text is required"))?;
//!     Ok(serde_json::json!({ "text": text.to_uppercase() }))
//! });
//!
//! let worker = AmqpWorker::connect(&url, WorkerConfig::new("jobs"), handler).await?;
//! worker.run().await?;
//!
//! shutdown_signal().await;
//! worker.stop().await;
//! ```

pub mod amqp;
pub mod broker;
mod config;
mod context;
mod error;
mod handler;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod metrics;
mod middleware;
mod reply;
mod rpc;
mod state;
mod worker;

pub use broker::{
    AckMode, BrokerChannel, BrokerConnection, DeliveryStream, InboundMessage, PublishProperties,
    QueueKind, Subscription,
};
pub use config::{
    DEFAULT_CANCEL_GRACE, DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_RPC_TIMEOUT, RpcConfig, WorkerConfig,
};
pub use context::HandlerContext;
pub use error::{HandlerError, RpcError, WorkerError};
pub use handler::{EchoHandler, FnHandler, MessageHandler, handler_fn};
pub use metrics::{WorkerMetrics, init_metrics};
pub use middleware::{MessageMiddleware, Outcome};
pub use reply::{Reply, ReplyError};
pub use rpc::{RpcClient, await_reply, send_request};
pub use state::{InFlightGuard, WorkerPhase, WorkerState};
pub use worker::AmqpWorker;
