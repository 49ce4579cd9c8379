//! Prometheus metrics for AMQP workers
//!
//! Recording goes through the `metrics` facade, so nothing is exported
//! unless a recorder is installed (see [`init_metrics`]).

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

static EXPORTER: OnceCell<SocketAddr> = OnceCell::new();

/// Install the Prometheus recorder with its own HTTP listener.
///
/// Must be called from within a Tokio runtime. Subsequent calls are no-ops.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    EXPORTER
        .get_or_try_init(|| {
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            info!(%addr, "Prometheus metrics exporter listening");
            Ok(addr)
        })
        .map(|_| ())
}

/// Worker metrics helper, labelled by queue and handler.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    queue: String,
    handler: String,
}

impl WorkerMetrics {
    pub fn new(queue: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
        }
    }

    /// Record a message admitted for processing
    pub fn message_received(&self) {
        counter!(
            "amqp_worker_messages_received_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a successfully processed and acknowledged message
    pub fn message_acked(&self, duration: Duration) {
        counter!(
            "amqp_worker_messages_acked_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
        self.record_duration(duration, "success");
    }

    /// Record a failed message dropped without requeue
    pub fn message_rejected(&self, kind: &str, duration: Duration) {
        counter!(
            "amqp_worker_messages_rejected_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
        self.record_duration(duration, "error");
    }

    /// Record a message returned to the queue during shutdown
    pub fn message_requeued(&self) {
        counter!(
            "amqp_worker_messages_requeued_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .increment(1);
    }

    /// Record a reply published to a `reply_to` queue
    pub fn reply_published(&self, status: &'static str) {
        counter!(
            "amqp_worker_replies_published_total",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "status" => status
        )
        .increment(1);
    }

    /// Update the in-flight gauge
    pub fn set_in_flight(&self, count: usize) {
        gauge!(
            "amqp_worker_in_flight_messages",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone()
        )
        .set(count as f64);
    }

    fn record_duration(&self, duration: Duration, status: &'static str) {
        histogram!(
            "amqp_worker_message_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => self.handler.clone(),
            "status" => status
        )
        .record(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = WorkerMetrics::new("jobs", "echo_handler");
        metrics.message_received();
        metrics.message_acked(Duration::from_millis(5));
        metrics.message_rejected("DecodeError", Duration::from_millis(1));
        metrics.message_requeued();
        metrics.reply_published("success");
        metrics.set_in_flight(3);
    }
}
