//! Worker and RPC client configuration.

use std::time::Duration;

/// Default poll interval of the shutdown drain loop.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time `stop()` waits for the cancelled subscription to end.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Default time an RPC client waits for its reply.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`crate::AmqpWorker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Durable queue to consume from
    pub queue_name: String,

    /// Maximum unacknowledged deliveries (None = broker default, unbounded)
    pub prefetch_count: Option<u16>,

    /// How often `stop()` re-checks the in-flight count while draining
    pub drain_poll_interval: Duration,

    /// How long `stop()` keeps requeuing deliveries the broker pushed before
    /// the cancel took effect
    pub cancel_grace: Duration,
}

impl WorkerConfig {
    /// Create a configuration for the given queue.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            prefetch_count: None,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Bound concurrent in-flight deliveries.
    pub fn with_prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count.max(1));
        self
    }

    /// Set the drain poll interval.
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Set the grace period for the cancelled subscription to end.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("queue_example")
    }
}

/// Configuration for [`crate::RpcClient`].
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Queue requests are published to
    pub queue_name: String,

    /// How long to wait for a matching reply
    pub timeout: Duration,
}

impl RpcConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::new("queue_example")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.queue_name, "queue_example");
        assert_eq!(config.prefetch_count, None);
        assert_eq!(config.drain_poll_interval, Duration::from_millis(100));
        assert_eq!(config.cancel_grace, Duration::from_secs(1));
    }

    #[test]
    fn test_worker_builder() {
        let config = WorkerConfig::new("jobs")
            .with_prefetch(0)
            .with_drain_poll_interval(Duration::from_millis(10))
            .with_cancel_grace(Duration::from_millis(50));

        assert_eq!(config.queue_name, "jobs");
        assert_eq!(config.prefetch_count, Some(1));
        assert_eq!(config.drain_poll_interval, Duration::from_millis(10));
        assert_eq!(config.cancel_grace, Duration::from_millis(50));
    }

    #[test]
    fn test_rpc_defaults() {
        let config = RpcConfig::new("jobs");
        assert_eq!(config.timeout, Duration::from_millis(30_000));

        let config = config.with_timeout(Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(5));
    }
}
