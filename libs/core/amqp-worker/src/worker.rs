//! AMQP worker: dispatch loop and shutdown coordinator.

use crate::broker::{AckMode, BrokerChannel, BrokerConnection, DeliveryStream, QueueKind};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::middleware::MessageMiddleware;
use crate::state::WorkerState;
use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Single-queue worker consuming with manual acknowledgment.
///
/// Each delivery runs in its own task through [`MessageMiddleware`], so
/// deliveries are processed concurrently up to the channel's prefetch.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_worker::{AmqpWorker, EchoHandler, WorkerConfig};
///
/// let config = WorkerConfig::new("jobs").with_prefetch(10);
/// let worker = AmqpWorker::connect("amqp://localhost", config, EchoHandler::new()).await?;
/// worker.run().await?;
///
/// tokio::signal::ctrl_c().await?;
/// worker.stop().await;
/// ```
pub struct AmqpWorker<H: MessageHandler + 'static> {
    channel: Arc<dyn BrokerChannel>,
    connection: Arc<dyn BrokerConnection>,
    handler: Arc<H>,
    config: WorkerConfig,
    state: Arc<WorkerState>,
    fatal_tx: mpsc::UnboundedSender<WorkerError>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerError>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    stopped: OnceCell<()>,
}

impl<H: MessageHandler + 'static> AmqpWorker<H> {
    /// Connect to the broker and create a worker on a fresh channel.
    pub async fn connect(url: &str, config: WorkerConfig, handler: H) -> Result<Self, WorkerError> {
        let (connection, channel) = crate::amqp::connect(url).await?;
        Ok(Self::new(
            Arc::new(channel),
            Arc::new(connection),
            config,
            handler,
        ))
    }

    /// Create a worker over an existing channel and connection.
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        connection: Arc<dyn BrokerConnection>,
        config: WorkerConfig,
        handler: H,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            connection,
            handler: Arc::new(handler),
            config,
            state: Arc::new(WorkerState::new()),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            dispatch: Mutex::new(None),
            stop_tx: watch::Sender::new(false),
            stopped: OnceCell::new(),
        }
    }

    /// Shared lifecycle state.
    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Whether the worker holds a subscription and has not begun shutdown.
    pub fn is_running(&self) -> bool {
        self.state.consumer_tag().is_some() && !self.state.is_shutting_down()
    }

    /// Receiver of transport failures that are fatal to the worker.
    ///
    /// Failed acks/nacks, failed reply publishes and broker-side termination
    /// of the subscription end up here. Returns `None` after the first call.
    pub fn take_fatal_errors(&self) -> Option<mpsc::UnboundedReceiver<WorkerError>> {
        self.fatal_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Declare the queue and start consuming.
    ///
    /// Returns once the subscription is registered; deliveries are processed
    /// in the background until [`AmqpWorker::stop`].
    pub async fn run(&self) -> Result<(), WorkerError> {
        let queue = self.config.queue_name.as_str();

        if self.state.is_shutting_down() {
            return Err(WorkerError::Stopped);
        }
        if self.state.consumer_tag().is_some() {
            return Err(WorkerError::AlreadyRunning(queue.to_string()));
        }

        self.channel.declare_queue(queue, QueueKind::Durable).await?;
        if let Some(count) = self.config.prefetch_count {
            self.channel.set_prefetch(count).await?;
        }

        let subscription = self.channel.consume(queue, AckMode::Manual).await?;
        if !self.state.set_consumer_tag(subscription.consumer_tag.clone()) {
            // Lost a race against a concurrent run()
            if let Err(e) = self.channel.cancel(&subscription.consumer_tag).await {
                warn!(error = %e, "Failed to cancel duplicate subscription");
            }
            return Err(WorkerError::AlreadyRunning(queue.to_string()));
        }

        let middleware = Arc::new(MessageMiddleware::new(
            Arc::clone(&self.handler),
            Arc::clone(&self.channel),
            Arc::clone(&self.state),
            queue,
        ));
        let handle = tokio::spawn(dispatch_loop(
            subscription.deliveries,
            middleware,
            Arc::clone(&self.state),
            self.fatal_tx.clone(),
            self.stop_tx.subscribe(),
        ));
        *self.dispatch.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            queue = %queue,
            consumer_tag = %subscription.consumer_tag,
            prefetch = ?self.config.prefetch_count,
            handler = self.handler.name(),
            "Worker started, waiting for messages"
        );
        Ok(())
    }

    /// Stop intake, drain in-flight messages, then close channel and connection.
    ///
    /// Only the first call runs the close sequence; concurrent and later
    /// callers wait for it to complete. Never fails: cleanup errors are
    /// logged. No timeout is applied here; wrap the call in
    /// `tokio::time::timeout` to bound the drain.
    pub async fn stop(&self) {
        self.stopped.get_or_init(|| self.shutdown()).await;
    }

    async fn shutdown(&self) {
        self.state.begin_shutdown();
        info!(
            in_flight = self.state.in_flight(),
            "Shutting down worker"
        );

        let cancelled = match self.state.consumer_tag() {
            Some(tag) => match self.channel.cancel(tag).await {
                Ok(()) => {
                    debug!(consumer_tag = %tag, "Subscription cancelled");
                    true
                }
                Err(e) => {
                    warn!(consumer_tag = %tag, error = %e, "Failed to cancel subscription");
                    false
                }
            },
            None => false,
        };

        while self.state.in_flight() > 0 {
            debug!(in_flight = self.state.in_flight(), "Waiting for in-flight messages");
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }

        let dispatch = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = dispatch {
            // Deliveries pushed before the cancel took effect are still read
            // and requeued until the subscription stream ends
            let ended = if cancelled {
                tokio::time::timeout(self.config.cancel_grace, &mut handle)
                    .await
                    .ok()
            } else {
                None
            };
            let joined = match ended {
                Some(joined) => joined,
                None => {
                    debug!("Subscription still open, stopping dispatch");
                    self.stop_tx.send_replace(true);
                    handle.await
                }
            };
            if let Err(e) = joined {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }

        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close channel");
        }
        if let Err(e) = self.connection.close().await {
            warn!(error = %e, "Failed to close connection");
        }

        self.state.mark_closed();
        info!("Worker stopped");
    }
}

/// Spawn one task per delivery until the subscription ends or dispatch is
/// stopped, then wait for the spawned tasks.
///
/// Once the worker is shutting down the middleware requeues every delivery
/// it is handed. Deliveries left unread when dispatch is stopped stay
/// unacknowledged and return to the queue when the channel closes.
async fn dispatch_loop<H: MessageHandler + 'static>(
    mut deliveries: DeliveryStream,
    middleware: Arc<MessageMiddleware<H>>,
    state: Arc<WorkerState>,
    fatal: mpsc::UnboundedSender<WorkerError>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();

    while !*stop_rx.borrow_and_update() {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            delivery = deliveries.next() => match delivery {
                Some(Ok(message)) => {
                    let middleware = Arc::clone(&middleware);
                    let fatal = fatal.clone();
                    tasks.spawn(async move {
                        let delivery_tag = message.delivery_tag;
                        if let Err(e) = middleware.handle(message).await {
                            error!(delivery_tag, error = %e, "Failed to settle message");
                            let _ = fatal.send(e);
                        }
                    });
                }
                Some(Err(e)) => {
                    error!(error = %e, "Delivery stream failed");
                    let _ = fatal.send(e);
                    break;
                }
                None => {
                    if !state.is_shutting_down() {
                        warn!("Subscription terminated by broker");
                        let _ = fatal.send(WorkerError::channel("subscription terminated by broker"));
                    }
                    break;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Message task failed");
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Message task failed");
        }
    }
    debug!("Dispatch loop finished");
}
