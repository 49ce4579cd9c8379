//! In-process broker implementing [`BrokerChannel`] and [`BrokerConnection`].
//!
//! Follows the AMQP semantics the worker relies on: round-robin delivery to
//! consumers, per-consumer prefetch, requeue with the `redelivered` flag,
//! server-named exclusive queues owned by their connection and deleted with
//! their last consumer, and silent drop of unroutable publishes. Every broker
//! call is recorded in an event journal for assertions.
//!
//! Available to dependent crates with the `testing` feature.

use crate::broker::{
    AckMode, BrokerChannel, BrokerConnection, InboundMessage, PublishProperties, QueueKind,
    Subscription,
};
use crate::error::WorkerError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

const DEFAULT_CONNECTION: u64 = 0;

/// A broker call recorded by [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Publish {
        queue: String,
        payload: Vec<u8>,
        properties: PublishProperties,
    },
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    Cancel {
        consumer_tag: String,
    },
    ChannelClosed {
        channel_id: u64,
    },
    QueueDeleted {
        queue: String,
    },
    ConnectionClosed,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: PublishProperties,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<String>,
    next_consumer: usize,
    /// Declaring connection of an exclusive queue
    owner: Option<u64>,
}

#[derive(Debug)]
struct ConsumerState {
    queue: String,
    channel_id: u64,
    mode: AckMode,
    prefetch: Option<u16>,
    unacked: usize,
    sender: mpsc::UnboundedSender<Result<InboundMessage, WorkerError>>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        match (self.mode, self.prefetch) {
            (AckMode::Manual, Some(limit)) => self.unacked < usize::from(limit),
            _ => true,
        }
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, ConsumerState>,
    unacked: HashMap<u64, Unacked>,
    /// Channel id to owning connection id
    channels: HashMap<u64, u64>,
    closed_channels: Vec<u64>,
    closed_connections: Vec<u64>,
    events: Vec<BrokerEvent>,
    fail_acks: bool,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
    next_queue_name: u64,
    next_channel_id: u64,
    next_connection_id: u64,
}

impl Inner {
    fn connection_of(&self, channel_id: u64) -> u64 {
        self.channels
            .get(&channel_id)
            .copied()
            .unwrap_or(DEFAULT_CONNECTION)
    }

    fn ensure_open(&self, channel_id: u64) -> Result<(), WorkerError> {
        if self
            .closed_connections
            .contains(&self.connection_of(channel_id))
        {
            return Err(WorkerError::channel("connection is closed"));
        }
        if self.closed_channels.contains(&channel_id) {
            return Err(WorkerError::channel(format!(
                "channel {channel_id} is closed"
            )));
        }
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, front: bool) {
        let Some(state) = self.queues.get_mut(queue) else {
            debug!(queue = %queue, "Dropping unroutable message");
            return;
        };
        if front {
            state.ready.push_front(message);
        } else {
            state.ready.push_back(message);
        }
        self.dispatch(queue);
    }

    /// Hand ready messages to consumers with spare capacity, round-robin.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let count = state.consumers.len();
            let chosen = (0..count)
                .map(|offset| (state.next_consumer + offset) % count)
                .find(|&index| {
                    self.consumers
                        .get(&state.consumers[index])
                        .is_some_and(ConsumerState::has_capacity)
                });
            let Some(index) = chosen else {
                return;
            };
            state.next_consumer = (index + 1) % count;

            let consumer_tag = state.consumers[index].clone();
            let Some(message) = state.ready.pop_front() else {
                return;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;

            let Some(consumer) = self.consumers.get_mut(&consumer_tag) else {
                return;
            };
            let inbound = InboundMessage {
                delivery_tag,
                body: message.body.clone(),
                correlation_id: message.properties.correlation_id.clone(),
                reply_to: message.properties.reply_to.clone(),
                redelivered: message.redelivered,
            };

            if consumer.mode == AckMode::Manual {
                consumer.unacked += 1;
                let channel_id = consumer.channel_id;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue.to_string(),
                        consumer_tag: consumer_tag.clone(),
                        channel_id,
                        message,
                    },
                );
            }

            let sent = self
                .consumers
                .get(&consumer_tag)
                .is_some_and(|consumer| consumer.sender.send(Ok(inbound)).is_ok());
            if !sent {
                debug!(consumer_tag = %consumer_tag, "Consumer receiver dropped");
            }
        }
    }

    fn settle(&mut self, delivery_tag: u64) -> Result<Unacked, WorkerError> {
        let entry = self
            .unacked
            .remove(&delivery_tag)
            .ok_or(WorkerError::UnknownDelivery(delivery_tag))?;
        if let Some(consumer) = self.consumers.get_mut(&entry.consumer_tag) {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        Ok(entry)
    }

    /// Remove a consumer; an exclusive queue goes with its last consumer.
    fn remove_consumer(&mut self, consumer_tag: &str) -> bool {
        let Some(consumer) = self.consumers.remove(consumer_tag) else {
            return false;
        };
        let mut unused = false;
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.consumers.retain(|tag| tag != consumer_tag);
            queue.next_consumer = 0;
            unused = queue.owner.is_some() && queue.consumers.is_empty();
        }
        if unused {
            self.delete_queue(&consumer.queue);
        }
        true
    }

    fn delete_queue(&mut self, queue: &str) {
        if self.queues.remove(queue).is_some() {
            self.events.push(BrokerEvent::QueueDeleted {
                queue: queue.to_string(),
            });
        }
    }

    /// Drop the channel's consumers and requeue everything it left unacked.
    fn close_channel(&mut self, channel_id: u64) {
        if self.closed_channels.contains(&channel_id) {
            return;
        }
        self.closed_channels.push(channel_id);

        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, consumer)| consumer.channel_id == channel_id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }

        let pending: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        let mut requeued: Vec<String> = Vec::new();
        for tag in pending {
            if let Some(entry) = self.unacked.remove(&tag) {
                let mut message = entry.message;
                message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    queue.ready.push_front(message);
                    requeued.push(entry.queue);
                }
            }
        }
        for queue in requeued {
            self.dispatch(&queue);
        }

        self.events.push(BrokerEvent::ChannelClosed { channel_id });
    }

    fn close_connection(&mut self, connection_id: u64) -> Result<(), WorkerError> {
        if self.closed_connections.contains(&connection_id) {
            return Err(WorkerError::channel("connection is already closed"));
        }

        let mut channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(id, owner)| {
                **owner == connection_id && !self.closed_channels.contains(*id)
            })
            .map(|(id, _)| *id)
            .collect();
        channel_ids.sort_unstable();
        for id in channel_ids {
            self.close_channel(id);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, state)| state.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in owned {
            self.delete_queue(&queue);
        }

        self.closed_connections.push(connection_id);
        self.events.push(BrokerEvent::ConnectionClosed);
        Ok(())
    }
}

/// Shared in-memory broker. Cloning yields another handle to the same broker.
///
/// [`MemoryBroker::channel`] and [`MemoryBroker::connection`] work on a
/// default connection; [`MemoryBroker::open_connection`] opens independent
/// ones.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_channel(&self, connection_id: u64) -> MemoryChannel {
        let mut inner = self.lock();
        inner.next_channel_id += 1;
        let id = inner.next_channel_id;
        inner.channels.insert(id, connection_id);
        MemoryChannel {
            id,
            prefetch: AtomicU16::new(0),
            broker: self.clone(),
        }
    }

    /// Open a new channel on the default connection.
    pub fn channel(&self) -> MemoryChannel {
        self.open_channel(DEFAULT_CONNECTION)
    }

    /// Handle of the default connection.
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            id: DEFAULT_CONNECTION,
            broker: self.clone(),
        }
    }

    /// Open a connection independent of the default one.
    pub fn open_connection(&self) -> MemoryConnection {
        let mut inner = self.lock();
        inner.next_connection_id += 1;
        MemoryConnection {
            id: inner.next_connection_id,
            broker: self.clone(),
        }
    }

    /// Snapshot of the event journal.
    pub fn events(&self) -> Vec<BrokerEvent> {
        self.lock().events.clone()
    }

    /// Make every subsequent ack fail with a channel error.
    pub fn fail_acks(&self, fail: bool) {
        self.lock().fail_acks = fail;
    }

    /// Number of messages waiting in a queue (not delivered).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    /// Number of delivered but unsettled messages across all queues.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Number of active consumers on a queue.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.consumers.len())
    }

    /// Whether a queue has been declared.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }
}

/// A channel on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    prefetch: AtomicU16,
    broker: MemoryBroker,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String, WorkerError> {
        let mut inner = self.broker.lock();
        inner.ensure_open(self.id)?;

        let name = if name.is_empty() {
            if kind == QueueKind::Durable {
                return Err(WorkerError::channel("durable queues must be named"));
            }
            inner.next_queue_name += 1;
            format!("amq.gen-{}", inner.next_queue_name)
        } else {
            name.to_string()
        };

        let owner = match kind {
            QueueKind::Durable => None,
            QueueKind::Exclusive => Some(inner.connection_of(self.id)),
        };
        inner.queues.entry(name.clone()).or_insert_with(|| QueueState {
            owner,
            ..Default::default()
        });
        Ok(name)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), WorkerError> {
        self.broker.lock().ensure_open(self.id)?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Subscription, WorkerError> {
        let mut inner = self.broker.lock();
        inner.ensure_open(self.id)?;
        if !inner.queues.contains_key(queue) {
            return Err(WorkerError::channel(format!("no queue '{queue}'")));
        }

        inner.next_consumer_tag += 1;
        let consumer_tag = format!("ctag-{}", inner.next_consumer_tag);
        let (sender, receiver) = mpsc::unbounded_channel();

        let prefetch = match self.prefetch.load(Ordering::SeqCst) {
            0 => None,
            count => Some(count),
        };
        inner.consumers.insert(
            consumer_tag.clone(),
            ConsumerState {
                queue: queue.to_string(),
                channel_id: self.id,
                mode,
                prefetch,
                unacked: 0,
                sender,
            },
        );
        if let Some(state) = inner.queues.get_mut(queue) {
            state.consumers.push(consumer_tag.clone());
        }
        inner.dispatch(queue);

        Ok(Subscription {
            consumer_tag,
            deliveries: UnboundedReceiverStream::new(receiver).boxed(),
        })
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<(), WorkerError> {
        let mut inner = self.broker.lock();
        inner.ensure_open(self.id)?;
        inner.events.push(BrokerEvent::Publish {
            queue: queue.to_string(),
            payload: payload.clone(),
            properties: properties.clone(),
        });
        inner.enqueue(
            queue,
            StoredMessage {
                body: payload,
                properties,
                redelivered: false,
            },
            false,
        );
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), WorkerError> {
        let mut inner = self.broker.lock();
        inner.ensure_open(self.id)?;
        if inner.fail_acks {
            return Err(WorkerError::channel("ack rejected by broker"));
        }

        let entry = inner.settle(delivery_tag)?;
        inner.events.push(BrokerEvent::Ack { delivery_tag });
        inner.dispatch(&entry.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), WorkerError> {
        let mut inner = self.broker.lock();
        inner.ensure_open(self.id)?;

        let entry = inner.settle(delivery_tag)?;
        inner.events.push(BrokerEvent::Nack {
            delivery_tag,
            requeue,
        });
        if requeue {
            let mut message = entry.message;
            message.redelivered = true;
            inner.enqueue(&entry.queue, message, true);
        } else {
            inner.dispatch(&entry.queue);
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), WorkerError> {
        let mut inner = self.broker.lock();
        inner.ensure_open(self.id)?;
        if !inner.remove_consumer(consumer_tag) {
            return Err(WorkerError::channel(format!(
                "unknown consumer '{consumer_tag}'"
            )));
        }
        inner.events.push(BrokerEvent::Cancel {
            consumer_tag: consumer_tag.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let mut inner = self.broker.lock();
        inner.ensure_open(self.id)?;
        inner.close_channel(self.id);
        Ok(())
    }
}

/// Connection handle of a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryConnection {
    /// Open a new channel on this connection.
    pub fn channel(&self) -> MemoryChannel {
        self.broker.open_channel(self.id)
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    /// Close every channel of the connection and delete its exclusive queues.
    async fn close(&self) -> Result<(), WorkerError> {
        self.broker.lock().close_connection(self.id)
    }
}
