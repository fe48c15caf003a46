//! In-process broker
//!
//! A complete implementation of the broker traits that lives inside the
//! process. It routes through direct exchanges, keeps
//! unacknowledged deliveries per channel and puts them back on close, and
//! removes auto-delete queues once the last connection that declared them goes
//! away (auto-delete exchanges follow once their last binding disappears).
//!
//! Besides backing the test suite it can simulate the failures a real broker
//! produces: refusing connections, dropping every open connection, and
//! negatively acknowledging publishes.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, DeclareOptions, Delivery, ExchangeKind,
        PublishOutcome,
    },
    error::{BrokerError, BrokerResult},
    types::{ExchangeName, QueueName, RoutingKey},
};

/// Publishes remembered by [`InMemoryBroker::published`] by default
pub const DEFAULT_PUBLISH_LOG_LIMIT: usize = 1024;

/// Counters kept by the in-process broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Connections successfully opened
    pub connections_opened: u64,
    /// Calls to `close()`, including ones on already-closed connections
    pub close_calls: u64,
    /// Messages accepted by an exchange
    pub messages_published: u64,
    /// Messages handed out by `fetch`
    pub messages_delivered: u64,
    /// Deliveries acknowledged
    pub messages_acked: u64,
    /// Unacknowledged deliveries returned to their queue
    pub messages_requeued: u64,
}

/// One accepted publish, in broker arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub exchange: String,
    pub routing_key: String,
    pub body: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct QueueEntry {
    options: DeclareOptions,
    messages: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
    /// Connections that declared this queue
    holders: HashSet<u64>,
}

struct ExchangeEntry {
    kind: ExchangeKind,
    options: DeclareOptions,
    bindings: HashSet<(RoutingKey, QueueName)>,
    ever_bound: bool,
}

struct Unacked {
    connection_id: u64,
    channel_id: u64,
    queue: QueueName,
    message: StoredMessage,
}

#[derive(Default)]
struct Registry {
    exchanges: HashMap<ExchangeName, ExchangeEntry>,
    queues: HashMap<QueueName, QueueEntry>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    nack_keys: HashSet<RoutingKey>,
    published: VecDeque<PublishRecord>,
    stats: BrokerStats,
}

impl Registry {
    fn queue_mut(&mut self, name: &QueueName) -> BrokerResult<&mut QueueEntry> {
        self.queues.get_mut(name).ok_or_else(|| BrokerError::NotFound {
            kind: "queue",
            name: name.to_string(),
        })
    }

    /// Drop everything a connection holds: requeue its unacked deliveries,
    /// release its queue declarations and garbage-collect auto-delete entities.
    fn release_connection(&mut self, connection_id: u64) {
        if let Some(flag) = self.connections.remove(&connection_id) {
            flag.store(false, Ordering::SeqCst);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first so that push_front restores the original order
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            let Some(unacked) = self.unacked.remove(&tag) else {
                continue;
            };
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                queue.notify.notify_waiters();
                self.stats.messages_requeued += 1;
            }
        }

        let mut deleted = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            queue.holders.remove(&connection_id);
            if queue.options.auto_delete && queue.holders.is_empty() {
                deleted.push(name.clone());
            }
        }

        for name in deleted {
            if let Some(queue) = self.queues.remove(&name) {
                queue.notify.notify_waiters();
                debug!(queue = %name, "Auto-deleted queue");
            }
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(_, bound)| bound != &name);
            }
        }

        self.exchanges.retain(|name, exchange| {
            let unused =
                exchange.options.auto_delete && exchange.ever_bound && exchange.bindings.is_empty();
            if unused {
                debug!(exchange = %name, "Auto-deleted exchange");
            }
            !unused
        });
    }
}

struct Shared {
    registry: Mutex<Registry>,
    publish_log_limit: usize,
    reachable: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Broker that lives inside the current process
///
/// Cloning is cheap; clones share the same exchanges and queues, so two
/// sessions connecting through clones talk to each other.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty, reachable broker
    pub fn new() -> Self {
        Self::with_publish_log_limit(DEFAULT_PUBLISH_LOG_LIMIT)
    }

    /// Create a broker that remembers at most `limit` recent publishes
    pub fn with_publish_log_limit(limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                publish_log_limit: limit,
                reachable: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Make subsequent `connect()` calls succeed or fail
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Drop every open connection as if the network failed
    ///
    /// Returns the number of connections dropped. Waiting fetches wake up
    /// with `BrokerError::ConnectionClosed`.
    pub async fn sever_connections(&self) -> usize {
        let mut registry = self.shared.registry.lock().await;
        let ids: Vec<u64> = registry.connections.keys().copied().collect();
        for id in &ids {
            registry.release_connection(*id);
        }
        for queue in registry.queues.values() {
            queue.notify.notify_waiters();
        }
        debug!(count = ids.len(), "Severed broker connections");
        ids.len()
    }

    /// Negatively acknowledge every future publish on `routing_key`
    pub async fn nack_publishes_to(&self, routing_key: RoutingKey) {
        self.shared
            .registry
            .lock()
            .await
            .nack_keys
            .insert(routing_key);
    }

    /// Snapshot of the broker counters
    pub async fn stats(&self) -> BrokerStats {
        self.shared.registry.lock().await.stats.clone()
    }

    /// Most recent accepted publishes in arrival order
    ///
    /// Older records are dropped once the publish log limit is reached.
    pub async fn published(&self) -> Vec<PublishRecord> {
        self.shared
            .registry
            .lock()
            .await
            .published
            .iter()
            .cloned()
            .collect()
    }

    /// Number of ready messages in a queue, `None` if it does not exist
    pub async fn queue_depth(&self, queue: &QueueName) -> Option<usize> {
        self.shared
            .registry
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    /// Whether an exchange currently exists
    pub async fn exchange_exists(&self, exchange: &ExchangeName) -> bool {
        self.shared
            .registry
            .lock()
            .await
            .exchanges
            .contains_key(exchange)
    }

    /// Number of bindings on an exchange, `None` if it does not exist
    pub async fn binding_count(&self, exchange: &ExchangeName) -> Option<usize> {
        self.shared
            .registry
            .lock()
            .await
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.len())
    }

    /// Number of connections currently open
    pub async fn open_connections(&self) -> usize {
        self.shared.registry.lock().await.connections.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> BrokerResult<InMemoryConnection> {
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable(
                "in-memory broker is not accepting connections".to_string(),
            ));
        }

        let id = self.shared.next_id();
        let open = Arc::new(AtomicBool::new(true));

        let mut registry = self.shared.registry.lock().await;
        registry.connections.insert(id, Arc::clone(&open));
        registry.stats.connections_opened += 1;
        debug!(connection = id, "Opened in-memory connection");

        Ok(InMemoryConnection {
            id,
            open,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Connection to an [`InMemoryBroker`]
pub struct InMemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> BrokerResult<InMemoryChannel> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed);
        }

        Ok(InMemoryChannel {
            id: self.shared.next_id(),
            connection_id: self.id,
            open: Arc::clone(&self.open),
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut registry = self.shared.registry.lock().await;
        registry.stats.close_calls += 1;

        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }

        registry.release_connection(self.id);
        debug!(connection = self.id, "Closed in-memory connection");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Channel on an [`InMemoryConnection`]
pub struct InMemoryChannel {
    id: u64,
    connection_id: u64,
    open: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }

    fn take_message(
        &self,
        registry: &mut Registry,
        queue: &QueueName,
    ) -> BrokerResult<Option<Delivery>> {
        let Some(message) = registry.queue_mut(queue)?.messages.pop_front() else {
            return Ok(None);
        };

        let delivery_tag = self.shared.next_id();
        let delivery = Delivery {
            delivery_tag,
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
        };

        registry.unacked.insert(
            delivery_tag,
            Unacked {
                connection_id: self.connection_id,
                channel_id: self.id,
                queue: queue.clone(),
                message,
            },
        );
        registry.stats.messages_delivered += 1;

        Ok(Some(delivery))
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(
        &self,
        name: &ExchangeName,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> BrokerResult<()> {
        let mut registry = self.shared.registry.lock().await;
        self.ensure_open()?;

        match registry.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.options != options => {
                Err(BrokerError::PreconditionFailed(format!(
                    "exchange '{}' already declared with different properties",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                registry.exchanges.insert(
                    name.clone(),
                    ExchangeEntry {
                        kind,
                        options,
                        bindings: HashSet::new(),
                        ever_bound: false,
                    },
                );
                trace!(exchange = %name, ?kind, "Declared exchange");
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &QueueName,
        options: DeclareOptions,
    ) -> BrokerResult<()> {
        let mut registry = self.shared.registry.lock().await;
        self.ensure_open()?;

        match registry.queues.get_mut(name) {
            Some(existing) if existing.options != options => {
                Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' already declared with different properties",
                    name
                )))
            }
            Some(existing) => {
                existing.holders.insert(self.connection_id);
                Ok(())
            }
            None => {
                registry.queues.insert(
                    name.clone(),
                    QueueEntry {
                        options,
                        messages: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                        holders: HashSet::from([self.connection_id]),
                    },
                );
                trace!(queue = %name, "Declared queue");
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &QueueName,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
    ) -> BrokerResult<()> {
        let mut registry = self.shared.registry.lock().await;
        self.ensure_open()?;

        if !registry.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }

        let entry = registry
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;

        entry
            .bindings
            .insert((routing_key.clone(), queue.clone()));
        entry.ever_bound = true;
        trace!(%queue, %exchange, %routing_key, "Bound queue");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &ExchangeName,
        routing_key: &RoutingKey,
        payload: &[u8],
    ) -> BrokerResult<PublishOutcome> {
        let mut registry = self.shared.registry.lock().await;
        self.ensure_open()?;

        if registry.nack_keys.contains(routing_key) {
            debug!(%routing_key, "Rejecting publish");
            return Ok(PublishOutcome::Nacked);
        }

        let entry = registry
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;

        let targets: HashSet<QueueName> = entry
            .bindings
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, queue)| queue.clone())
            .collect();

        for target in &targets {
            if let Some(queue) = registry.queues.get_mut(target) {
                queue.messages.push_back(StoredMessage {
                    routing_key: routing_key.to_string(),
                    body: payload.to_vec(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }

        if self.shared.publish_log_limit > 0 {
            if registry.published.len() == self.shared.publish_log_limit {
                registry.published.pop_front();
            }
            registry.published.push_back(PublishRecord {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: String::from_utf8_lossy(payload).into_owned(),
            });
        }
        registry.stats.messages_published += 1;
        trace!(%exchange, %routing_key, queues = targets.len(), "Routed message");

        Ok(PublishOutcome::Acked)
    }

    async fn fetch(&self, queue: &QueueName, timeout: Duration) -> BrokerResult<Option<Delivery>> {
        // A timeout too large to represent waits without a deadline
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let mut registry = self.shared.registry.lock().await;
            self.ensure_open()?;

            if let Some(delivery) = self.take_message(&mut registry, queue)? {
                return Ok(Some(delivery));
            }

            // Register for wake-up before releasing the lock so a publish
            // landing in between cannot be missed.
            let notify = Arc::clone(&registry.queue_mut(queue)?.notify);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(registry);

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut registry = self.shared.registry.lock().await;
        self.ensure_open()?;

        match registry.unacked.remove(&delivery_tag) {
            Some(unacked) if unacked.channel_id == self.id => {
                registry.stats.messages_acked += 1;
                Ok(())
            }
            Some(unacked) => {
                registry.unacked.insert(delivery_tag, unacked);
                Err(BrokerError::UnknownDeliveryTag(delivery_tag))
            }
            None => Err(BrokerError::UnknownDeliveryTag(delivery_tag)),
        }
    }
}
