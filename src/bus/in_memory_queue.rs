//! In-memory broker for testing and single-process scenarios.
//!
//! Models the parts of AMQP 0-9-1 the pub/sub layer relies on:
//! - direct, topic and fanout exchanges plus the default (`""`) exchange
//! - durable/transient, exclusive and auto-delete queues
//! - bindings (deduplicated)
//! - per-consumer prefetch, round-robin between consumers on one queue
//! - ack / nack-requeue / nack-discard, with dead-lettering on discard
//! - unacked messages returning to the queue when their consumer goes away
//!
//! ## Example
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let conn = broker.connect();
//! routing::declare_exchanges(&conn).await?;
//!
//! let sub = subscribe_json(&conn, EXCHANGE_PERIL_DIRECT, "pause.alice", PAUSE_KEY,
//!     QueueKind::Transient, |_: PlayingState| async { AckType::Ack }).await?;
//!
//! assert_eq!(broker.message_count("pause.alice"), 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::broker::{
    Channel, Connection, DeliveryStream, ExchangeKind, QueueInfo, QueueSpec,
};
use super::{AckType, Acker, Delivery, Envelope};
use crate::config::BrokerConfig;
use crate::error::{BusError, Result};

/// Settlements kept by [`InMemoryBroker::new`]; older ones are dropped.
pub const SETTLEMENT_HISTORY: usize = 1024;

/// A disposition applied to one delivery, as recorded by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub delivery_tag: u64,
    pub outcome: AckType,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    content_type: String,
    body: Vec<u8>,
    redelivered: bool,
}

impl From<Envelope> for StoredMessage {
    fn from(envelope: Envelope) -> Self {
        Self {
            routing_key: envelope.routing_key,
            content_type: envelope.content_type,
            body: envelope.body,
            redelivered: false,
        }
    }
}

struct ConsumerSlot {
    id: u64,
    connection: u64,
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    message: StoredMessage,
    consumer: u64,
}

struct QueueState {
    spec: QueueSpec,
    /// Connection holding an exclusive queue.
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    had_consumer: bool,
}

impl QueueState {
    fn new(spec: QueueSpec, owner: Option<u64>) -> Self {
        Self {
            spec,
            owner,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
            had_consumer: false,
        }
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.spec.name.clone(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }

    /// Round-robin pick of a consumer with prefetch capacity left.
    fn next_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.consumers[idx].has_capacity() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Remove a consumer and put its unacked messages back at the head of
    /// the queue, oldest first.
    fn drop_consumer(&mut self, id: u64) {
        self.consumers.retain(|c| c.id != id);

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }

    /// Drop consumers whose delivery stream has been dropped.
    fn reap(&mut self) {
        let closed: Vec<u64> = self
            .consumers
            .iter()
            .filter(|c| c.tx.is_closed())
            .map(|c| c.id)
            .collect();
        for id in closed {
            self.drop_consumer(id);
        }
    }

    fn unused(&self) -> bool {
        self.spec.auto_delete && self.had_consumer && self.consumers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Clone, Copy)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    settlements: VecDeque<Settlement>,
    settlement_limit: usize,
    next_tag: u64,
    next_consumer: u64,
    next_connection: u64,
    next_generated: u64,
}

impl State {
    /// Copy `message` into every queue `exchange` routes it to.
    fn route(&mut self, exchange: &str, message: StoredMessage) -> Result<Vec<String>> {
        let mut targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(&message.routing_key)
                .then(|| message.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let kind = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| {
                    BusError::transport(format!("NOT_FOUND - no exchange '{exchange}'"))
                })?
                .kind;
            self.bindings
                .iter()
                .filter(|b| {
                    b.exchange == exchange && routes(kind, &b.routing_key, &message.routing_key)
                })
                .map(|b| b.queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(targets)
    }

    fn record(&mut self, settlement: Settlement) {
        if self.settlement_limit == 0 {
            return;
        }
        while self.settlements.len() >= self.settlement_limit {
            self.settlements.pop_front();
        }
        self.settlements.push_back(settlement);
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
        debug!(queue = name, "queue deleted");
    }
}

fn routes(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        ExchangeKind::Fanout => true,
    }
}

/// AMQP topic matching: words are dot-separated, `*` matches exactly one
/// word and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// Shared in-memory broker. Cloning gives another handle to the same
/// exchanges and queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_settlement_history(SETTLEMENT_HISTORY)
    }

    /// Keep at most `limit` settlements for [`settlements`](Self::settlements).
    /// 0 disables recording.
    pub fn with_settlement_history(limit: usize) -> Self {
        let state = State {
            settlement_limit: limit,
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Open a connection with the default configuration.
    pub fn connect(&self) -> InMemoryConnection {
        self.connect_with(BrokerConfig::default())
    }

    pub fn connect_with(&self, config: BrokerConfig) -> InMemoryConnection {
        let id = {
            let mut state = self.state();
            state.next_connection += 1;
            state.next_connection
        };
        InMemoryConnection {
            broker: self.clone(),
            id,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ready plus unacknowledged messages on `queue`; 0 if it does not exist.
    pub fn message_count(&self, queue: &str) -> usize {
        let mut state = self.state();
        state
            .queues
            .get_mut(queue)
            .map(|q| {
                q.reap();
                q.ready.len() + q.unacked.len()
            })
            .unwrap_or(0)
    }

    /// Messages waiting for delivery on `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet settled on `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn queue_info(&self, queue: &str) -> Option<QueueInfo> {
        self.state().queues.get(queue).map(QueueState::info)
    }

    /// `(exchange, routing_key)` for every binding of `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Snapshot of the ready messages on `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Envelope> {
        self.state()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| {
                        Envelope::new(
                            m.routing_key.clone(),
                            m.content_type.clone(),
                            m.body.clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The most recent dispositions, oldest first.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.state().settlements.iter().cloned().collect()
    }

    /// Dispositions applied on `queue`.
    pub fn settlements_for(&self, queue: &str) -> Vec<Settlement> {
        self.state()
            .settlements
            .iter()
            .filter(|s| s.queue == queue)
            .cloned()
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push ready messages to consumers with capacity, then drop the queue if
    /// it is auto-delete and unused.
    fn dispatch(&self, state: &mut State, queue_name: &str) {
        let State {
            queues, next_tag, ..
        } = &mut *state;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };
        queue.reap();

        while !queue.ready.is_empty() {
            let Some(slot) = queue.next_consumer() else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let delivery = Delivery::new(
                tag,
                message.routing_key.clone(),
                Some(message.content_type.clone()),
                message.body.clone(),
                message.redelivered,
                Box::new(InMemoryAcker {
                    broker: self.clone(),
                    queue: queue_name.to_string(),
                    delivery_tag: tag,
                }),
            );

            let consumer = &mut queue.consumers[slot];
            if consumer.tx.send(Ok(delivery)).is_err() {
                let id = consumer.id;
                queue.ready.push_front(message);
                queue.drop_consumer(id);
                continue;
            }
            consumer.in_flight += 1;
            let consumer_id = consumer.id;
            queue.unacked.insert(
                tag,
                Unacked {
                    message,
                    consumer: consumer_id,
                },
            );
        }

        if queue.unused() {
            state.delete_queue(queue_name);
        }
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let mut state = self.state();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                Err(BusError::topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}': \
                     received '{}' but current is '{}'",
                    kind.as_str(),
                    existing.kind.as_str()
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(name.to_string(), ExchangeState { kind, durable });
                Ok(())
            }
        }
    }

    fn declare_queue(&self, connection: u64, spec: &QueueSpec) -> Result<QueueInfo> {
        let mut state = self.state();

        let mut spec = spec.clone();
        if spec.name.is_empty() {
            state.next_generated += 1;
            spec.name = format!("amq.gen-{}", state.next_generated);
        }

        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.owner.is_some_and(|owner| owner != connection) {
                return Err(BusError::topology(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    spec.name
                )));
            }
            if existing.spec != spec {
                return Err(BusError::topology(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}': \
                     declared {:?}, existing {:?}",
                    spec.name, spec, existing.spec
                )));
            }
            return Ok(existing.info());
        }

        let owner = spec.exclusive.then_some(connection);
        let queue = QueueState::new(spec.clone(), owner);
        let info = queue.info();
        state.queues.insert(spec.name, queue);
        Ok(info)
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(BusError::topology(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::topology(format!("NOT_FOUND - no exchange '{exchange}'")));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        let mut state = self.state();
        let targets = state.route(exchange, envelope.into())?;
        for name in targets {
            self.dispatch(&mut state, &name);
        }
        Ok(())
    }

    fn consume(&self, connection: u64, queue_name: &str, prefetch: u16) -> Result<DeliveryStream> {
        let mut state = self.state();
        state.next_consumer += 1;
        let id = state.next_consumer;

        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BusError::topology(format!("NOT_FOUND - no queue '{queue_name}'")))?;
        if queue.owner.is_some_and(|owner| owner != connection) {
            return Err(BusError::topology(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{queue_name}'"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumers.push(ConsumerSlot {
            id,
            connection,
            prefetch,
            in_flight: 0,
            tx,
        });
        queue.had_consumer = true;

        self.dispatch(&mut state, queue_name);
        Ok(Box::pin(ConsumerStream {
            inner: UnboundedReceiverStream::new(rx),
            broker: self.clone(),
            queue: queue_name.to_string(),
            consumer: id,
        }))
    }

    /// A consumer went away: return its unacked messages and hand them to
    /// whoever is left.
    fn release_consumer(&self, queue_name: &str, consumer: u64) {
        let mut state = self.state();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        queue.drop_consumer(consumer);
        self.dispatch(&mut state, queue_name);
    }

    fn settle(&self, queue_name: &str, delivery_tag: u64, outcome: AckType) -> Result<()> {
        let mut state = self.state();

        let queue = state.queues.get_mut(queue_name).ok_or_else(|| {
            BusError::transport(format!("NOT_FOUND - queue '{queue_name}' was deleted"))
        })?;
        let unacked = queue.unacked.remove(&delivery_tag).ok_or_else(|| {
            BusError::transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            ))
        })?;
        if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == unacked.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        let mut message = unacked.message;
        let dead_letter = match outcome {
            AckType::Ack => None,
            AckType::NackRequeue => {
                message.redelivered = true;
                queue.ready.push_front(message);
                None
            }
            AckType::NackDiscard => queue
                .spec
                .dead_letter_exchange
                .clone()
                .map(|dlx| (dlx, message)),
        };

        state.record(Settlement {
            queue: queue_name.to_string(),
            delivery_tag,
            outcome,
        });

        let mut touched = vec![queue_name.to_string()];
        if let Some((dlx, mut message)) = dead_letter {
            message.redelivered = false;
            // A missing dead-letter exchange drops the message, as in AMQP.
            if let Ok(routed) = state.route(&dlx, message) {
                touched.extend(routed);
            }
        }
        for name in touched {
            self.dispatch(&mut state, &name);
        }
        Ok(())
    }

    /// Tear down everything a closed connection held.
    fn disconnect(&self, connection: u64) {
        let mut state = self.state();

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in &names {
            let Some(queue) = state.queues.get_mut(name) else {
                continue;
            };
            if queue.owner == Some(connection) {
                state.delete_queue(name);
                continue;
            }
            let ids: Vec<u64> = queue
                .consumers
                .iter()
                .filter(|c| c.connection == connection)
                .map(|c| c.id)
                .collect();
            for id in ids {
                queue.drop_consumer(id);
            }
            self.dispatch(&mut state, name);
        }
    }
}

/// Delivery stream of one consumer. Dropping it cancels the consumer.
struct ConsumerStream {
    inner: UnboundedReceiverStream<Result<Delivery>>,
    broker: InMemoryBroker,
    queue: String,
    consumer: u64,
}

impl Stream for ConsumerStream {
    type Item = Result<Delivery>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ConsumerStream {
    fn drop(&mut self) {
        // Undelivered items still buffered in the receiver are unacked on the
        // broker side; closing first keeps dispatch from sending more.
        self.inner.close();
        self.broker.release_consumer(&self.queue, self.consumer);
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    queue: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn settle(&self, outcome: AckType) -> Result<()> {
        self.broker.settle(&self.queue, self.delivery_tag, outcome)
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    config: BrokerConfig,
    shutdown: CancellationToken,
}

impl InMemoryConnection {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn create_channel(&self) -> Result<InMemoryChannel> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        Ok(InMemoryChannel {
            broker: self.broker.clone(),
            connection: self.id,
            shutdown: self.shutdown.clone(),
            prefetch: AtomicU16::new(0),
        })
    }

    fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.broker.disconnect(self.id);
        Ok(())
    }
}

/// A channel on an [`InMemoryConnection`].
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    connection: u64,
    shutdown: CancellationToken,
    prefetch: AtomicU16,
}

impl fmt::Debug for InMemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryChannel")
            .field("connection", &self.connection)
            .field("prefetch", &self.prefetch.load(Ordering::Relaxed))
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare_exchange(name, kind, durable)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        self.ensure_open()?;
        self.broker.declare_queue(self.connection, spec)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.bind_queue(queue, exchange, routing_key)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::Relaxed);
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        self.ensure_open()?;
        self.broker.publish(exchange, envelope)
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        self.broker
            .consume(self.connection, queue, self.prefetch.load(Ordering::Relaxed))
    }
}
