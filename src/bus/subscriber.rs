//! Subscriptions: one consumer loop per queue, decoding each delivery and
//! turning the handler's [`AckType`] into a broker disposition.
//!
//! ## Per-message flow
//!
//! ```text
//! delivery ──decode──► Ok(value) ──handler──► AckType ──┐
//!              │                                        ├──► settle (exactly once)
//!              └─────► Err ─────────────► NackDiscard ──┘
//! ```
//!
//! Messages on one subscription are handled strictly one at a time, in the
//! order the broker delivers them. Separate subscriptions run concurrently
//! on their own tokio tasks and channels.

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::broker::{Channel, Connection, DeliveryStream, QueueInfo, QueueKind};
use super::codec::{Binary, Codec, Json};
use super::topology::declare_and_bind;
use super::AckType;
use crate::error::{BusError, Result};

/// Business logic for one message type.
///
/// Any `Fn(T) -> impl Future<Output = AckType>` closure is a handler. Wrap a
/// plain `Fn(T) -> AckType` with [`sync_handler`].
///
/// A handler that panics does not end the subscription: the message is
/// settled `NackDiscard` and counted in [`SubscriptionStats::handler_panics`].
#[async_trait]
pub trait Handler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, message: T) -> AckType;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckType> + Send,
{
    async fn handle(&self, message: T) -> AckType {
        (self)(message).await
    }
}

/// Adapt a synchronous closure into a [`Handler`].
pub fn sync_handler<T, F>(f: F) -> impl Fn(T) -> std::future::Ready<AckType> + Send + Sync + 'static
where
    F: Fn(T) -> AckType + Send + Sync + 'static,
{
    move |message| std::future::ready(f(message))
}

/// Counters reported when a subscription loop ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Deliveries settled with `Ack`.
    pub acked: usize,
    /// Deliveries settled with `NackRequeue`.
    pub requeued: usize,
    /// Deliveries settled with `NackDiscard`, decode failures and handler
    /// panics included.
    pub discarded: usize,
    /// Deliveries whose body could not be decoded.
    pub decode_failures: usize,
    /// Deliveries whose handler panicked (settled with `NackDiscard`).
    pub handler_panics: usize,
}

impl SubscriptionStats {
    fn record(&mut self, outcome: AckType) {
        match outcome {
            AckType::Ack => self.acked += 1,
            AckType::NackRequeue => self.requeued += 1,
            AckType::NackDiscard => self.discarded += 1,
        }
    }

    /// Every delivery that reached a disposition.
    pub fn settled(&self) -> usize {
        self.acked + self.requeued + self.discarded
    }
}

/// Handle to a running subscription loop.
///
/// The loop stops when the connection shuts down or its delivery stream
/// ends. Dropping the handle does not stop it.
pub struct Subscription {
    queue: QueueInfo,
    task: JoinHandle<Result<SubscriptionStats>>,
}

impl Subscription {
    /// The queue this subscription consumes from, as confirmed at setup.
    pub fn queue(&self) -> &QueueInfo {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop immediately. A delivery caught mid-handler is left
    /// unsettled; the broker hands it to another consumer of the queue, or
    /// keeps it ready until one arrives.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the loop to end.
    ///
    /// Returns the stats on a clean stop, or the transport error that ended
    /// the loop.
    pub async fn join(self) -> Result<SubscriptionStats> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(BusError::Closed),
            Err(err) => Err(BusError::transport(format!("subscription task failed: {err}"))),
        }
    }
}

/// Declare and bind `queue_name`, then consume it on a background task,
/// decoding every delivery with codec `C` into `T` and passing it to
/// `handler`.
///
/// Setup failures (channel, declaration, binding, consume) are returned
/// here. Once running, per-message failures are resolved to an outcome and
/// only transport failures end the loop.
///
/// ## Example
///
/// ```ignore
/// let sub = subscribe::<Json, ArmyMove, _, _>(
///     &conn,
///     EXCHANGE_PERIL_TOPIC,
///     &routing::queue_name(ARMY_MOVES_PREFIX, "alice"),
///     &routing::wildcard(ARMY_MOVES_PREFIX),
///     QueueKind::Transient,
///     |mv: ArmyMove| async move { AckType::Ack },
/// )
/// .await?;
/// ```
pub async fn subscribe<C, T, H, Conn>(
    conn: &Conn,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    kind: QueueKind,
    handler: H,
) -> Result<Subscription>
where
    C: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
    Conn: Connection,
{
    let (channel, queue) = declare_and_bind(conn, exchange, queue_name, routing_key, kind).await?;

    let config = conn.config();
    if config.prefetch > 0 {
        channel.set_prefetch(config.prefetch).await?;
    }
    let deliveries = channel
        .consume(queue.name(), &config.consumer_tag(queue.name()))
        .await?;

    info!(
        queue = %queue.name,
        exchange,
        routing_key,
        content_type = C::CONTENT_TYPE,
        "subscription started"
    );

    let consumer = Consumer::<C, T, H> {
        queue: queue.name.clone(),
        handler,
        _codec: PhantomData,
    };
    let shutdown = conn.shutdown_token();
    let task = tokio::spawn(async move {
        // The channel lives as long as the loop.
        let _channel = channel;
        consumer.run(deliveries, shutdown).await
    });

    Ok(Subscription { queue, task })
}

/// [`subscribe`] with JSON payloads.
pub async fn subscribe_json<T, H, Conn>(
    conn: &Conn,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    kind: QueueKind,
    handler: H,
) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
    Conn: Connection,
{
    subscribe::<Json, T, H, Conn>(conn, exchange, queue_name, routing_key, kind, handler).await
}

/// [`subscribe`] with binary payloads.
pub async fn subscribe_binary<T, H, Conn>(
    conn: &Conn,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    kind: QueueKind,
    handler: H,
) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
    Conn: Connection,
{
    subscribe::<Binary, T, H, Conn>(conn, exchange, queue_name, routing_key, kind, handler).await
}

struct Consumer<C, T, H> {
    queue: String,
    handler: H,
    _codec: PhantomData<fn() -> (C, T)>,
}

impl<C, T, H> Consumer<C, T, H>
where
    C: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    async fn run(
        self,
        mut deliveries: DeliveryStream,
        shutdown: CancellationToken,
    ) -> Result<SubscriptionStats> {
        let mut stats = SubscriptionStats::default();

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(queue = %self.queue, "connection shut down, subscription stopped");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        error!(queue = %self.queue, error = %err, "delivery stream failed");
                        return Err(err);
                    }
                    None => {
                        info!(queue = %self.queue, "delivery stream closed, subscription stopped");
                        break;
                    }
                },
            };

            let outcome = match C::decode::<T>(&delivery.body) {
                Ok(message) => {
                    match AssertUnwindSafe(self.handler.handle(message))
                        .catch_unwind()
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            error!(
                                queue = %self.queue,
                                routing_key = %delivery.routing_key,
                                "handler panicked, discarding"
                            );
                            stats.handler_panics += 1;
                            AckType::NackDiscard
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        queue = %self.queue,
                        routing_key = %delivery.routing_key,
                        content_type = ?delivery.content_type,
                        error = %err,
                        "could not decode message, discarding"
                    );
                    stats.decode_failures += 1;
                    AckType::NackDiscard
                }
            };

            if outcome.requeue() {
                warn!(
                    queue = %self.queue,
                    routing_key = %delivery.routing_key,
                    redelivered = delivery.redelivered,
                    "handler requested requeue"
                );
            }

            let tag = delivery.delivery_tag;
            if let Err(err) = delivery.settle(outcome).await {
                if shutdown.is_cancelled() {
                    // The broker requeues whatever was in flight on close.
                    info!(
                        queue = %self.queue,
                        delivery_tag = tag,
                        "connection shut down mid-delivery, subscription stopped"
                    );
                    break;
                }
                error!(
                    queue = %self.queue,
                    delivery_tag = tag,
                    %outcome,
                    error = %err,
                    "could not settle delivery"
                );
                return Err(err);
            }
            stats.record(outcome);
        }

        Ok(stats)
    }
}
