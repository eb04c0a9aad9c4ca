//! Broker seam: the connection/channel operations the pub/sub layer needs.
//!
//! Two transports implement these traits: `amqp` (RabbitMQ through lapin)
//! and [`InMemoryBroker`](super::InMemoryBroker) for tests and single-process
//! use.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::{Delivery, Envelope};
use crate::config::BrokerConfig;
use crate::error::Result;

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Routing discipline of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Dot-separated pattern match: `*` is one word, `#` is zero or more.
    Topic,
    /// Every bound queue, routing key ignored. Used for dead-lettering.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Durability profile of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Non-durable, auto-deleted, exclusive to the declaring connection.
    Transient,
    /// Durable, kept when unused, shared, dead-lettered.
    Durable,
}

/// Full set of queue arguments sent with a declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Queue arguments for a durability profile. Only durable queues get a
    /// dead-letter exchange.
    pub fn for_kind(name: impl Into<String>, kind: QueueKind, dead_letter_exchange: &str) -> Self {
        match kind {
            QueueKind::Transient => Self {
                name: name.into(),
                durable: false,
                auto_delete: true,
                exclusive: true,
                dead_letter_exchange: None,
            },
            QueueKind::Durable => Self {
                name: name.into(),
                durable: true,
                auto_delete: false,
                exclusive: false,
                dead_letter_exchange: Some(dead_letter_exchange.to_string()),
            },
        }
    }
}

/// Queue descriptor confirmed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    /// Messages ready for delivery at declaration time.
    pub message_count: u32,
    pub consumer_count: u32,
}

impl QueueInfo {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A long-lived broker connection that hands out channels.
#[async_trait]
pub trait Connection: Send + Sync {
    type Channel: Channel;

    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<Self::Channel>;

    fn config(&self) -> &BrokerConfig;

    /// Cancelled when the connection shuts down. Subscription loops watch it.
    fn shutdown_token(&self) -> CancellationToken;

    /// Close the connection and stop every loop that depends on it.
    async fn close(&self) -> Result<()>;
}

/// One channel on a connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Fire-and-forget publish; no broker confirmation is awaited.
    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;
}
