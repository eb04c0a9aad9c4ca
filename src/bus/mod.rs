//! Pub/sub over an AMQP-style broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  publish::<Codec, T>()            subscribe::<Codec, T, H>() │
//! │  encode → Envelope → exchange     declare_and_bind → consume │
//! │                                   loop: decode → handler →   │
//! │                                         AckType → settle     │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Connection + Channel traits                     │
//! │  create_channel / shutdown_token / close                     │
//! │  declare_exchange / declare_queue / bind_queue / publish /   │
//! │  consume → Delivery { settle(AckType) }                      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌──────────────────────┐          ┌──────────────────────────┐
//! │   InMemoryBroker     │          │  amqp::AmqpConnection    │
//! │ (tests, dev)         │          │  (RabbitMQ via lapin)    │
//! └──────────────────────┘          └──────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let conn = AmqpConnection::connect(&BrokerConfig::from_env()?).await?;
//! let publisher = Publisher::open(&conn).await?;
//!
//! let moves = subscribe_json(
//!     &conn,
//!     EXCHANGE_PERIL_TOPIC,
//!     &routing::queue_name(ARMY_MOVES_PREFIX, "alice"),
//!     &routing::wildcard(ARMY_MOVES_PREFIX),
//!     QueueKind::Transient,
//!     |mv: ArmyMove| async move { AckType::Ack },
//! )
//! .await?;
//!
//! publisher
//!     .publish_json(EXCHANGE_PERIL_TOPIC, "army_moves.alice", &mv)
//!     .await?;
//! ```

mod ack;
mod broker;
mod codec;
mod envelope;
mod in_memory_queue;
mod publisher;
mod subscriber;
mod topology;

pub use ack::AckType;
pub use broker::{
    Channel, Connection, DeliveryStream, ExchangeKind, QueueInfo, QueueKind, QueueSpec,
};
pub use codec::{Binary, Codec, CodecError, Json, BINARY_CONTENT_TYPE, JSON_CONTENT_TYPE};
pub use envelope::{Acker, Delivery, Envelope};
pub use in_memory_queue::{
    topic_matches, InMemoryBroker, InMemoryChannel, InMemoryConnection, Settlement,
    SETTLEMENT_HISTORY,
};
pub use publisher::{publish, publish_binary, publish_json, Publisher};
pub use subscriber::{
    subscribe, subscribe_binary, subscribe_json, sync_handler, Handler, Subscription,
    SubscriptionStats,
};
pub use topology::{declare_and_bind, declare_dead_letter, declare_exchange};
