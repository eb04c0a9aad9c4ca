//! Typed publish/subscribe on top of an AMQP broker.
//!
//! - [`bus`]: codecs, ack outcomes, topology, publishing and subscription
//!   loops, plus an in-memory broker.
//! - [`amqp`]: the RabbitMQ transport (feature `amqp`, on by default).
//! - [`routing`]: exchange names, routing-key conventions, wire payloads.
//! - [`config`]: broker settings from the environment.

pub mod bus;
mod error;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod config;
pub mod routing;

pub use bus::{AckType, QueueKind};
pub use config::BrokerConfig;
pub use error::{BusError, Result};
