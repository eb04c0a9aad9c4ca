//! Message envelopes: what goes onto the wire and what comes back off it.

use std::fmt;

use async_trait::async_trait;

use super::AckType;
use crate::error::Result;

/// An outgoing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Routing key the message is published under.
    pub routing_key: String,
    /// Identifies the serialization used for `body`.
    pub content_type: String,
    /// Encoded payload.
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(
        routing_key: impl Into<String>,
        content_type: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            content_type: content_type.into(),
            body,
        }
    }

    /// Get the body as a string (if valid UTF-8).
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Applies a disposition to one delivery on the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(&self, outcome: AckType) -> Result<()>;
}

/// A message received from a queue, still awaiting its disposition.
///
/// [`Delivery::settle`] consumes the delivery, so a second disposition for
/// the same message does not type-check.
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Set by the broker when this message was requeued at least once.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        content_type: Option<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            content_type,
            body,
            redelivered,
            acker,
        }
    }

    /// Apply the handler's outcome to this message.
    pub async fn settle(self, outcome: AckType) -> Result<()> {
        self.acker.settle(outcome).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("content_type", &self.content_type)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
