//! Handler outcomes.

use std::fmt;

/// What a handler decided about one delivered message.
///
/// The subscriber applies exactly one broker disposition per outcome:
///
/// | Outcome       | Broker call                    |
/// |---------------|--------------------------------|
/// | `Ack`         | `basic.ack`                    |
/// | `NackRequeue` | `basic.nack` with `requeue`    |
/// | `NackDiscard` | `basic.nack` without `requeue` |
///
/// A discarded message is rerouted to the queue's dead-letter exchange when
/// one is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AckType {
    /// Processed; remove from the queue.
    Ack,
    /// Transient failure; make the message available for redelivery.
    NackRequeue,
    /// Invalid or inapplicable; drop it (or dead-letter it).
    ///
    /// This is the default so an unclassified outcome can never loop
    /// forever through requeues.
    #[default]
    NackDiscard,
}

impl AckType {
    /// Whether the broker should put the message back on the queue.
    pub fn requeue(self) -> bool {
        matches!(self, AckType::NackRequeue)
    }

    pub fn is_ack(self) -> bool {
        matches!(self, AckType::Ack)
    }

    /// Stable lowercase label used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            AckType::Ack => "ack",
            AckType::NackRequeue => "nack_requeue",
            AckType::NackDiscard => "nack_discard",
        }
    }
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
