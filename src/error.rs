//! Error types for the pub/sub layer.

use thiserror::Error;

use crate::bus::CodecError;

/// Errors surfaced by topology setup, publishing and subscription loops.
///
/// Per-message decode and handler failures never show up here: the
/// subscriber resolves them to an [`AckType`](crate::bus::AckType) so one
/// bad message cannot end a subscription.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    /// Connection or channel failure. Fatal to the affected subscription.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Invalid or conflicting queue/exchange/binding declaration.
    #[error("topology error: {reason}")]
    Topology { reason: String },

    /// Payload could not be encoded (publish) or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] CodecError),

    /// Configuration value could not be parsed.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// The connection has been shut down.
    #[error("connection closed")]
    Closed,
}

impl BusError {
    pub fn transport(reason: impl Into<String>) -> Self {
        BusError::Transport {
            reason: reason.into(),
        }
    }

    pub fn topology(reason: impl Into<String>) -> Self {
        BusError::Topology {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        BusError::Config {
            reason: reason.into(),
        }
    }

    /// True for errors that end a subscription or connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BusError::Serialization(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BusError>;
