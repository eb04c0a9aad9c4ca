//! Exchange names, routing-key conventions and the payloads owned by the
//! routing layer.
//!
//! Routing keys and queue names are both `<prefix>.<identity>`, so a
//! restarted process derives the same durable queue name and rebinds to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::{declare_dead_letter, declare_exchange, Connection, ExchangeKind, QueueInfo};
use crate::error::Result;

pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";
pub const DEAD_LETTER_QUEUE: &str = "peril_dlq";

pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const PAUSE_KEY: &str = "pause";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// `<prefix>.<identity>`
pub fn routing_key(prefix: &str, identity: &str) -> String {
    format!("{prefix}.{identity}")
}

/// Binding pattern matching every identity under `prefix`.
pub fn wildcard(prefix: &str) -> String {
    format!("{prefix}.*")
}

/// Deterministic per-identity queue name.
pub fn queue_name(prefix: &str, identity: &str) -> String {
    routing_key(prefix, identity)
}

/// Broadcast on the direct exchange under [`PAUSE_KEY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

/// Append-only log record, published with the binary codec under
/// `game_logs.<username>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameLog {
    pub current_time: DateTime<Utc>,
    pub message: String,
    pub username: String,
}

impl GameLog {
    pub fn new(message: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            current_time: Utc::now(),
            message: message.into(),
            username: username.into(),
        }
    }
}

/// Declare the direct and topic exchanges plus the dead-letter exchange and
/// its queue. Safe to call on every start.
pub async fn declare_exchanges<C: Connection>(conn: &C) -> Result<QueueInfo> {
    let channel = conn.create_channel().await?;
    declare_exchange(&channel, EXCHANGE_PERIL_DIRECT, ExchangeKind::Direct, true).await?;
    declare_exchange(&channel, EXCHANGE_PERIL_TOPIC, ExchangeKind::Topic, true).await?;
    declare_dead_letter(conn, DEAD_LETTER_QUEUE).await
}
