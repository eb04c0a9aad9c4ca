//! Queue/exchange declaration.
//!
//! Every call here is idempotent against the broker: re-declaring with the
//! same arguments is a no-op, re-declaring with different arguments is a
//! [`BusError::Topology`](crate::BusError::Topology).

use tracing::debug;

use super::broker::{Channel, Connection, ExchangeKind, QueueInfo, QueueKind, QueueSpec};
use crate::error::Result;

/// Open a channel, declare `queue_name` with the given profile and bind it to
/// `exchange` under `routing_key`.
///
/// Durable queues are dead-lettered to the connection's configured
/// dead-letter exchange. Returns the channel (for consuming) and the queue
/// descriptor the broker confirmed.
pub async fn declare_and_bind<C: Connection>(
    conn: &C,
    exchange: &str,
    queue_name: &str,
    routing_key: &str,
    kind: QueueKind,
) -> Result<(C::Channel, QueueInfo)> {
    let channel = conn.create_channel().await?;
    let spec = QueueSpec::for_kind(queue_name, kind, &conn.config().dead_letter_exchange);

    let queue = channel.declare_queue(&spec).await?;
    channel.bind_queue(queue.name(), exchange, routing_key).await?;

    debug!(
        queue = %queue.name,
        exchange,
        routing_key,
        ?kind,
        messages = queue.message_count,
        "queue declared and bound"
    );
    Ok((channel, queue))
}

/// Declare an exchange.
pub async fn declare_exchange<Ch: Channel + ?Sized>(
    channel: &Ch,
    name: &str,
    kind: ExchangeKind,
    durable: bool,
) -> Result<()> {
    channel.declare_exchange(name, kind, durable).await?;
    debug!(exchange = name, kind = kind.as_str(), durable, "exchange declared");
    Ok(())
}

/// Declare the fanout dead-letter exchange and a durable queue collecting
/// everything routed to it.
///
/// The dead-letter queue itself has no dead-letter exchange.
pub async fn declare_dead_letter<C: Connection>(
    conn: &C,
    dead_letter_queue: &str,
) -> Result<QueueInfo> {
    let channel = conn.create_channel().await?;
    let dlx = conn.config().dead_letter_exchange.clone();

    declare_exchange(&channel, &dlx, ExchangeKind::Fanout, true).await?;

    let spec = QueueSpec {
        name: dead_letter_queue.to_string(),
        durable: true,
        auto_delete: false,
        exclusive: false,
        dead_letter_exchange: None,
    };
    let queue = channel.declare_queue(&spec).await?;
    channel.bind_queue(queue.name(), &dlx, "").await?;

    debug!(exchange = %dlx, queue = %queue.name, "dead-letter topology declared");
    Ok(queue)
}
