//! Publishing typed values to an exchange.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::broker::{Channel, Connection};
use super::codec::{Binary, Codec, Json};
use super::Envelope;
use crate::error::Result;

/// Encode `value` with codec `C` and publish it to `exchange` under
/// `routing_key`.
///
/// Nothing is sent when encoding fails. Publishing does not wait for a
/// broker confirmation; pick a durable queue if loss on crash matters.
pub async fn publish<C, T, Ch>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    C: Codec,
    T: Serialize,
    Ch: Channel + ?Sized,
{
    let body = C::encode(value)?;
    let size = body.len();

    channel
        .publish(exchange, Envelope::new(routing_key, C::CONTENT_TYPE, body))
        .await?;

    debug!(
        exchange,
        routing_key,
        content_type = C::CONTENT_TYPE,
        size,
        "message published"
    );
    Ok(())
}

/// Publish `value` as JSON.
pub async fn publish_json<T, Ch>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    T: Serialize,
    Ch: Channel + ?Sized,
{
    publish::<Json, T, Ch>(channel, exchange, routing_key, value).await
}

/// Publish `value` with the binary codec.
pub async fn publish_binary<T, Ch>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    T: Serialize,
    Ch: Channel + ?Sized,
{
    publish::<Binary, T, Ch>(channel, exchange, routing_key, value).await
}

/// A cloneable publishing handle that owns its own channel.
///
/// Handlers that need to emit follow-up messages capture a `Publisher`
/// instead of sharing the consuming channel.
///
/// ## Example
///
/// ```ignore
/// let publisher = Publisher::open(&conn).await?;
/// publisher
///     .publish_json(EXCHANGE_PERIL_DIRECT, PAUSE_KEY, &PlayingState { is_paused: true })
///     .await?;
/// ```
pub struct Publisher<Ch: Channel> {
    channel: Arc<Ch>,
}

impl<Ch: Channel> Clone for Publisher<Ch> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<Ch: Channel> Publisher<Ch> {
    /// Wrap an already open channel.
    pub fn new(channel: Ch) -> Self {
        Self {
            channel: Arc::new(channel),
        }
    }

    /// Open a dedicated channel on `conn`.
    pub async fn open<C>(conn: &C) -> Result<Self>
    where
        C: Connection<Channel = Ch>,
    {
        Ok(Self::new(conn.create_channel().await?))
    }

    pub async fn publish<C: Codec, T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<()> {
        publish::<C, T, Ch>(self.channel.as_ref(), exchange, routing_key, value).await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<()> {
        self.publish::<Json, T>(exchange, routing_key, value).await
    }

    pub async fn publish_binary<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<()> {
        self.publish::<Binary, T>(exchange, routing_key, value).await
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Ch {
        &self.channel
    }
}
