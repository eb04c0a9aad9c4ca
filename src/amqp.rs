//! RabbitMQ transport built on `lapin`.
//!
//! ## Example
//!
//! ```ignore
//! let conn = AmqpConnection::connect(&BrokerConfig::from_env()?).await?;
//! routing::declare_exchanges(&conn).await?;
//! // ... subscribe / publish ...
//! conn.close().await?;
//! ```

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{
    AckType, Acker, Channel, Connection, Delivery, DeliveryStream, Envelope, ExchangeKind,
    QueueInfo, QueueSpec,
};
use crate::config::BrokerConfig;
use crate::error::{BusError, Result};

const DEAD_LETTER_ARG: &str = "x-dead-letter-exchange";

/// Reply code sent with a normal connection close.
const REPLY_SUCCESS: u16 = 200;

fn transport(err: lapin::Error) -> BusError {
    BusError::transport(err.to_string())
}

/// Declarations rejected by the broker (`PRECONDITION_FAILED`, `NOT_FOUND`,
/// `RESOURCE_LOCKED`, ...) come back as protocol errors.
fn topology(err: lapin::Error) -> BusError {
    match &err {
        lapin::Error::ProtocolError(_) => BusError::topology(err.to_string()),
        _ => BusError::transport(err.to_string()),
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter_exchange {
        args.insert(
            ShortString::from(DEAD_LETTER_ARG),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
    }
    args
}

/// A single long-lived RabbitMQ connection.
pub struct AmqpConnection {
    inner: lapin::Connection,
    config: BrokerConfig,
    shutdown: CancellationToken,
}

impl AmqpConnection {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let inner = lapin::Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(transport)?;
        info!("connected to broker");

        Ok(Self {
            inner,
            config: config.clone(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn create_channel(&self) -> Result<AmqpChannel> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        let inner = self.inner.create_channel().await.map_err(transport)?;
        Ok(AmqpChannel { inner })
    }

    fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        if !self.is_connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(transport)?;
        info!("broker connection closed");
        Ok(())
    }
}

/// A channel on an [`AmqpConnection`].
#[derive(Clone)]
pub struct AmqpChannel {
    inner: lapin::Channel,
}

impl AmqpChannel {
    pub fn inner(&self) -> &lapin::Channel {
        &self.inner
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(topology)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        let queue = self
            .inner
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    exclusive: spec.exclusive,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(topology)?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(topology)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(transport)
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        let properties =
            BasicProperties::default().with_content_type(ShortString::from(envelope.content_type));

        // The returned confirm is not awaited: publishing is fire-and-forget.
        self.inner
            .basic_publish(
                exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(topology)?;

        let deliveries = consumer.map(|item| item.map(into_delivery).map_err(transport));
        Ok(Box::pin(deliveries))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    let content_type = properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string());

    Delivery::new(
        delivery_tag,
        routing_key.as_str(),
        content_type,
        data,
        redelivered,
        Box::new(AmqpAcker { inner: acker }),
    )
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn settle(&self, outcome: AckType) -> Result<()> {
        let result = match outcome {
            AckType::Ack => self.inner.ack(BasicAckOptions::default()).await,
            AckType::NackRequeue => {
                self.inner
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
            AckType::NackDiscard => {
                self.inner
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
        };

        result.map(|_| ()).map_err(|err| {
            warn!(%outcome, error = %err, "broker rejected disposition");
            transport(err)
        })
    }
}
