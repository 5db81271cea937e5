//! RabbitMQ transport.
//!
//! One connection with one channel. Delayed delivery relies on the broker's
//! `rabbitmq_delayed_message_exchange` plugin; without it, declaring the
//! shared exchange fails and `run` reports a topology error.

use super::{Delivery, DeliveryStream, HeaderValue, Headers, OutboundMessage, Transport};
use crate::error::{BusError, BusResult};
use crate::topology::{
    DeliveryBinding, ExchangeKind, ExchangeSpec, QueueSpec, DELAYED_TYPE_ARGUMENT,
};
use crate::url::BrokerUrl;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const REPLY_SUCCESS: u16 = 200;

pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    closed: AtomicBool,
}

impl AmqpTransport {
    pub async fn connect(url: &BrokerUrl) -> BusResult<Self> {
        let connection = Connection::connect(url.as_str(), ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("{}: {e}", url.address())))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("failed to open channel: {e}")))?;

        info!(address = %url.address(), vhost = %url.vhost, "AMQP connection established");
        Ok(Self {
            connection,
            channel,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

fn exchange_kind(kind: ExchangeKind) -> (lapin::ExchangeKind, FieldTable) {
    match kind {
        ExchangeKind::Topic => (lapin::ExchangeKind::Topic, FieldTable::default()),
        ExchangeKind::Fanout => (lapin::ExchangeKind::Fanout, FieldTable::default()),
        ExchangeKind::DelayedTopic => {
            let mut arguments = FieldTable::default();
            arguments.insert(
                ShortString::from(DELAYED_TYPE_ARGUMENT),
                AMQPValue::LongString("topic".into()),
            );
            (
                lapin::ExchangeKind::Custom(kind.wire_name().to_string()),
                arguments,
            )
        }
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
            HeaderValue::Str(s) => AMQPValue::LongString(s.as_str().into()),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };

    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
            AMQPValue::LongString(s) => {
                HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
            // Other field types carry nothing the bus reads.
            _ => continue,
        };
        headers.insert(key.as_str().to_string(), value);
    }
    headers
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()> {
        self.ensure_open()?;
        let (kind, arguments) = exchange_kind(spec.kind);
        self.channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..ExchangeDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        debug!(exchange = %spec.name, kind = spec.kind.wire_name(), "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<()> {
        self.ensure_open()?;
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        debug!(queue = %spec.name, "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, binding: &DeliveryBinding) -> BusResult<()> {
        self.ensure_open()?;
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> BusResult<DeliveryStream> {
        self.ensure_open()?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let stream = consumer.map(|next| {
            next.map(|delivery| Delivery {
                headers: from_field_table(delivery.properties.headers().as_ref()),
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                body: delivery.data,
            })
            .map_err(|e| BusError::Connection(e.to_string()))
        });
        Ok(Box::pin(stream))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BusResult<()> {
        self.ensure_open()?;
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type))
            .with_headers(to_field_table(&message.headers));

        // The returned confirmation is dropped: publishes are fire-and-forget.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let channel = self.channel.close(REPLY_SUCCESS, "bus shutdown").await;
        let connection = self.connection.close(REPLY_SUCCESS, "bus shutdown").await;
        info!("AMQP connection closed");

        channel
            .and(connection)
            .map_err(|e| BusError::Connection(format!("close failed: {e}")))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
