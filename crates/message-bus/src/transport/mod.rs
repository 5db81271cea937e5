//! # Broker Transports
//!
//! The narrow interface publishers and subscribers drive a broker through.
//! Both broker families are expressed with the same five operations:
//! declare exchange, declare queue, bind, consume, publish.
//!
//! | Scheme | Transport | Families |
//! |--------|-----------|----------|
//! | `memory://<name>` | [`InMemoryBroker`] | queue, exchange (with delay) |
//! | `amqp://`, `amqps://` | `AmqpTransport` (feature `amqp`) | queue, exchange (delay via plugin) |

#[cfg(feature = "amqp")]
pub mod amqp;
mod delay;
pub mod memory;

pub use memory::{InMemoryBroker, MemoryConnection};

use crate::error::{BusError, BusResult};
use crate::topology::{DeliveryBinding, ExchangeSpec, QueueSpec};
use crate::url::BrokerUrl;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Per-message transport metadata.
pub type Headers = BTreeMap<String, HeaderValue>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
}

impl HeaderValue {
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Str(value) => value.parse().ok(),
        }
    }
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub headers: Headers,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(body: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            body,
            content_type: content_type.into(),
            headers: Headers::new(),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A message handed to a consumer. Already acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
}

/// Stream of deliveries for one queue. Ends when the owning connection
/// closes; an `Err` item means the broker-side stream failed.
pub type DeliveryStream = BoxStream<'static, BusResult<Delivery>>;

/// One open connection/channel to a broker.
///
/// Implementations must be safe for concurrent `publish` calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Idempotent for identical parameters.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()>;

    /// Idempotent for identical parameters.
    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<()>;

    async fn bind_queue(&self, binding: &DeliveryBinding) -> BusResult<()>;

    /// Start consuming a queue with automatic acknowledgment.
    async fn consume(&self, queue: &str) -> BusResult<DeliveryStream>;

    /// Write one message. Returns once the broker accepted the write; does
    /// not wait for delivery.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BusResult<()>;

    /// Close the connection and end every stream it opened. A second call
    /// returns [`BusError::Closed`].
    async fn close(&self) -> BusResult<()>;

    fn is_closed(&self) -> bool;
}

/// Open a transport for a broker endpoint.
pub async fn connect(url: &BrokerUrl) -> BusResult<Arc<dyn Transport>> {
    info!(url = %url, "Connecting to broker");

    match url.scheme.as_str() {
        "memory" => Ok(Arc::new(InMemoryBroker::named(&url.host).connect())),
        #[cfg(feature = "amqp")]
        "amqp" | "amqps" => Ok(Arc::new(amqp::AmqpTransport::connect(url).await?)),
        #[cfg(not(feature = "amqp"))]
        "amqp" | "amqps" => Err(BusError::Connection(
            "AMQP support is not compiled in; enable the `amqp` feature".to_string(),
        )),
        other => Err(BusError::Connection(format!(
            "no transport available for scheme {other:?}"
        ))),
    }
}
