//! # Broker Topology
//!
//! Derives every broker-side name from `(backend, consumer_group, topic)`.
//! Nothing here talks to the network; publishers and subscribers feed these
//! specs to a [`Transport`](crate::transport::Transport).
//!
//! ```text
//! Exchange backend                         Queue backend
//!
//! publish(topic) ─► delayed.exchange       publish(topic) ─► <topic> (fanout)
//!                    │ routing key = topic                    │
//!                    ▼                                        ▼
//!                 <group>-<topic>                          <topic>.<group>
//! ```
//!
//! Topology is durable: it is declared on every `run` and never deleted, so
//! messages published while a subscriber is down are delivered on its next
//! run.

use crate::config::{Backend, BusConfig};
use crate::error::{BusError, BusResult};
use crate::transport::{HeaderValue, Headers};

/// Shared exchange name used when none is configured.
pub const DEFAULT_EXCHANGE: &str = "delayed.exchange";

/// Exchange type registered by the RabbitMQ delayed-message plugin.
pub const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";

/// Declare argument telling the delayed exchange how to route once due.
pub const DELAYED_TYPE_ARGUMENT: &str = "x-delayed-type";

/// Per-message header carrying the delay in milliseconds.
pub const DELAY_HEADER: &str = "x-delay";

/// How an exchange routes messages to bound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing-key pattern match (`*` one word, `#` zero or more words).
    Topic,
    /// Every bound queue receives every message.
    Fanout,
    /// Topic routing after holding each message for its `x-delay`.
    DelayedTopic,
}

impl ExchangeKind {
    /// Name of the exchange type on the wire.
    #[must_use]
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::DelayedTopic => DELAYED_EXCHANGE_TYPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

/// Broker-side artifact realising one `(consumer_group, topic)` subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryBinding {
    pub queue: String,
    pub routing_key: String,
    pub exchange: String,
}

/// Where and how one message is written.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
}

/// Name derivation for one configured bus.
#[derive(Debug, Clone)]
pub struct Topology {
    backend: Backend,
    exchange: String,
    consumer_group: String,
}

impl Topology {
    #[must_use]
    pub fn new(config: &BusConfig) -> Self {
        Self {
            backend: config.backend,
            exchange: config.exchange.clone(),
            consumer_group: config.consumer_group.clone(),
        }
    }

    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The routing primitive shared by all topics, declared once per run.
    #[must_use]
    pub fn shared_exchange(&self) -> Option<ExchangeSpec> {
        match self.backend {
            Backend::Exchange => Some(ExchangeSpec {
                name: self.exchange.clone(),
                kind: ExchangeKind::DelayedTopic,
                durable: true,
            }),
            Backend::Queue => None,
        }
    }

    /// The exchange a topic's messages enter the broker through.
    #[must_use]
    pub fn source_exchange(&self, topic: &str) -> ExchangeSpec {
        match self.shared_exchange() {
            Some(shared) => shared,
            None => ExchangeSpec {
                name: topic.to_string(),
                kind: ExchangeKind::Fanout,
                durable: true,
            },
        }
    }

    #[must_use]
    pub fn binding(&self, topic: &str) -> DeliveryBinding {
        let queue = match self.backend {
            Backend::Exchange => format!("{}-{}", self.consumer_group, topic),
            Backend::Queue => format!("{}.{}", topic, self.consumer_group),
        };
        DeliveryBinding {
            queue,
            routing_key: topic.to_string(),
            exchange: self.source_exchange(topic).name,
        }
    }

    #[must_use]
    pub fn queue(&self, binding: &DeliveryBinding) -> QueueSpec {
        QueueSpec {
            name: binding.queue.clone(),
            durable: true,
        }
    }

    /// Publish route for a topic, with delay encoded as transport metadata.
    ///
    /// Fails with `UnsupportedFeature` when a delay is requested from a
    /// backend without delay support.
    pub fn route(&self, topic: &str, delay_ms: u64) -> BusResult<Route> {
        let mut headers = Headers::new();
        match self.backend {
            Backend::Exchange => {
                let delay = i64::try_from(delay_ms)
                    .map_err(|_| BusError::Config(format!("delay {delay_ms}ms out of range")))?;
                headers.insert(DELAY_HEADER.to_string(), HeaderValue::Int(delay));
            }
            Backend::Queue if delay_ms > 0 => {
                return Err(BusError::UnsupportedFeature {
                    backend: self.backend.as_str(),
                    feature: "delayed delivery",
                });
            }
            Backend::Queue => {}
        }

        Ok(Route {
            exchange: self.source_exchange(topic).name,
            routing_key: topic.to_string(),
            headers,
        })
    }
}
