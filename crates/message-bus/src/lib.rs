//! # Message Bus - Broker-Agnostic Publish/Subscribe
//!
//! Lets application code emit and consume topic-addressed events without
//! depending on which broker is deployed. Two broker families sit behind one
//! contract:
//!
//! - **Queue backend**: queue-per-topic (topic + channel), no delay support
//! - **Exchange backend**: one shared delayed exchange, routing key = topic,
//!   per-message `x-delay`
//!
//! ## Flow
//!
//! ```text
//! ┌───────────┐  publish(topic, delay_ms, payload)  ┌──────────┐
//! │ Publisher │ ──────────────────────────────────► │  Broker  │
//! └───────────┘                                     └────┬─────┘
//!                                                        │ one queue per
//!                                                        │ (group, topic)
//!                     ┌──────────────────────────────────┘
//!                     ▼
//!              ┌──────────────┐   handler(payload, err)
//!              │  Subscriber  │ ─► one worker per topic
//!              └──────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! - At-most-once: deliveries are acknowledged on hand-off
//! - FIFO per queue; no ordering across topics
//! - Subscribers sharing a consumer group compete; distinct groups each get
//!   a copy
//!
//! ## Example
//!
//! ```rust,ignore
//! use message_bus::{shutdown, BusConfig, Publisher, Subscriber};
//!
//! let config = BusConfig::from_env()?;
//! let mut subscriber = Subscriber::new(config.clone());
//! subscriber.handle("order.created", |payload, err| { /* ... */ })?;
//!
//! let (trigger, signal) = shutdown::channel();
//! tokio::spawn(subscriber.run(&config.url, signal));
//!
//! let publisher = Publisher::connect(&config.url, &config).await?;
//! publisher.publish_json("order.created", 0, &order).await?;
//! ```

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod error;
pub mod payload;
pub mod publisher;
pub mod registry;
pub mod shutdown;
pub mod subscriber;
pub mod topology;
pub mod transport;
pub mod url;

pub use config::{Backend, BusConfig};
pub use error::{BusError, BusResult, CodecError};
pub use payload::{ApplicationData, JsonCodec, Payload, PayloadCodec};
pub use publisher::{MessagePublisher, Publisher};
pub use registry::{HandleFunc, TopicRegistry, TopicRegistryBuilder};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal, ShutdownTrigger};
pub use subscriber::Subscriber;
pub use topology::{DeliveryBinding, Topology, DEFAULT_EXCHANGE, DELAY_HEADER};
pub use transport::{InMemoryBroker, Transport};
pub use url::BrokerUrl;
