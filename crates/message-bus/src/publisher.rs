//! # Publisher
//!
//! Writes payloads to a broker. One publisher owns one transport handle and
//! may be shared across tasks; every call is a single, unretried write.

use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::payload::{ApplicationData, JsonCodec, Payload, PayloadCodec};
use crate::registry::validate_topic;
use crate::topology::Topology;
use crate::transport::{self, OutboundMessage, Transport};
use crate::url::BrokerUrl;
use async_trait::async_trait;
use bus_telemetry::{MESSAGES_PUBLISHED, PUBLISH_ERRORS};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Trait for publishing messages to the bus.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish one payload to `topic`.
    ///
    /// `delay_ms == 0` delivers immediately; a positive delay requests
    /// deferred visibility and fails with `UnsupportedFeature` on backends
    /// without delay support.
    async fn publish(&self, topic: &str, delay_ms: u64, payload: &Payload) -> BusResult<()>;
}

/// Broker-backed publisher for either backend.
pub struct Publisher {
    topology: Topology,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn PayloadCodec>,
    application: ApplicationData,
    /// Source exchanges already declared on this connection.
    declared: Mutex<HashSet<String>>,
}

impl Publisher {
    /// Connect to the broker at `url`.
    ///
    /// Connection failures are returned, never retried.
    pub async fn connect(url: &str, config: &BusConfig) -> BusResult<Self> {
        config.validate()?;
        let url = BrokerUrl::parse(url)?;
        let transport = transport::connect(&url).await?;
        Ok(Self::with_transport(config, transport))
    }

    /// Build a publisher over an already-open transport.
    #[must_use]
    pub fn with_transport(config: &BusConfig, transport: Arc<dyn Transport>) -> Self {
        let mut application = ApplicationData::new(config.app_name.clone());
        if let Some(instance) = &config.app_instance {
            application = application.with_instance(instance.clone());
        }

        Self {
            topology: Topology::new(config),
            transport,
            codec: Arc::new(JsonCodec),
            application,
            declared: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the payload codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Identity stamped on payloads built by [`Publisher::publish_json`].
    #[must_use]
    pub fn application(&self) -> &ApplicationData {
        &self.application
    }

    /// Wrap `data` in a payload stamped with this publisher's identity and a
    /// fresh trace id, then publish it.
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        topic: &str,
        delay_ms: u64,
        data: &T,
    ) -> BusResult<()> {
        let payload = Payload::from_data(data)?
            .with_publisher(self.application.clone())
            .ensure_trace_id();
        self.publish(topic, delay_ms, &payload).await
    }

    /// Close the underlying connection. A second call returns
    /// [`BusError::Closed`].
    pub async fn close(&self) -> BusResult<()> {
        self.transport.close().await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Declare the exchange a topic is published through, once per
    /// connection. Brokers treat identical redeclaration as a no-op, so a
    /// race between two callers is harmless.
    async fn ensure_source(&self, topic: &str) -> BusResult<()> {
        let spec = self.topology.source_exchange(topic);
        if self.declared.lock().contains(&spec.name) {
            return Ok(());
        }
        self.transport.declare_exchange(&spec).await?;
        self.declared.lock().insert(spec.name);
        Ok(())
    }

    async fn write(&self, topic: &str, delay_ms: u64, payload: &Payload) -> BusResult<()> {
        validate_topic(topic)?;
        // Checked before encoding so an unsupported delay never reaches the wire.
        let route = self.topology.route(topic, delay_ms)?;
        let body = self.codec.encode(payload)?;

        self.ensure_source(topic).await?;

        let message =
            OutboundMessage::new(body, self.codec.content_type()).with_headers(route.headers);
        self.transport
            .publish(&route.exchange, &route.routing_key, message)
            .await
    }
}

#[async_trait]
impl MessagePublisher for Publisher {
    async fn publish(&self, topic: &str, delay_ms: u64, payload: &Payload) -> BusResult<()> {
        match self.write(topic, delay_ms, payload).await {
            Ok(()) => {
                let delayed = if delay_ms > 0 { "true" } else { "false" };
                MESSAGES_PUBLISHED.with_label_values(&[topic, delayed]).inc();
                debug!(
                    topic,
                    delay_ms,
                    backend = %self.topology.backend(),
                    trace_id = %payload.trace_id,
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                PUBLISH_ERRORS.with_label_values(&[topic, e.kind()]).inc();
                warn!(topic, delay_ms, error = %e, "Publish failed");
                Err(e)
            }
        }
    }
}
