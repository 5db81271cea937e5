//! # Subscriber / Consumer Group
//!
//! Owns the topic registry for one consumer group and runs one delivery
//! loop per topic.
//!
//! ## Lifecycle
//!
//! ```text
//! handle() ... handle()     registration, no network
//!        │
//!   run(url, shutdown)
//!        ├─ connect                      ─► BusError::Connection
//!        ├─ declare shared exchange      ─► BusError::Topology
//!        ├─ per topic: queue, bind, consume
//!        ├─ spawn one worker per topic
//!        ├─ wait for shutdown
//!        ├─ close the connection (once)
//!        └─ join workers, return
//! ```
//!
//! Deliveries are acknowledged by the broker on hand-off (at-most-once).
//! Handlers are synchronous and run on the blocking pool, one delivery at a
//! time per topic, so a slow handler only holds back its own topic.

use crate::config::BusConfig;
use crate::error::{BusError, BusResult, CodecError};
use crate::payload::{JsonCodec, Payload, PayloadCodec};
use crate::registry::{HandleFunc, TopicRegistry, TopicRegistryBuilder};
use crate::shutdown::ShutdownSignal;
use crate::topology::Topology;
use crate::transport::{self, Delivery, DeliveryStream, Transport};
use crate::url::BrokerUrl;
use bus_telemetry::{
    log_topic_event, ACTIVE_WORKERS, DECODE_FAILURES, HANDLER_PANICS, MESSAGES_RECEIVED,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Consumer group member. Consumed by [`Subscriber::run`], so handlers can
/// only be registered before the bus starts.
pub struct Subscriber {
    config: BusConfig,
    topology: Topology,
    codec: Arc<dyn PayloadCodec>,
    registry: TopicRegistryBuilder,
    ready: Option<oneshot::Sender<()>>,
}

impl Subscriber {
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            topology: Topology::new(&config),
            config,
            codec: Arc::new(JsonCodec),
            registry: TopicRegistryBuilder::new(),
            ready: None,
        }
    }

    /// Replace the payload codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Register the handler for `topic`. Registering a topic again replaces
    /// the earlier handler.
    pub fn handle<F>(&mut self, topic: &str, handler: F) -> BusResult<&mut Self>
    where
        F: Fn(Payload, Option<CodecError>) + Send + Sync + 'static,
    {
        self.handle_func(topic, Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn handle_func(&mut self, topic: &str, handler: HandleFunc) -> BusResult<&mut Self> {
        if self.registry.insert(topic, handler)?.is_some() {
            debug!(topic, "Replaced topic handler");
        }
        Ok(self)
    }

    /// Registered topics in sorted order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.registry.topics()
    }

    /// Resolves once every topic is bound and its worker spawned. Dropped
    /// without firing when startup fails. Only the latest receiver fires.
    pub fn ready(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.ready = Some(tx);
        rx
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Connect to `url` and consume until `shutdown` fires.
    ///
    /// Startup failures are returned before any worker is spawned. Once
    /// running, the only way out is the shutdown signal.
    pub async fn run(self, url: &str, shutdown: ShutdownSignal) -> BusResult<()> {
        self.config.validate()?;
        let url = BrokerUrl::parse(url)?;
        let transport = transport::connect(&url).await?;
        self.run_on(transport, shutdown).await
    }

    /// [`Subscriber::run`] over an already-open transport, which this call
    /// takes ownership of and closes.
    pub async fn run_on(
        self,
        transport: Arc<dyn Transport>,
        mut shutdown: ShutdownSignal,
    ) -> BusResult<()> {
        let registry = Arc::new(self.registry.freeze());
        if registry.is_empty() {
            warn!(group = %self.config.consumer_group, "Subscriber running with no topics");
        }

        let streams = match declare_and_consume(&self.topology, &registry, transport.as_ref()).await
        {
            Ok(streams) => streams,
            Err(e) => {
                error!(error = %e, "Subscriber startup failed");
                let _ = transport.close().await;
                return Err(e);
            }
        };

        let mut workers = JoinSet::new();
        for (topic, stream) in streams {
            let Some(handler) = registry.get(&topic).cloned() else {
                continue;
            };
            let worker = TopicWorker {
                topic,
                handler,
                codec: Arc::clone(&self.codec),
            };
            workers.spawn(worker.run(stream, shutdown.clone()));
        }

        info!(
            backend = %self.topology.backend(),
            group = %self.config.consumer_group,
            transport = transport.name(),
            topics = registry.len(),
            "Subscriber running"
        );
        if let Some(ready) = self.ready {
            let _ = ready.send(());
        }

        shutdown.wait().await;
        info!("Subscriber stopping");

        // Ends every delivery stream, unblocking workers parked on a receive.
        if let Err(e) = transport.close().await {
            warn!(error = %e, "Closing broker connection failed");
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Topic worker terminated abnormally");
            }
        }

        info!("Subscriber stopped");
        Ok(())
    }
}

/// Declare every artifact the registry needs and open one stream per topic.
async fn declare_and_consume(
    topology: &Topology,
    registry: &TopicRegistry,
    transport: &dyn Transport,
) -> BusResult<Vec<(String, DeliveryStream)>> {
    if let Some(shared) = topology.shared_exchange() {
        transport
            .declare_exchange(&shared)
            .await
            .map_err(|e| BusError::topology(format!("exchange {}", shared.name), e))?;
    }

    let mut streams = Vec::with_capacity(registry.len());
    for topic in registry.topics() {
        let binding = topology.binding(topic);

        if topology.shared_exchange().is_none() {
            let source = topology.source_exchange(topic);
            transport
                .declare_exchange(&source)
                .await
                .map_err(|e| BusError::topology(format!("exchange {}", source.name), e))?;
        }

        transport
            .declare_queue(&topology.queue(&binding))
            .await
            .map_err(|e| BusError::topology(format!("queue {}", binding.queue), e))?;
        transport.bind_queue(&binding).await.map_err(|e| {
            BusError::topology(
                format!("binding {} -> {}", binding.exchange, binding.queue),
                e,
            )
        })?;
        let stream = transport
            .consume(&binding.queue)
            .await
            .map_err(|e| BusError::topology(format!("consumer on {}", binding.queue), e))?;

        info!(queue = %binding.queue, routing_key = %binding.routing_key, "Topic bound");
        streams.push((topic.to_string(), stream));
    }
    Ok(streams)
}

/// Delivery loop for a single topic.
struct TopicWorker {
    topic: String,
    handler: HandleFunc,
    codec: Arc<dyn PayloadCodec>,
}

impl TopicWorker {
    async fn run(self, mut stream: DeliveryStream, mut shutdown: ShutdownSignal) {
        ACTIVE_WORKERS.inc();
        log_topic_event!(info, "subscriber", "Topic worker started", self.topic);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.dispatch(delivery).await,
                Some(Err(e)) => {
                    log_topic_event!(
                        error,
                        "subscriber",
                        "Delivery stream failed, stopping worker",
                        self.topic,
                        error = %e
                    );
                    break;
                }
                None => {
                    debug!(topic = %self.topic, "Delivery stream ended");
                    break;
                }
            }
        }

        ACTIVE_WORKERS.dec();
        log_topic_event!(info, "subscriber", "Topic worker stopped", self.topic);
    }

    async fn dispatch(&self, delivery: Delivery) {
        MESSAGES_RECEIVED.with_label_values(&[self.topic.as_str()]).inc();

        let (payload, decode_error) = match self.codec.decode(&delivery.body) {
            Ok(payload) => (payload, None),
            Err(e) => {
                DECODE_FAILURES.with_label_values(&[self.topic.as_str()]).inc();
                warn!(topic = %self.topic, error = %e, bytes = delivery.body.len(), "Failed to decode delivery");
                (Payload::default(), Some(e))
            }
        };
        debug!(topic = %self.topic, trace_id = %payload.trace_id, "Dispatching delivery");

        let handler = Arc::clone(&self.handler);
        match tokio::task::spawn_blocking(move || handler(payload, decode_error)).await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                HANDLER_PANICS.with_label_values(&[self.topic.as_str()]).inc();
                error!(topic = %self.topic, "Handler panicked; continuing with next delivery");
            }
            Err(e) => {
                error!(topic = %self.topic, error = %e, "Handler task cancelled");
            }
        }
    }
}
