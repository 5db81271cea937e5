//! # In-Process Broker
//!
//! A broker living inside the process, modelling both broker families:
//!
//! - exchanges (`topic`, `fanout`, delayed `topic`) with routing-key bindings
//! - durable queues that keep messages while nobody consumes them
//! - competing consumers: every consumer of a queue pulls from the same
//!   receiver, so each message goes to exactly one of them
//! - delayed delivery through a holding queue and release loop per delayed
//!   exchange
//!
//! Brokers are looked up by name so that `memory://<name>` URLs used by a
//! publisher and a subscriber in different components reach the same broker.
//! Named brokers live until [`InMemoryBroker::unregister`]. A delayed
//! exchange's release loop runs on the runtime that last held a message for
//! it; if that runtime is gone, the next delayed publish starts a new loop.

use super::delay::{spawn_release_loop, DelayLine};
use super::{Delivery, DeliveryStream, OutboundMessage, Transport};
use crate::error::{BusError, BusResult};
use crate::topology::{DeliveryBinding, ExchangeKind, ExchangeSpec, QueueSpec, DELAY_HEADER};
use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

lazy_static! {
    static ref BROKERS: Mutex<HashMap<String, InMemoryBroker>> = Mutex::new(HashMap::new());
}

/// AMQP topic matching: words separated by `.`, `*` matches exactly one
/// word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

struct QueueState {
    spec: QueueSpec,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    ready: AtomicUsize,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            spec,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            ready: AtomicUsize::new(0),
        }
    }

    fn push(&self, delivery: Delivery) {
        // The queue owns its receiver, so the channel cannot be closed.
        if self.sender.send(delivery).is_ok() {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Wait for the next message. Consumers queue up on the receiver lock,
    /// which hands messages out round-robin.
    async fn recv(&self) -> Option<Delivery> {
        let mut receiver = self.receiver.lock().await;
        let delivery = receiver.recv().await;
        if delivery.is_some() {
            self.ready.fetch_sub(1, Ordering::SeqCst);
        }
        delivery
    }
}

struct ExchangeState {
    spec: ExchangeSpec,
    /// `(queue, routing pattern)` pairs.
    bindings: Vec<(String, String)>,
    delay: Option<Arc<DelayLine>>,
    releaser: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, Arc<QueueState>>,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> usize {
        let Some(state) = self.exchanges.get(exchange) else {
            return 0;
        };

        let targets: Vec<&Arc<QueueState>> = state
            .bindings
            .iter()
            .filter(|(_, pattern)| match state.spec.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic | ExchangeKind::DelayedTopic => {
                    topic_matches(pattern, routing_key)
                }
            })
            .filter_map(|(queue, _)| self.queues.get(queue))
            .collect();

        for queue in &targets {
            queue.push(Delivery {
                body: message.body.clone(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                headers: message.headers.clone(),
            });
        }

        trace!(exchange, routing_key, queues = targets.len(), "Routed message");
        targets.len()
    }
}

struct BrokerInner {
    name: String,
    state: Mutex<BrokerState>,
    open_connections: AtomicUsize,
    published: AtomicU64,
    next_connection: AtomicU64,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        for exchange in self.state.get_mut().exchanges.values() {
            if let Some(line) = &exchange.delay {
                line.stop();
            }
        }
    }
}

/// Handle to an in-process broker. Cheap to clone.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create an unregistered broker, reachable only through this handle.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                name: name.into(),
                state: Mutex::new(BrokerState::default()),
                open_connections: AtomicUsize::new(0),
                published: AtomicU64::new(0),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Get or create the process-wide broker registered under `name`.
    #[must_use]
    pub fn named(name: &str) -> Self {
        BROKERS
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Self::new(name))
            .clone()
    }

    /// Drop the process-wide registration for `name`. Existing handles keep
    /// working; the next [`InMemoryBroker::named`] call creates a fresh broker.
    pub fn unregister(name: &str) -> bool {
        BROKERS.lock().remove(name).is_some()
    }

    /// `memory://` URL that resolves to this broker if it is registered.
    #[must_use]
    pub fn url(&self) -> String {
        format!("memory://{}", self.inner.name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Open a new connection.
    #[must_use]
    pub fn connect(&self) -> MemoryConnection {
        self.inner.open_connections.fetch_add(1, Ordering::SeqCst);
        let (closed, _) = watch::channel(false);
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        debug!(broker = %self.inner.name, connection = id, "Memory connection opened");
        MemoryConnection {
            broker: self.clone(),
            id,
            closed,
        }
    }

    /// Connections opened and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    /// Publish calls the broker accepted.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Messages waiting in a queue, or `None` if it was never declared.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.load(Ordering::SeqCst))
    }

    /// Messages held by a delayed exchange.
    #[must_use]
    pub fn held_count(&self, exchange: &str) -> usize {
        self.inner
            .state
            .lock()
            .exchanges
            .get(exchange)
            .and_then(|e| e.delay.as_ref())
            .map_or(0, |line| line.len())
    }

    #[must_use]
    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.inner
            .state
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.spec.kind)
    }

    /// Queues bound to an exchange, with their routing patterns.
    #[must_use]
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.inner
            .state
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Put raw bytes straight into a queue, bypassing exchanges.
    pub fn inject(&self, queue: &str, body: Vec<u8>) -> BusResult<()> {
        let state = self.inner.state.lock();
        let target = state
            .queues
            .get(queue)
            .ok_or_else(|| BusError::Transport(format!("no queue {queue:?}")))?;
        target.push(Delivery {
            body,
            exchange: String::new(),
            routing_key: queue.to_string(),
            headers: Default::default(),
        });
        Ok(())
    }

    fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()> {
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing.spec != *spec {
                return Err(BusError::Transport(format!(
                    "PRECONDITION_FAILED: exchange {:?} already declared as {} (durable: {})",
                    spec.name,
                    existing.spec.kind.wire_name(),
                    existing.spec.durable
                )));
            }
            return Ok(());
        }

        let (delay, releaser) = match spec.kind {
            ExchangeKind::DelayedTopic => {
                let line = DelayLine::new();
                let releaser = self.start_release_loop(&spec.name, &line);
                (Some(line), Some(releaser))
            }
            ExchangeKind::Topic | ExchangeKind::Fanout => (None, None),
        };

        debug!(exchange = %spec.name, kind = spec.kind.wire_name(), "Exchange declared");
        state.exchanges.insert(
            spec.name.clone(),
            ExchangeState {
                spec: spec.clone(),
                bindings: Vec::new(),
                delay,
                releaser,
            },
        );
        Ok(())
    }

    fn start_release_loop(&self, exchange: &str, line: &Arc<DelayLine>) -> JoinHandle<()> {
        let broker = Arc::downgrade(&self.inner);
        let exchange = exchange.to_string();
        spawn_release_loop(Arc::clone(line), move |routing_key, message| {
            if let Some(inner) = broker.upgrade() {
                inner.state.lock().route(&exchange, &routing_key, message);
            }
        })
    }

    fn declare_queue(&self, spec: &QueueSpec) -> BusResult<()> {
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec != *spec {
                return Err(BusError::Transport(format!(
                    "PRECONDITION_FAILED: queue {:?} already declared with durable: {}",
                    spec.name, existing.spec.durable
                )));
            }
            return Ok(());
        }

        debug!(queue = %spec.name, "Queue declared");
        state
            .queues
            .insert(spec.name.clone(), Arc::new(QueueState::new(spec.clone())));
        Ok(())
    }

    fn bind_queue(&self, binding: &DeliveryBinding) -> BusResult<()> {
        let mut state = self.inner.state.lock();
        if !state.queues.contains_key(&binding.queue) {
            return Err(BusError::Transport(format!(
                "NOT_FOUND: no queue {:?}",
                binding.queue
            )));
        }
        let exchange = state.exchanges.get_mut(&binding.exchange).ok_or_else(|| {
            BusError::Transport(format!("NOT_FOUND: no exchange {:?}", binding.exchange))
        })?;

        let pair = (binding.queue.clone(), binding.routing_key.clone());
        if !exchange.bindings.contains(&pair) {
            exchange.bindings.push(pair);
        }
        Ok(())
    }

    fn queue(&self, queue: &str) -> BusResult<Arc<QueueState>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| BusError::Transport(format!("NOT_FOUND: no queue {queue:?}")))
    }

    fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> BusResult<()> {
        let mut state = self.inner.state.lock();
        let target = state.exchanges.get_mut(exchange).ok_or_else(|| {
            BusError::Transport(format!("NOT_FOUND: no exchange {exchange:?}"))
        })?;
        self.inner.published.fetch_add(1, Ordering::SeqCst);

        let delay_ms = message
            .headers
            .get(DELAY_HEADER)
            .and_then(|value| value.as_int())
            .unwrap_or(0);

        if let (Some(line), true) = (&target.delay, delay_ms > 0) {
            // The loop dies with the runtime that spawned it.
            if target.releaser.as_ref().map_or(true, JoinHandle::is_finished) {
                debug!(exchange, "Starting delay release loop");
                target.releaser = Some(self.start_release_loop(exchange, line));
            }
            let delay = Duration::from_millis(delay_ms.unsigned_abs());
            line.hold(routing_key.to_string(), message, delay);
            return Ok(());
        }

        state.route(exchange, routing_key, message);
        Ok(())
    }
}

/// One connection to an [`InMemoryBroker`].
pub struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    closed: watch::Sender<bool>,
}

impl MemoryConnection {
    #[must_use]
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> BusResult<()> {
        if *self.closed.borrow() {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    /// Mark closed; true only for the call that actually closed it.
    fn mark_closed(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            self.broker
                .inner
                .open_connections
                .fetch_sub(1, Ordering::SeqCst);
            debug!(broker = %self.broker.inner.name, connection = self.id, "Memory connection closed");
        }
        !was_closed
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

#[async_trait]
impl Transport for MemoryConnection {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()> {
        self.ensure_open()?;
        self.broker.declare_exchange(spec)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<()> {
        self.ensure_open()?;
        self.broker.declare_queue(spec)
    }

    async fn bind_queue(&self, binding: &DeliveryBinding) -> BusResult<()> {
        self.ensure_open()?;
        self.broker.bind_queue(binding)
    }

    async fn consume(&self, queue: &str) -> BusResult<DeliveryStream> {
        self.ensure_open()?;
        let queue = self.broker.queue(queue)?;
        let closed = self.closed.subscribe();

        let stream = futures::stream::unfold((queue, closed), |(queue, mut closed)| async move {
            if *closed.borrow() {
                return None;
            }
            let next = tokio::select! {
                biased;
                _ = closed.changed() => None,
                delivery = queue.recv() => delivery,
            };
            next.map(|delivery| (Ok(delivery), (queue, closed)))
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
        self.broker.publish(exchange, routing_key, message)
    }

    async fn close(&self) -> BusResult<()> {
        if self.mark_closed() {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
