//! Test harness: a named in-process broker plus subscribers whose handlers
//! forward every call to a channel.

use message_bus::{
    shutdown, Backend, BusConfig, BusError, CodecError, InMemoryBroker, Payload, Publisher,
    ShutdownTrigger, Subscriber,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// One handler invocation.
#[derive(Debug)]
pub struct Received {
    pub topic: String,
    pub payload: Payload,
    pub error: Option<CodecError>,
    pub at: Instant,
}

/// A subscriber running in the background.
pub struct RunningSubscriber {
    pub trigger: ShutdownTrigger,
    pub handle: JoinHandle<Result<(), BusError>>,
    pub received: mpsc::UnboundedReceiver<Received>,
}

impl RunningSubscriber {
    /// Next handler call, or `None` if nothing arrives within `within`.
    pub async fn next_within(&mut self, within: Duration) -> Option<Received> {
        timeout(within, self.received.recv()).await.ok().flatten()
    }

    /// Receive exactly `count` handler calls.
    pub async fn take(&mut self, count: usize, within: Duration) -> Vec<Received> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match self.next_within(within).await {
                Some(received) => out.push(received),
                None => break,
            }
        }
        out
    }

    /// Trigger shutdown and wait for `run` to return.
    pub async fn stop(self) -> Result<(), BusError> {
        self.trigger.trigger();
        timeout(Duration::from_secs(3), self.handle)
            .await
            .expect("subscriber did not stop in time")
            .expect("subscriber task panicked")
    }
}

/// A broker registered under a test-unique name, so `memory://` URLs reach it.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub backend: Backend,
}

impl Harness {
    pub fn new(name: &str, backend: Backend) -> Self {
        Self {
            broker: InMemoryBroker::named(name),
            backend,
        }
    }

    pub fn url(&self) -> String {
        self.broker.url()
    }

    pub fn config(&self, group: &str) -> BusConfig {
        BusConfig::new(self.backend, self.url())
            .with_consumer_group(group)
            .with_app_name("bus-tests")
    }

    pub async fn publisher(&self) -> Publisher {
        Publisher::connect(&self.url(), &self.config("publisher"))
            .await
            .expect("publisher connects")
    }

    /// Start a subscriber for `topics` in `group` and wait until it is bound.
    pub async fn subscribe(&self, group: &str, topics: &[&str]) -> RunningSubscriber {
        let (tx, received) = mpsc::unbounded_channel();
        let mut subscriber = Subscriber::new(self.config(group));
        for topic in topics {
            let tx = tx.clone();
            let name = topic.to_string();
            subscriber
                .handle(topic, move |payload, error| {
                    let _ = tx.send(Received {
                        topic: name.clone(),
                        payload,
                        error,
                        at: Instant::now(),
                    });
                })
                .expect("valid topic");
        }

        let ready = subscriber.ready();
        let (trigger, signal) = shutdown::channel();
        let url = self.url();
        let handle = tokio::spawn(async move { subscriber.run(&url, signal).await });

        timeout(Duration::from_secs(2), ready)
            .await
            .expect("subscriber did not become ready")
            .expect("subscriber failed during startup");

        RunningSubscriber {
            trigger,
            handle,
            received,
        }
    }
}
