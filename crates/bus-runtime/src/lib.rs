//! # Bus Runtime
//!
//! Wires a [`Subscriber`] and a [`Publisher`] from one [`BusConfig`] and runs
//! them until shutdown.
//!
//! ## Startup Sequence
//!
//! 1. Register handlers (the built-in `ping` handler)
//! 2. Start the subscriber and wait until every topic is bound
//! 3. Connect the publisher and announce this instance with one `ping`
//! 4. Block until the shutdown signal fires
//! 5. Stop and join the subscriber, then close the publisher

pub mod handlers;

use anyhow::{anyhow, Context, Result};
use bus_telemetry::log_event;
use message_bus::{shutdown, BusConfig, BusResult, Publisher, ShutdownSignal, Subscriber};
use tokio::task::{JoinError, JoinHandle};

pub use handlers::{Ping, PING_TOPIC};

/// The process-level owner of the bus.
pub struct BusRuntime {
    config: BusConfig,
}

impl BusRuntime {
    pub fn new(config: BusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Build a subscriber with every runtime handler registered.
    pub fn subscriber(&self) -> Result<Subscriber> {
        let mut subscriber = Subscriber::new(self.config.clone());
        subscriber
            .handle(PING_TOPIC, handlers::log_ping)
            .context("failed to register ping handler")?;
        Ok(subscriber)
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        self.run_with_publisher(shutdown, &self.config.url).await
    }

    /// The subscriber is stopped and joined on every exit path, including a
    /// publisher that cannot connect.
    async fn run_with_publisher(
        &self,
        mut shutdown: ShutdownSignal,
        publisher_url: &str,
    ) -> Result<()> {
        log_event!(
            info,
            "runtime",
            "Starting bus runtime",
            backend = %self.config.backend,
            group = %self.config.consumer_group
        );

        let mut subscriber = self.subscriber()?;
        let ready = subscriber.ready();
        let url = self.config.url.clone();
        let (stop, subscriber_shutdown) = shutdown::channel();
        let mut subscriber_task =
            tokio::spawn(async move { subscriber.run(&url, subscriber_shutdown).await });

        if ready.await.is_err() {
            // The subscriber exited before binding its topics; report why.
            return join_subscriber(subscriber_task)
                .await
                .context("subscriber failed to start");
        }

        let publisher = match Publisher::connect(publisher_url, &self.config).await {
            Ok(publisher) => publisher,
            Err(e) => {
                stop.trigger();
                if let Err(stop_err) = join_subscriber(subscriber_task).await {
                    log_event!(warn, "runtime", "Subscriber stopped with an error", error = %stop_err);
                }
                return Err(e).context("failed to connect publisher");
            }
        };
        let ping = Ping::new(publisher.application().app_instance.clone());
        if let Err(e) = publisher.publish_json(PING_TOPIC, 0, &ping).await {
            log_event!(warn, "runtime", "Startup ping not published", error = %e);
        }

        log_event!(info, "runtime", "Bus runtime is running");

        let exited_early = tokio::select! {
            joined = &mut subscriber_task => Some(flatten(joined)),
            () = shutdown.wait() => None,
        };
        let outcome = match exited_early {
            Some(outcome) => outcome,
            None => {
                stop.trigger();
                join_subscriber(subscriber_task).await
            }
        }
        .context("subscriber stopped with an error");

        publisher
            .close()
            .await
            .context("failed to close publisher")?;
        log_event!(info, "runtime", "Bus runtime stopped");
        outcome
    }
}

async fn join_subscriber(task: JoinHandle<BusResult<()>>) -> Result<()> {
    flatten(task.await)
}

fn flatten(joined: std::result::Result<BusResult<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(anyhow!("subscriber task failed: {e}")),
    }
}
