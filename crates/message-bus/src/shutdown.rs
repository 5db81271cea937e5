//! # Shutdown Coordination
//!
//! A one-shot, broadcast stop signal built on a `watch` channel. Every topic
//! worker holds a [`ShutdownSignal`] clone; a [`ShutdownTrigger`] flips it
//! once. Dropping every trigger also counts as shutdown, so a subscriber can
//! never outlive its owner by accident.
//!
//! [`ShutdownCoordinator`] wires the trigger to process signals (SIGINT and
//! SIGTERM on Unix, Ctrl-C elsewhere).

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Create a linked trigger and signal.
#[must_use]
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Sending half. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new receiving half for this trigger.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is requested or every trigger is gone.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Bridges OS termination signals to a [`ShutdownTrigger`].
pub struct ShutdownCoordinator {
    trigger: ShutdownTrigger,
    listener: Option<JoinHandle<()>>,
}

impl ShutdownCoordinator {
    /// Build a coordinator without listening to OS signals yet.
    #[must_use]
    pub fn new() -> Self {
        let (trigger, _) = channel();
        Self {
            trigger,
            listener: None,
        }
    }

    /// Build a coordinator and start listening for SIGINT/SIGTERM.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn install() -> Self {
        let mut coordinator = Self::new();
        let trigger = coordinator.trigger.clone();
        coordinator.listener = Some(tokio::spawn(async move {
            wait_for_os_signal().await;
            trigger.trigger();
        }));
        coordinator
    }

    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        self.trigger.signal()
    }

    #[must_use]
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        self.trigger.trigger();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install Unix signal handlers, using Ctrl-C");
                wait_for_ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = interrupt.recv() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            // Without a signal source only a programmatic trigger can stop us.
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
