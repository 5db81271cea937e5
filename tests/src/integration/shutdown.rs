//! # Coordinated Shutdown
//!
//! A single trigger stops every topic worker, the connection is closed once,
//! and `run` returns within a bounded time.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::Harness;
    use message_bus::{Backend, BusError, MessagePublisher, Payload};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    #[tokio::test]
    async fn test_three_workers_stop_together() {
        let harness = Harness::new("it-shutdown", Backend::Exchange);
        let subscriber = harness
            .subscribe("svc", &["alpha", "beta", "gamma"])
            .await;
        assert_eq!(harness.broker.open_connections(), 1);
        assert_eq!(harness.broker.bindings("delayed.exchange").len(), 3);

        let started = Instant::now();
        subscriber.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(harness.broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_messages_pending() {
        let harness = Harness::new("it-shutdown-busy", Backend::Queue);
        let mut subscriber = harness.subscribe("svc", &["work"]).await;
        let publisher = harness.publisher().await;

        for n in 0..3 {
            publisher
                .publish("work", 0, &Payload::new(json!(n)))
                .await
                .unwrap();
        }
        assert!(subscriber.next_within(Duration::from_secs(1)).await.is_some());

        timeout(Duration::from_secs(2), subscriber.stop())
            .await
            .unwrap()
            .unwrap();

        publisher.close().await.unwrap();
        assert!(matches!(publisher.close().await, Err(BusError::Closed)));
        assert_eq!(harness.broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_coordinator_signal_drives_subscriber() {
        let harness = Harness::new("it-shutdown-coordinator", Backend::Queue);
        let coordinator = message_bus::ShutdownCoordinator::new();

        let mut subscriber = message_bus::Subscriber::new(harness.config("svc"));
        subscriber.handle("a", |_, _| {}).unwrap();
        let ready = subscriber.ready();
        let signal = coordinator.signal();
        let url = harness.url();
        let run = tokio::spawn(async move { subscriber.run(&url, signal).await });

        ready.await.unwrap();
        coordinator.shutdown();
        timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(harness.broker.open_connections(), 0);
    }
}
