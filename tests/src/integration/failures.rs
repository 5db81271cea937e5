//! # Failure Handling
//!
//! Per-message failures go to the handler; startup failures come back from
//! `run` before any worker starts.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::Harness;
    use message_bus::{
        shutdown, Backend, BusConfig, BusError, CodecError, MessagePublisher, Payload, Publisher,
        Subscriber, Transport,
    };
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_malformed_body_reaches_handler_as_error() {
        let harness = Harness::new("it-malformed", Backend::Queue);
        let mut subscriber = harness.subscribe("readers", &["events"]).await;

        harness
            .broker
            .inject("events.readers", b"\xff{not json".to_vec())
            .unwrap();

        let bad = subscriber
            .next_within(Duration::from_secs(1))
            .await
            .expect("handler still invoked");
        assert!(matches!(bad.error, Some(CodecError::Decode(_))));
        assert_eq!(bad.payload, Payload::default());

        let publisher = harness.publisher().await;
        publisher
            .publish("events", 0, &Payload::new(json!({"ok": true})))
            .await
            .unwrap();
        let good = subscriber
            .next_within(Duration::from_secs(1))
            .await
            .expect("worker survived the bad message");
        assert!(good.error.is_none());
        assert_eq!(good.payload.data, json!({"ok": true}));

        subscriber.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_connecting() {
        let mut subscriber = Subscriber::new(BusConfig::default());
        subscriber.handle("a", |_, _| {}).unwrap();
        let (_trigger, signal) = shutdown::channel();

        let err = subscriber.run("localhost:5672", signal).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidUrl { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_queue_scheme_without_client_is_connection_error() {
        let config = BusConfig::new(Backend::Queue, "nsq://nsqd:4150");
        let err = Publisher::connect("nsq://nsqd:4150", &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BusError::Connection(_)));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_conflicting_exchange_is_topology_error() {
        let harness = Harness::new("it-topology", Backend::Exchange);
        let squatter = harness.broker.connect();
        squatter
            .declare_exchange(&message_bus::topology::ExchangeSpec {
                name: "delayed.exchange".into(),
                kind: message_bus::topology::ExchangeKind::Fanout,
                durable: true,
            })
            .await
            .unwrap();

        let mut subscriber = Subscriber::new(harness.config("g"));
        subscriber.handle("orders", |_, _| {}).unwrap();
        let (_trigger, signal) = shutdown::channel();

        let err = subscriber.run(&harness.url(), signal).await.unwrap_err();
        match err {
            BusError::Topology { what, reason } => {
                assert_eq!(what, "exchange delayed.exchange");
                assert!(reason.contains("PRECONDITION_FAILED"));
            }
            other => panic!("expected topology error, got {other:?}"),
        }
        // Only the squatter's connection is left open.
        assert_eq!(harness.broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected_at_registration_and_publish() {
        let harness = Harness::new("it-invalid-topic", Backend::Exchange);
        let mut subscriber = Subscriber::new(harness.config("g"));
        assert!(matches!(
            subscriber.handle("", |_, _| {}),
            Err(BusError::InvalidTopic(_))
        ));

        let publisher = harness.publisher().await;
        let err = publisher.publish("", 0, &Payload::default()).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidTopic(_)));
        assert_eq!(harness.broker.published_count(), 0);
    }
}
