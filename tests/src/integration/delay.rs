//! # Delayed Delivery
//!
//! Exchange backend holds delayed messages broker-side; queue backend
//! refuses them before anything reaches the wire.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::Harness;
    use message_bus::{Backend, BusError, MessagePublisher, Payload};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delayed_message_arrives_after_immediate_one() {
        let harness = Harness::new("it-delay-order", Backend::Exchange);
        let mut subscriber = harness.subscribe("reminders", &["reminder"]).await;
        let publisher = harness.publisher().await;

        publisher
            .publish("reminder", 1000, &Payload::new(json!("m1")))
            .await
            .unwrap();
        publisher
            .publish("reminder", 0, &Payload::new(json!("m2")))
            .await
            .unwrap();

        let first = subscriber
            .next_within(Duration::from_secs(1))
            .await
            .expect("immediate message");
        let second = subscriber
            .next_within(Duration::from_secs(3))
            .await
            .expect("delayed message");

        assert_eq!(first.payload.data, json!("m2"));
        assert_eq!(second.payload.data, json!("m1"));
        assert!(
            second.at - first.at >= Duration::from_millis(500),
            "gap was {:?}",
            second.at - first.at
        );
        subscriber.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_equal_delays_keep_publish_order() {
        let harness = Harness::new("it-delay-ties", Backend::Exchange);
        let mut subscriber = harness.subscribe("batch", &["tick"]).await;
        let publisher = harness.publisher().await;

        for n in 0..5 {
            publisher
                .publish("tick", 100, &Payload::new(json!(n)))
                .await
                .unwrap();
        }
        let order: Vec<_> = subscriber
            .take(5, Duration::from_secs(2))
            .await
            .into_iter()
            .map(|r| r.payload.data)
            .collect();
        // Each publish stamps a later deadline, so publish order is kept.
        assert_eq!(order, (0..5).map(|n| json!(n)).collect::<Vec<_>>());
        subscriber.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_backend_rejects_delay() {
        let harness = Harness::new("it-delay-unsupported", Backend::Queue);
        let mut subscriber = harness.subscribe("reminders", &["reminder"]).await;
        let publisher = harness.publisher().await;

        let err = publisher
            .publish("reminder", 500, &Payload::new(json!("later")))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BusError::UnsupportedFeature {
                backend: "queue",
                ..
            }
        ));
        assert!(err.is_permanent());
        assert_eq!(harness.broker.published_count(), 0);
        assert!(subscriber
            .next_within(Duration::from_millis(300))
            .await
            .is_none());

        // Immediate delivery still works on the same publisher.
        publisher
            .publish("reminder", 0, &Payload::new(json!("now")))
            .await
            .unwrap();
        let received = subscriber.next_within(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.payload.data, json!("now"));
        subscriber.stop().await.unwrap();
    }
}
