//! # Delivery Semantics
//!
//! - distinct consumer groups each receive every message (fan-out)
//! - subscribers sharing a group split the stream (competing consumers)
//! - durable queues keep messages for a stopped group
//! - one publisher may be driven from many tasks at once

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::Harness;
    use message_bus::{Backend, MessagePublisher, Payload};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(200);

    async fn assert_fan_out(harness: Harness) {
        let mut billing = harness.subscribe("billing", &["order.created"]).await;
        let mut shipping = harness.subscribe("shipping", &["order.created"]).await;

        let publisher = harness.publisher().await;
        publisher
            .publish("order.created", 0, &Payload::new(json!({"order": 42})))
            .await
            .unwrap();

        for group in [&mut billing, &mut shipping] {
            let received = group.next_within(WAIT).await.expect("each group gets a copy");
            assert_eq!(received.topic, "order.created");
            assert_eq!(received.payload.data, json!({"order": 42}));
            assert!(received.error.is_none());
            assert!(group.next_within(QUIET).await.is_none(), "exactly one copy");
        }

        billing.stop().await.unwrap();
        shipping.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_across_groups_exchange_backend() {
        assert_fan_out(Harness::new("it-fanout-exchange", Backend::Exchange)).await;
    }

    #[tokio::test]
    async fn test_fan_out_across_groups_queue_backend() {
        assert_fan_out(Harness::new("it-fanout-queue", Backend::Queue)).await;
    }

    async fn assert_competing_consumers(harness: Harness) {
        let mut first = harness.subscribe("workers", &["jobs"]).await;
        let mut second = harness.subscribe("workers", &["jobs"]).await;

        let publisher = harness.publisher().await;
        for n in 0..20 {
            publisher.publish("jobs", 0, &Payload::new(json!(n))).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut per_consumer = [0usize; 2];
        while seen.len() < 20 {
            tokio::select! {
                Some(r) = first.received.recv() => { per_consumer[0] += 1; seen.push(r); }
                Some(r) = second.received.recv() => { per_consumer[1] += 1; seen.push(r); }
                _ = tokio::time::sleep(WAIT) => break,
            }
        }

        let values: BTreeSet<i64> = seen
            .iter()
            .filter_map(|r| r.payload.data.as_i64())
            .collect();
        assert_eq!(seen.len(), 20, "no message lost or duplicated");
        assert_eq!(values, (0..20).collect::<BTreeSet<_>>());
        assert!(per_consumer[0] > 0 && per_consumer[1] > 0, "{per_consumer:?}");

        assert!(first.next_within(QUIET).await.is_none());
        assert!(second.next_within(QUIET).await.is_none());

        first.stop().await.unwrap();
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_competing_consumers_exchange_backend() {
        assert_competing_consumers(Harness::new("it-compete-exchange", Backend::Exchange)).await;
    }

    #[tokio::test]
    async fn test_competing_consumers_queue_backend() {
        assert_competing_consumers(Harness::new("it-compete-queue", Backend::Queue)).await;
    }

    #[tokio::test]
    async fn test_messages_wait_for_stopped_group() {
        let harness = Harness::new("it-durable", Backend::Exchange);
        let subscriber = harness.subscribe("audit", &["user.deleted"]).await;
        subscriber.stop().await.unwrap();

        let publisher = harness.publisher().await;
        publisher
            .publish_json("user.deleted", 0, &json!({"user": 9}))
            .await
            .unwrap();
        assert_eq!(harness.broker.queue_depth("audit-user.deleted"), Some(1));

        let mut restarted = harness.subscribe("audit", &["user.deleted"]).await;
        let received = restarted.next_within(WAIT).await.expect("kept while stopped");
        assert_eq!(received.payload.data, json!({"user": 9}));
        assert_eq!(received.payload.publisher.app_name, "bus-tests");
        restarted.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_publishers_share_one_channel() {
        let harness = Harness::new("it-concurrent", Backend::Queue);
        let mut subscriber = harness.subscribe("sink", &["metrics"]).await;
        let publisher = Arc::new(harness.publisher().await);

        let mut tasks = Vec::new();
        for task in 0..8 {
            let publisher = Arc::clone(&publisher);
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    publisher
                        .publish("metrics", 0, &Payload::new(json!({"task": task, "n": n})))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        let received = subscriber.take(200, WAIT).await;
        assert_eq!(received.len(), 200);

        // Per-queue FIFO: each task's messages arrive in the order it sent them.
        for task in 0..8 {
            let order: Vec<i64> = received
                .iter()
                .filter(|r| r.payload.data["task"] == json!(task))
                .filter_map(|r| r.payload.data["n"].as_i64())
                .collect();
            assert_eq!(order, (0..25).collect::<Vec<_>>());
        }
        subscriber.stop().await.unwrap();
    }
}
