//! Handlers the runtime registers on its own subscriber.

use bus_telemetry::{log_event, log_topic_event};
use message_bus::{CodecError, Payload};
use serde::{Deserialize, Serialize};

/// Topic every runtime instance announces itself on.
pub const PING_TOPIC: &str = "ping";

/// Liveness announcement published once on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub instance: String,
    pub sent_at: String,
}

impl Ping {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            sent_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Log every ping; decode failures are logged and dropped.
pub fn log_ping(payload: Payload, err: Option<CodecError>) {
    if let Some(err) = err {
        log_topic_event!(warn, "runtime", "Malformed ping", PING_TOPIC, error = %err);
        return;
    }

    match payload.data_as::<Ping>() {
        Ok(ping) => log_event!(
            info,
            "runtime",
            "Ping received",
            from = %ping.instance,
            sent_at = %ping.sent_at,
            publisher = %payload.publisher.app_name,
            trace_id = %payload.trace_id
        ),
        Err(e) => log_topic_event!(warn, "runtime", "Unexpected ping body", PING_TOPIC, error = %e),
    }
}
