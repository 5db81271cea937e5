//! # Bus Errors
//!
//! Every failure the bus can produce. Startup failures (connection, topology,
//! configuration) come back from `run`/`connect`; per-message decode failures
//! are handed to the topic handler instead of being raised.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type BusResult<T> = Result<T, BusError>;

/// Payload encode/decode failures.
///
/// `Clone` so the same value can be logged and handed to a handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// Errors returned by publishers, subscribers and transports.
#[derive(Debug, Error)]
pub enum BusError {
    /// Broker unreachable, authentication refused, or channel lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// A broker-level operation failed on an open connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Exchange/queue/binding declaration failed during startup.
    #[error("topology error while declaring {what}: {reason}")]
    Topology { what: String, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The selected backend cannot honor the requested capability.
    #[error("{backend} backend does not support {feature}")]
    UnsupportedFeature {
        backend: &'static str,
        feature: &'static str,
    },

    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),

    #[error("invalid broker url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The connection was already closed by this owner.
    #[error("connection already closed")]
    Closed,
}

impl BusError {
    /// Whether retrying the same call can never succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFeature { .. }
                | Self::InvalidTopic(_)
                | Self::InvalidUrl { .. }
                | Self::Config(_)
                | Self::Codec(CodecError::Encode(_))
        )
    }

    /// Short label used for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Transport(_) => "transport",
            Self::Topology { .. } => "topology",
            Self::Codec(_) => "codec",
            Self::UnsupportedFeature { .. } => "unsupported_feature",
            Self::InvalidTopic(_) => "invalid_topic",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Config(_) => "config",
            Self::Closed => "closed",
        }
    }

    pub(crate) fn topology(what: impl Into<String>, source: BusError) -> Self {
        Self::Topology {
            what: what.into(),
            reason: source.to_string(),
        }
    }
}
