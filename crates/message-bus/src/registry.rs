//! # Topic Registry
//!
//! Two-phase topic → handler mapping. Handlers are collected on a mutable
//! [`TopicRegistryBuilder`]; `freeze` turns it into an immutable
//! [`TopicRegistry`] that every topic worker shares without locking.

use crate::error::{BusError, BusResult, CodecError};
use crate::payload::Payload;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Callback invoked once per delivered message.
///
/// The second argument carries the decode failure, if any; the payload is
/// then `Payload::default()`.
pub type HandleFunc = Arc<dyn Fn(Payload, Option<CodecError>) + Send + Sync>;

/// Reject topics that cannot be used as routing keys or queue suffixes.
pub fn validate_topic(topic: &str) -> BusResult<()> {
    if topic.is_empty() || topic.chars().any(|c| c.is_whitespace() || c == '#' || c == '*') {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Mutable registration phase.
#[derive(Default)]
pub struct TopicRegistryBuilder {
    handlers: BTreeMap<String, HandleFunc>,
}

impl TopicRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A second registration for the same topic replaces
    /// the first; the replaced handler is returned.
    pub fn insert(&mut self, topic: &str, handler: HandleFunc) -> BusResult<Option<HandleFunc>> {
        validate_topic(topic)?;
        Ok(self.handlers.insert(topic.to_string(), handler))
    }

    /// Registered topics in sorted order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// End the registration phase.
    #[must_use]
    pub fn freeze(self) -> TopicRegistry {
        TopicRegistry {
            handlers: self.handlers,
        }
    }
}

/// Frozen snapshot read by all topic workers.
#[derive(Clone)]
pub struct TopicRegistry {
    handlers: BTreeMap<String, HandleFunc>,
}

impl TopicRegistry {
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&HandleFunc> {
        self.handlers.get(topic)
    }

    /// Topics in lexical order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HandleFunc)> {
        self.handlers.iter().map(|(topic, handler)| (topic.as_str(), handler))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
