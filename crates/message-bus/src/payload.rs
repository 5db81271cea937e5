//! # Payload Envelope and Codec
//!
//! The envelope every message travels in, plus the codec that turns it into
//! wire bytes. The bus treats `data` as opaque; only the codec looks inside.
//!
//! Wire format (JSON):
//!
//! ```text
//! {"data": <any>, "publisher": {"appName": "...", "appInstance": "...", "startTime": "..."}, "traceId": "..."}
//! ```

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the process that published a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationData {
    pub app_name: String,
    pub app_instance: String,
    pub start_time: String,
}

impl ApplicationData {
    /// Describe the current process, stamping a random instance id and the
    /// start time.
    #[must_use]
    pub fn new(app_name: impl Into<String>) -> Self {
        let instance = Uuid::new_v4().simple().to_string();
        Self {
            app_name: app_name.into(),
            app_instance: instance[..8].to_string(),
            start_time: chrono::Utc::now().format("%Y%m%d%H%M%S").to_string(),
        }
    }

    /// Use a fixed instance id instead of a random one.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.app_instance = instance.into();
        self
    }
}

/// Message envelope.
///
/// A value type: handlers receive their own copy and may keep it past the
/// handler call. `Payload::default()` is the zero value handed to a handler
/// when the body could not be decoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub publisher: ApplicationData,
    #[serde(default)]
    pub trace_id: String,
}

impl Payload {
    /// Wrap raw JSON data.
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Wrap any serializable value.
    pub fn from_data<T: Serialize>(data: &T) -> Result<Self, CodecError> {
        let value = serde_json::to_value(data).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Self::new(value))
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: ApplicationData) -> Self {
        self.publisher = publisher;
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Assign a fresh trace id if none is set.
    #[must_use]
    pub fn ensure_trace_id(mut self) -> Self {
        if self.trace_id.is_empty() {
            self.trace_id = Uuid::new_v4().simple().to_string();
        }
        self
    }

    /// Interpret `data` as a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.data.clone()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Turns payloads into wire bytes and back.
pub trait PayloadCodec: Send + Sync {
    /// Serialize a payload.
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, CodecError>;

    /// Deserialize a payload.
    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError>;

    /// MIME type attached to published messages.
    fn content_type(&self) -> &'static str;
}

/// JSON codec, the default wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
