use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{CodecError, UnixMillis, CONTENT_TYPE_JSON};

/// Routing and identity metadata for one message.
///
/// A header is immutable once its message is registered with the outbox:
/// the ledger stores it serialized as JSON and replays it verbatim on
/// dispatch, so a redelivered or re-published message always carries the
/// exact header it was registered with.
///
/// `properties` holds broker-native key/value pairs (correlation ids,
/// trace context, per-broker extensions) that travel with the message but
/// that this layer never interprets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Globally unique numeric id, minted by [`IdGenerator`](super::IdGenerator).
    pub message_id: i64,
    pub timestamp: UnixMillis,
    pub app_id: String,
    pub content_type: String,
    /// Logical type name of the payload, e.g. `"OrderCreated"`. Consumers
    /// are registered against `(queue, type_name)`.
    pub type_name: String,
    pub exchange: String,
    pub routing_key: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

impl MessageHeader {
    /// Create a header with the given id and logical type name.
    ///
    /// Defaults: current timestamp, JSON content type, empty app id,
    /// default exchange, empty routing key.
    pub fn new(message_id: i64, type_name: impl Into<String>) -> Self {
        Self {
            message_id,
            timestamp: UnixMillis::now(),
            app_id: String::new(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            type_name: type_name.into(),
            exchange: String::new(),
            routing_key: String::new(),
            properties: HashMap::new(),
        }
    }

    /// Set the destination exchange and routing key.
    pub fn route_to(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: UnixMillis) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a broker-native property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Get a broker-native property by key.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|v| v.as_str())
    }

    /// Serialize to the JSON form stored in the ledger's `message_header` column.
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a header back from its ledger JSON form.
    pub fn from_json(json: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(json)?)
    }
}
