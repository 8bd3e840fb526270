use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::UI_BROADCAST_ID;

/// Envelope for all hub communication: requests, responses and broadcasts.
///
/// The hub's payload shapes are versioned by the hub firmware, so the
/// envelope stays an open JSON object. Accessors cover the fields the
/// session engine relies on (`id`, `method`, `params`, `result`, `error`,
/// `msg_subclass`); everything else is reachable through [`Message::get`]
/// and [`Message::pointer`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    /// Creates a request without an id. The correlator attaches one
    /// right before the message is written.
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        let mut map = Map::new();
        map.insert("method".into(), Value::String(method.into()));
        map.insert("params".into(), params);
        Self(map)
    }

    /// Parses an inbound text frame. Anything but a JSON object is an error.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serializes the message for the wire.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns the `id` field. Numeric ids are not produced by this client
    /// and are treated as absent.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// Sets (or replaces) the `id` field.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert("id".into(), Value::String(id.into()));
    }

    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Value> {
        self.0.get("params")
    }

    pub fn msg_subclass(&self) -> Option<&str> {
        self.0.get("msg_subclass").and_then(Value::as_str)
    }

    /// Returns the `result` payload, if present and not null.
    pub fn result(&self) -> Option<&Value> {
        self.0.get("result").filter(|v| !v.is_null())
    }

    /// Returns the `error` payload, if present and not null.
    pub fn error(&self) -> Option<&Value> {
        self.0.get("error").filter(|v| !v.is_null())
    }

    /// Takes the `result` payload out of the message, `Null` if absent.
    pub fn into_result(mut self) -> Value {
        self.0.remove("result").unwrap_or(Value::Null)
    }

    /// True for unsolicited hub broadcasts (`id == "ui_broadcast"`).
    pub fn is_broadcast(&self) -> bool {
        self.id() == Some(UI_BROADCAST_ID)
    }

    /// Returns an arbitrary top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Looks up a nested value by JSON pointer, e.g. `/result/scene_id`.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        let (head, rest) = match pointer.strip_prefix('/') {
            Some(p) => p.split_once('/').map_or((p, ""), |(h, r)| (h, r)),
            None => return None,
        };
        let value = self.0.get(head)?;
        if rest.is_empty() {
            Some(value)
        } else {
            value.pointer(&format!("/{rest}"))
        }
    }

    /// Inserts an arbitrary top-level field.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Human-readable description of an `error` payload: its `message`
    /// (or `data.message`) when present, the raw JSON otherwise.
    pub fn error_message(&self) -> Option<String> {
        self.error().map(describe_error)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Message {
    type Error = Value;

    /// Succeeds only for JSON objects; returns the value back otherwise.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

/// Extracts a readable message from a hub error payload: the first
/// non-empty of `message` and `data.message`, the raw JSON otherwise.
pub fn describe_error(error: &Value) -> String {
    [error.get("message"), error.pointer("/data/message")]
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| error.to_string())
}
