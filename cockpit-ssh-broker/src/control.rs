//! Control-message shapes exchanged on the upstream transport and with each
//! relay subprocess's own stdio (§4.A, §4.H, §6.1).
//!
//! Kept as a JSON object rather than a closed enum: unknown commands and
//! opaque `authorize` challenge/response fields must be forwarded verbatim
//! (§4.H "Authorize"), so only the fields the broker's own logic needs are
//! pulled out; everything else rides along untouched.

use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ControlMessage(pub Map<String, Value>);

impl ControlMessage {
    pub fn new(command: &str) -> Self {
        let mut map = Map::new();
        map.insert("command".to_owned(), Value::String(command.to_owned()));
        Self(map)
    }

    pub fn parse(payload: &[u8]) -> serde_json::Result<Self> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(map) => Ok(Self(map)),
            other => Ok(Self(
                [("command".to_owned(), other)].into_iter().collect(),
            )),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&Value::Object(self.0.clone())).unwrap_or_default()
    }

    pub fn command(&self) -> Option<&str> {
        self.0.get("command").and_then(Value::as_str)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn channel(&self) -> Option<&str> {
        self.str_field("channel")
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }
}

/// The broker's own greeting, sent down a freshly spawned relay's stdin
/// (§4.H "Init handshake").
pub fn init_message(version: u64) -> ControlMessage {
    ControlMessage::new("init").with("version", version)
}
