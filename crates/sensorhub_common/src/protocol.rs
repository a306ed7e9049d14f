//! WebSocket client protocol
//!
//! Every frame is a JSON envelope `{type, topic?, data?}`. Clients send
//! `subscribe`, `unsubscribe` and `ping`; the hub answers with acks, `pong`,
//! `error`, and pushes `data` frames for subscribed topics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Global topic carrying every device update
pub const NODE_UPDATES_TOPIC: &str = "node_updates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
    Ping,
    Pong,
    Connected,
    Subscribed,
    Unsubscribed,
    Data,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            topic: None,
            data: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn data(topic: impl Into<String>, data: Value) -> Self {
        Self::new(MessageKind::Data).with_topic(topic).with_data(data)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(MessageKind::Error).with_data(serde_json::json!({ "reason": reason.into() }))
    }

    pub fn to_json(&self) -> String {
        // Envelope holds only strings and JSON values, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
