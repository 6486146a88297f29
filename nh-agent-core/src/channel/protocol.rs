use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChannelError, ChannelResult};

/// A Phoenix-channel style envelope: every frame on the wire carries these
/// five fields regardless of which topic or event it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub join_ref: Option<String>,
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Message {
    pub fn from_json(text: &str) -> ChannelResult<Self> {
        serde_json::from_str(text).map_err(|e| ChannelError::MessageParsing(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Message always serializes")
    }

    pub fn is_reply(&self) -> bool {
        self.event == "phx_reply"
    }

    pub fn reply_ok(&self) -> bool {
        self.payload
            .get("status")
            .and_then(Value::as_str)
            .map(|status| status == "ok")
            .unwrap_or(false)
    }

    pub fn reply_status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    pub fn reply_reason(&self) -> Option<&str> {
        self.payload
            .get("response")
            .and_then(|r| r.get("reason"))
            .and_then(Value::as_str)
    }
}

/// Builds outbound messages for one topic, keeping the monotonically
/// increasing per-message ref and the topic's join ref.
pub struct ChannelBuilder {
    pub topic: String,
    pub join_ref: String,
    next_ref: std::sync::atomic::AtomicU64,
}

impl ChannelBuilder {
    pub fn new(topic: String, join_ref: String) -> Self {
        Self {
            topic,
            join_ref,
            next_ref: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn next_msg_ref(&self) -> String {
        self.next_ref
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .to_string()
    }

    pub fn join(&self, payload: Value) -> Message {
        Message {
            join_ref: Some(self.join_ref.clone()),
            msg_ref: Some(self.join_ref.clone()),
            topic: self.topic.clone(),
            event: "phx_join".to_string(),
            payload,
        }
    }

    pub fn push(&self, event: &str, payload: Value) -> Message {
        Message {
            join_ref: Some(self.join_ref.clone()),
            msg_ref: Some(self.next_msg_ref()),
            topic: self.topic.clone(),
            event: event.to_string(),
            payload,
        }
    }

    pub fn heartbeat(&self) -> Message {
        Message {
            join_ref: None,
            msg_ref: Some(self.next_msg_ref()),
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: serde_json::json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_message_round_trips() {
        let builder = ChannelBuilder::new("device:abc".into(), "1".into());
        let join = builder.join(json!({"hello": "world"}));
        let text = join.to_json();
        let parsed = Message::from_json(&text).unwrap();
        assert_eq!(parsed.topic, "device:abc");
        assert_eq!(parsed.event, "phx_join");
    }

    #[test]
    fn reply_ok_detects_status() {
        let msg = Message {
            join_ref: Some("1".into()),
            msg_ref: Some("1".into()),
            topic: "device:abc".into(),
            event: "phx_reply".into(),
            payload: json!({"status": "ok", "response": {}}),
        };
        assert!(msg.is_reply());
        assert!(msg.reply_ok());
    }

    #[test]
    fn reply_error_carries_reason() {
        let msg = Message {
            join_ref: Some("1".into()),
            msg_ref: Some("1".into()),
            topic: "device:abc".into(),
            event: "phx_reply".into(),
            payload: json!({"status": "error", "response": {"reason": "unauthenticated"}}),
        };
        assert!(!msg.reply_ok());
        assert_eq!(msg.reply_reason(), Some("unauthenticated"));
    }

    #[test]
    fn pushes_use_increasing_refs() {
        let builder = ChannelBuilder::new("device:abc".into(), "1".into());
        let a = builder.push("fwup_progress", json!({}));
        let b = builder.push("fwup_progress", json!({}));
        assert_ne!(a.msg_ref, b.msg_ref);
    }
}
