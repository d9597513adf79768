//! Signaling wire types.
//!
//! The room server speaks JSON text frames. Inbound frames are envelopes
//! with a `type` discriminator and an opaque `data` payload; only
//! `webrtc.signal` envelopes carry negotiation data, tagged by an inner
//! `kind`. Outbound frames are `join` / `signal` messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound envelope types observed from the room server.
pub mod envelope {
    pub const HELLO: &str = "webrtc.hello";
    pub const JOINED: &str = "webrtc.joined";
    pub const PEER_JOINED: &str = "webrtc.peer_joined";
    pub const SIGNAL: &str = "webrtc.signal";
    pub const ERROR: &str = "webrtc.error";
}

/// Inner `kind` values inside a `webrtc.signal` payload.
pub mod kind {
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const CANDIDATE: &str = "candidate";
}

/// An inbound frame from the room server. Unknown types are skipped by the
/// dispatcher; `data` stays opaque until the `kind` probe.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalEnvelope {
    #[serde(default)]
    pub ok: bool,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub data: Value,
}

/// An outbound frame to the room server.
#[derive(Debug, Clone, Serialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub room: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl SignalMessage {
    pub fn join(room: &str) -> Self {
        Self {
            message_type: "join".to_string(),
            room: room.to_string(),
            data: Value::Null,
        }
    }

    pub fn signal(room: &str, data: Value) -> Self {
        Self {
            message_type: "signal".to_string(),
            room: room.to_string(),
            data,
        }
    }
}

/// Probe for the inner `kind` tag of a `webrtc.signal` payload.
#[derive(Debug, Deserialize)]
pub struct SignalKind {
    #[serde(default)]
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_with_unknown_fields() {
        let raw = r#"{"ok":true,"type":"webrtc.signal","room":"video","from":"peer-1","data":{"kind":"offer"},"extra":42}"#;
        let env: SignalEnvelope = serde_json::from_str(raw).unwrap();
        assert!(env.ok);
        assert_eq!(env.message_type, envelope::SIGNAL);
        assert_eq!(env.from, "peer-1");
        let probe: SignalKind = serde_json::from_value(env.data).unwrap();
        assert_eq!(probe.kind, kind::OFFER);
    }

    #[test]
    fn envelope_defaults_missing_fields() {
        let env: SignalEnvelope = serde_json::from_str(r#"{"type":"webrtc.hello"}"#).unwrap();
        assert!(!env.ok);
        assert!(env.from.is_empty());
        assert!(env.data.is_null());
    }

    #[test]
    fn join_message_omits_data() {
        let msg = SignalMessage::join("video");
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"join","room":"video"}"#
        );
    }

    #[test]
    fn signal_message_carries_payload() {
        let msg = SignalMessage::signal("video", serde_json::json!({"kind": "answer"}));
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"type":"signal","room":"video","data":{"kind":"answer"}}"#);
    }

    #[test]
    fn kind_probe_defaults_to_empty() {
        let kind: SignalKind = serde_json::from_str("{}").unwrap();
        assert!(kind.kind.is_empty());
    }
}
