//! Wire messages exchanged between the harness and the hosted build.

use serde::{Deserialize, Serialize};

/// Message kinds of the harness protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Harness → build handshake.
    Init,
    /// Build → harness: ready to play.
    Ready,
    /// Build → harness: progress snapshot.
    State,
    /// Build → harness: final or intermediate result.
    Result,
    /// Build → harness: the build reported an error.
    Error,
    /// A line that could not be decoded as a message.
    Invalid,
    /// Any well-formed message with a type we do not interpret.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Init => "INIT",
            MessageType::Ready => "READY",
            MessageType::State => "STATE",
            MessageType::Result => "RESULT",
            MessageType::Error => "ERROR",
            MessageType::Invalid => "INVALID",
            MessageType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "INIT" => MessageType::Init,
            "READY" => MessageType::Ready,
            "STATE" => MessageType::State,
            "RESULT" => MessageType::Result,
            "ERROR" => MessageType::Error,
            "INVALID" => MessageType::Invalid,
            _ => MessageType::Unknown,
        })
    }
}

/// A single protocol message as it crosses the frame boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl FrameMessage {
    pub fn new(kind: MessageType, payload: Option<serde_json::Value>) -> Self {
        Self { kind, payload }
    }
}

/// Which side of the frame a logged message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Harness → build.
    Outbound,
    /// Build → harness.
    Inbound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let msg = FrameMessage::new(MessageType::Init, Some(serde_json::json!({"lang": "vi"})));
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"INIT","payload":{"lang":"vi"}}"#);
    }

    #[test]
    fn test_unrecognised_type_decodes_as_unknown() {
        let msg: FrameMessage = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
        assert!(msg.payload.is_none());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("ready".parse::<MessageType>().unwrap(), MessageType::Ready);
        assert_eq!("nope".parse::<MessageType>().unwrap(), MessageType::Unknown);
    }
}
