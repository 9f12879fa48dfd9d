//! Text-frame protocol spoken over a conversation socket.
//!
//! Server frames are disambiguated purely by content: a JSON object whose `message`
//! field is `"Connected"` acknowledges the connection, the literal `[COMPLETE]` ends
//! the current assistant turn, and anything else is a verbatim chunk of reply text.

use serde::Serialize;
use serde_json::{Map, Value};
use snafu::ResultExt;

use super::error::{EncodeFrameSnafu, TransportResult};

pub const HANDSHAKE_FIELD: &str = "message";
pub const HANDSHAKE_MESSAGE: &str = "Connected";
pub const COMPLETE_SENTINEL: &str = "[COMPLETE]";

/// Body of the handshake acknowledgement, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeAck {
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Handshake(HandshakeAck),
    Complete,
    Chunk(String),
}

#[derive(Debug, Serialize)]
struct ClientFrame<'a> {
    text: &'a str,
}

pub fn parse_server_frame(text: &str) -> ServerFrame {
    if let Some(ack) = parse_handshake(text) {
        return ServerFrame::Handshake(ack);
    }

    if text == COMPLETE_SENTINEL {
        return ServerFrame::Complete;
    }

    ServerFrame::Chunk(text.to_string())
}

pub fn encode_client_frame(text: &str) -> TransportResult<String> {
    serde_json::to_string(&ClientFrame { text }).context(EncodeFrameSnafu {
        stage: "encode-client-frame",
    })
}

fn parse_handshake(text: &str) -> Option<HandshakeAck> {
    // Only object-shaped frames can carry the handshake.
    if !text.starts_with('{') {
        return None;
    }

    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(text) else {
        return None;
    };

    let is_handshake = fields.get(HANDSHAKE_FIELD).and_then(Value::as_str) == Some(HANDSHAKE_MESSAGE);
    is_handshake.then_some(HandshakeAck { fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_requires_connected_discriminator() {
        let frame = parse_server_frame(r#"{"message": "Connected", "chat_id": 7}"#);
        let ServerFrame::Handshake(ack) = frame else {
            panic!("expected handshake, got {frame:?}");
        };
        assert_eq!(ack.fields.get("chat_id"), Some(&Value::from(7)));

        assert_eq!(
            parse_server_frame(r#"{"message": "Disconnected"}"#),
            ServerFrame::Chunk(r#"{"message": "Disconnected"}"#.to_string())
        );
        assert_eq!(
            parse_server_frame(r#"{"message": "Connected""#),
            ServerFrame::Chunk(r#"{"message": "Connected""#.to_string())
        );
        assert_eq!(
            parse_server_frame(r#" {"message": "Connected"}"#),
            ServerFrame::Chunk(r#" {"message": "Connected"}"#.to_string())
        );
    }

    #[test]
    fn completion_sentinel_must_match_exactly() {
        assert_eq!(parse_server_frame("[COMPLETE]"), ServerFrame::Complete);
        assert_eq!(
            parse_server_frame("[COMPLETE]\n"),
            ServerFrame::Chunk("[COMPLETE]\n".to_string())
        );
    }

    #[test]
    fn chunks_are_passed_through_verbatim() {
        for raw in ["", " ", "Hel", "lo\n\n", "{not json", "[1, 2]"] {
            assert_eq!(parse_server_frame(raw), ServerFrame::Chunk(raw.to_string()));
        }
    }

    #[test]
    fn client_frames_carry_only_text() {
        let encoded = encode_client_frame("say \"hi\"").expect("encode");
        assert_eq!(encoded, r#"{"text":"say \"hi\""}"#);
    }
}
