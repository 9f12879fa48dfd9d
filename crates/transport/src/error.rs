use snafu::Snafu;

use super::target::ConversationId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display(
        "connection {} is not open",
        conversation_id
            .as_ref()
            .map_or_else(|| "without a bound conversation".to_string(), |id| format!("for conversation {id}"))
    ))]
    NotConnected {
        stage: &'static str,
        conversation_id: Option<ConversationId>,
    },
    #[snafu(display(
        "no handshake from conversation {conversation_id} within {waited_ms}ms (last close: {last_close})"
    ))]
    HandshakeTimeout {
        stage: &'static str,
        conversation_id: ConversationId,
        waited_ms: u128,
        last_close: String,
    },
    #[snafu(display("connection to conversation {conversation_id} was replaced while waiting"))]
    Superseded {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("failed to connect to {url}: {message}"))]
    Connect {
        stage: &'static str,
        url: String,
        message: String,
    },
    #[snafu(display("websocket handshake with {url} failed"))]
    WebSocket {
        stage: &'static str,
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("socket write failed: {message}"))]
    SocketWrite {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("failed to encode client frame"))]
    EncodeFrame {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;
