use std::sync::Arc;

mod connection;
mod error;
mod event;
mod frame;
mod link;
mod memory;
mod state;
mod target;
mod tungstenite;

pub use connection::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_RETRY_INITIAL_DELAY, DEFAULT_RETRY_MAX_DELAY, SendAck,
    TransportConfig, TransportConnection,
};
pub use error::{TransportError, TransportResult};
pub use event::{TransportEventMapped, TransportEventPayload, TransportEventStream};
pub use frame::{
    COMPLETE_SENTINEL, HANDSHAKE_FIELD, HANDSHAKE_MESSAGE, HandshakeAck, ServerFrame,
    encode_client_frame, parse_server_frame,
};
pub use link::{BoxFuture, Connector, OutboundFrame, WireFrame, WireLink};
pub use memory::{HANDSHAKE_FRAME, MemoryAcceptor, MemoryConnector, MemorySession};
pub use state::{
    CloseReason, ConnectionState, ConnectionStatus, ConnectionTransition,
    ConnectionTransitionRejection, ConnectionTransitionResult,
};
pub use target::{ConnectionEpoch, ConnectionTarget, ConversationId, StringOrNumberVisitor};
pub use tungstenite::TungsteniteConnector;

/// Connection over real WebSockets.
pub fn create_connection(config: TransportConfig) -> (TransportConnection, TransportEventStream) {
    TransportConnection::new(Arc::new(TungsteniteConnector::new()), config)
}
