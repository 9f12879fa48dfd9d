use tokio::sync::mpsc;

use super::frame::HandshakeAck;
use super::state::CloseReason;
use super::target::ConnectionTarget;

/// Abstract connection events, decoupled from the wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventPayload {
    Handshake(HandshakeAck),
    Chunk(String),
    Complete,
    Error(String),
    Closed(CloseReason),
}

/// One event tagged with the socket that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEventMapped {
    pub target: ConnectionTarget,
    pub payload: TransportEventPayload,
}

/// Receiving half handed to the single event consumer.
pub struct TransportEventStream {
    events: mpsc::UnboundedReceiver<TransportEventMapped>,
}

impl TransportEventStream {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<TransportEventMapped>) -> Self {
        Self { events }
    }

    pub async fn recv(&mut self) -> Option<TransportEventMapped> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportEventMapped> {
        self.events.try_recv().ok()
    }
}

pub(crate) fn make_event_stream() -> (
    mpsc::UnboundedSender<TransportEventMapped>,
    TransportEventStream,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (event_tx, TransportEventStream::new(event_rx))
}
