use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::error::{ConnectSnafu, TransportResult};
use super::frame::COMPLETE_SENTINEL;
use super::link::{BoxFuture, Connector, OutboundFrame, WireFrame, WireLink};

pub const HANDSHAKE_FRAME: &str = r#"{"message":"Connected"}"#;

/// In-process connector whose server side is driven through [`MemorySession`]s.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<MemoryShared>,
}

struct MemoryShared {
    auto_handshake: AtomicBool,
    refusal: Mutex<Option<String>>,
    connect_attempts: AtomicUsize,
    accepted_tx: mpsc::UnboundedSender<MemorySession>,
}

/// Yields the server side of every accepted connection, in connect order.
pub struct MemoryAcceptor {
    sessions: mpsc::UnboundedReceiver<MemorySession>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(MemoryShared {
                auto_handshake: AtomicBool::new(false),
                refusal: Mutex::new(None),
                connect_attempts: AtomicUsize::new(0),
                accepted_tx,
            }),
        };
        (
            connector,
            MemoryAcceptor {
                sessions: accepted_rx,
            },
        )
    }

    /// Queues the handshake frame on every new session before the caller sees it.
    pub fn with_auto_handshake(self, enabled: bool) -> Self {
        self.set_auto_handshake(enabled);
        self
    }

    /// Applies to sessions accepted from now on, across every clone.
    pub fn set_auto_handshake(&self, enabled: bool) {
        self.shared.auto_handshake.store(enabled, Ordering::SeqCst);
    }

    /// Makes subsequent connects fail with `message`; `None` accepts again.
    pub fn refuse_connections(&self, message: Option<&str>) {
        *self
            .shared
            .refusal
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message.map(str::to_string);
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    fn open_link(&self, url: &str) -> TransportResult<WireLink> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refusal = self
            .shared
            .refusal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(message) = refusal {
            return ConnectSnafu {
                stage: "memory-connect-refused",
                url: url.to_string(),
                message,
            }
            .fail();
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_memory_pump(outbound_rx, sent_tx));

        if self.shared.auto_handshake.load(Ordering::SeqCst) {
            let _ = inbound_tx.send(WireFrame::Text(HANDSHAKE_FRAME.to_string()));
        }

        let session = MemorySession {
            url: url.to_string(),
            inbound: inbound_tx,
            sent: sent_rx,
        };
        if self.shared.accepted_tx.send(session).is_err() {
            tracing::debug!(url = %url, "memory acceptor dropped; session closes immediately");
        }

        Ok(WireLink {
            inbound: inbound_rx,
            outbound: outbound_tx,
        })
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, TransportResult<WireLink>> {
        Box::pin(async move { self.open_link(url) })
    }
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<MemorySession> {
        self.sessions.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemorySession> {
        self.sessions.try_recv().ok()
    }
}

/// Server side of one in-memory socket. Dropping it closes the socket.
pub struct MemorySession {
    url: String,
    inbound: mpsc::UnboundedSender<WireFrame>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl MemorySession {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn handshake(&self) -> bool {
        self.send_text(HANDSHAKE_FRAME)
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.inbound.send(WireFrame::Text(text.to_string())).is_ok()
    }

    pub fn complete(&self) -> bool {
        self.send_text(COMPLETE_SENTINEL)
    }

    pub fn close(&self) -> bool {
        self.inbound.send(WireFrame::Closed).is_ok()
    }

    pub fn fail(&self, message: &str) -> bool {
        self.inbound.send(WireFrame::Error(message.to_string())).is_ok()
    }

    /// Next frame the client wrote, as raw JSON text.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<String> {
        self.sent.try_recv().ok()
    }
}

async fn run_memory_pump(
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    sent_tx: mpsc::UnboundedSender<String>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let written = sent_tx
            .send(frame.payload)
            .map_err(|_| "memory peer is gone".to_string());
        let _ = frame.written.send(written);
    }
}
