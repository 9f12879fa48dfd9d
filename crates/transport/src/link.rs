use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use super::error::TransportResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Inbound traffic from a socket, reduced to what the protocol cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Closed,
    Error(String),
}

/// One outgoing text frame plus the channel that reports whether it was written.
#[derive(Debug)]
pub struct OutboundFrame {
    pub payload: String,
    pub written: oneshot::Sender<Result<(), String>>,
}

impl OutboundFrame {
    pub fn new(payload: String) -> (Self, oneshot::Receiver<Result<(), String>>) {
        let (written, written_rx) = oneshot::channel();
        (Self { payload, written }, written_rx)
    }
}

/// Live duplex link to one socket.
///
/// Dropping the outbound sender asks the socket pump to close the connection.
pub struct WireLink {
    pub inbound: mpsc::UnboundedReceiver<WireFrame>,
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
}

/// Opens sockets for endpoint URLs.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, TransportResult<WireLink>>;
}
