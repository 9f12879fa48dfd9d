use futures::{SinkExt, StreamExt};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::error::{TransportResult, WebSocketSnafu};
use super::link::{BoxFuture, Connector, OutboundFrame, WireFrame, WireLink};

/// Real WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }

    async fn open_link(url: &str) -> TransportResult<WireLink> {
        let (ws_stream, _) = connect_async(url).await.context(WebSocketSnafu {
            stage: "tungstenite-connect",
            url: url.to_string(),
        })?;
        tracing::debug!(url = %url, "websocket connected");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket_pump(
            url.to_string(),
            ws_stream,
            inbound_tx,
            outbound_rx,
        ));

        Ok(WireLink {
            inbound: inbound_rx,
            outbound: outbound_tx,
        })
    }
}

impl Connector for TungsteniteConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, TransportResult<WireLink>> {
        Box::pin(Self::open_link(url))
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Moves frames between the socket and the link until either side goes away.
async fn run_socket_pump(
    url: String,
    ws_stream: WsStream,
    inbound_tx: mpsc::UnboundedSender<WireFrame>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(frame) = outgoing else {
                    // Link dropped by its owner: close politely and stop.
                    let _ = ws_sink.close().await;
                    tracing::debug!(url = %url, "websocket closed by owner");
                    return;
                };

                match ws_sink.send(WsMessage::Text(frame.payload)).await {
                    Ok(()) => {
                        let _ = frame.written.send(Ok(()));
                    }
                    Err(error) => {
                        let message = error.to_string();
                        tracing::warn!(url = %url, error = %message, "websocket write failed");
                        let _ = frame.written.send(Err(message.clone()));
                        let _ = inbound_tx.send(WireFrame::Error(message));
                        return;
                    }
                }
            }
            incoming = ws_reader.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if inbound_tx.send(WireFrame::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_sink.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        let _ = inbound_tx.send(WireFrame::Closed);
                        return;
                    }
                    Some(Err(error)) => {
                        tracing::warn!(url = %url, error = %error, "websocket read failed");
                        let _ = inbound_tx.send(WireFrame::Error(error.to_string()));
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    use super::*;
    use crate::{
        COMPLETE_SENTINEL, CloseReason, ConnectionState, ConversationId, HANDSHAKE_FRAME, TransportConfig,
        TransportEventPayload, create_connection,
    };

    struct ServerLog {
        path: String,
        received: Vec<String>,
        pong: Option<Vec<u8>>,
        closed_by_client: bool,
    }

    async fn serve_one_turn(listener: TcpListener) -> ServerLog {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut path = String::new();
        let mut ws = accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            },
        )
        .await
        .expect("upgrade");

        for message in [
            WsMessage::Text(HANDSHAKE_FRAME.to_string()),
            WsMessage::Ping(vec![1, 2, 3]),
            WsMessage::Text("Hel".to_string()),
            WsMessage::Text("lo".to_string()),
            WsMessage::Text(COMPLETE_SENTINEL.to_string()),
        ] {
            ws.send(message).await.expect("server write");
        }

        let mut log = ServerLog {
            path,
            received: Vec::new(),
            pong: None,
            closed_by_client: false,
        };
        while let Some(message) = ws.next().await {
            match message {
                Ok(WsMessage::Text(text)) => log.received.push(text),
                Ok(WsMessage::Pong(data)) => log.pong = Some(data),
                Ok(WsMessage::Close(_)) => {
                    log.closed_by_client = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        log
    }

    #[tokio::test]
    async fn socket_pump_carries_a_full_turn_over_a_real_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(serve_one_turn(listener));

        let (mut connection, mut events) = create_connection(TransportConfig::new(format!("ws://{addr}")));
        let conversation_id = ConversationId::from("7");
        let target = connection.ensure_open(&conversation_id).await.expect("open");
        assert_eq!(connection.state(), ConnectionState::Open);

        let mut payloads = Vec::new();
        for _ in 0..4 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event before deadline")
                .expect("event stream open");
            assert_eq!(event.target, target);
            payloads.push(event.payload);
        }
        assert!(matches!(payloads[0], TransportEventPayload::Handshake(_)));
        assert_eq!(
            payloads[1..],
            [
                TransportEventPayload::Chunk("Hel".into()),
                TransportEventPayload::Chunk("lo".into()),
                TransportEventPayload::Complete,
            ]
        );

        let ack = connection.send("hello").await.expect("send");
        assert_eq!(ack.target, target);

        // Releasing the socket closes the server side.
        connection.close();
        let log = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server done before deadline")
            .expect("server task");

        assert_eq!(log.path, "/ws/chats/7/");
        assert_eq!(log.received, vec![r#"{"text":"hello"}"#.to_string()]);
        assert_eq!(log.pong, Some(vec![1, 2, 3]));
        assert!(log.closed_by_client);
    }

    #[tokio::test]
    async fn server_close_is_reported_as_remote_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            ws.send(WsMessage::Text(HANDSHAKE_FRAME.to_string()))
                .await
                .expect("server write");
            // Close only after the client has seen the handshake and written a turn.
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() {
                    break;
                }
            }
            let _ = ws.close(None).await;
        });

        let (mut connection, mut events) = create_connection(TransportConfig::new(format!("ws://{addr}")));
        let target = connection
            .ensure_open(&ConversationId::from("7"))
            .await
            .expect("open");
        connection.send("bye").await.expect("send");

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let TransportEventPayload::Closed(reason) = event.payload {
                    return Some((event.target, reason));
                }
            }
            None
        })
        .await
        .expect("close before deadline");
        assert_eq!(closed, Some((target, CloseReason::RemoteClosed)));
        assert_eq!(connection.state(), ConnectionState::Closed(CloseReason::RemoteClosed));
    }
}
