use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::error::{
    HandshakeTimeoutSnafu, NotConnectedSnafu, SupersededSnafu, TransportError, TransportResult,
};
use super::event::{TransportEventMapped, TransportEventPayload, TransportEventStream, make_event_stream};
use super::frame::{ServerFrame, encode_client_frame, parse_server_frame};
use super::link::{Connector, OutboundFrame, WireFrame, WireLink};
use super::state::{CloseReason, ConnectionState, ConnectionStatus, ConnectionTransition};
use super::target::{ConnectionEpoch, ConnectionTarget, ConversationId};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub ws_base_url: String,
    pub handshake_timeout: Duration,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
}

impl TransportConfig {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into().trim().to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_delay = initial;
        self.retry_max_delay = max.max(initial);
        self
    }

    pub fn endpoint_for(&self, conversation_id: &ConversationId) -> String {
        format!(
            "{}/ws/chats/{}/",
            self.ws_base_url.trim_end_matches('/'),
            conversation_id
        )
    }
}

/// Proof that a frame reached the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    pub target: ConnectionTarget,
    pub bytes: usize,
}

enum WorkerCommand {
    Send(OutboundFrame),
}

struct Binding {
    target: ConnectionTarget,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// Owns at most one socket, bound to one conversation at a time.
///
/// Events from every socket flow into the [`TransportEventStream`] returned by
/// [`TransportConnection::new`], tagged with the socket's [`ConnectionTarget`].
pub struct TransportConnection {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    status: Arc<watch::Sender<ConnectionStatus>>,
    event_tx: mpsc::UnboundedSender<TransportEventMapped>,
    binding: Option<Binding>,
    next_epoch: u64,
}

impl TransportConnection {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: TransportConfig,
    ) -> (Self, TransportEventStream) {
        let (event_tx, events) = make_event_stream();
        let (status, _) = watch::channel(ConnectionStatus::default());
        (
            Self {
                connector,
                config,
                status: Arc::new(status),
                event_tx,
                binding: None,
                next_epoch: 0,
            },
            events,
        )
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn current_target(&self) -> Option<&ConnectionTarget> {
        self.binding.as_ref().map(|binding| &binding.target)
    }

    /// Binds to `conversation_id` and starts connecting.
    ///
    /// No-op while a socket for the same conversation is connecting or open; any
    /// other binding is torn down first.
    pub fn open(&mut self, conversation_id: &ConversationId) -> ConnectionTarget {
        if let Some(binding) = &self.binding
            && binding.target.conversation_id == *conversation_id
        {
            let status = self.status.borrow();
            if status.is_current(&binding.target) && status.state.is_active() {
                return binding.target.clone();
            }
        }

        self.close();

        self.next_epoch = self.next_epoch.saturating_add(1);
        let target = ConnectionTarget::new(conversation_id.clone(), ConnectionEpoch(self.next_epoch));
        self.status.send_modify(|status| {
            status.target = Some(target.clone());
            status.state = match status.state.apply(ConnectionTransition::Connect) {
                Ok(next) => next,
                Err(rejection) => {
                    tracing::warn!(?rejection, epoch = target.epoch.0, "forcing connect on a new socket");
                    ConnectionState::Connecting
                }
            };
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let url = self.config.endpoint_for(conversation_id);
        tracing::debug!(
            conversation_id = %conversation_id,
            epoch = target.epoch.0,
            url = %url,
            "opening conversation socket"
        );

        tokio::spawn(run_connection_worker(
            WorkerContext {
                connector: self.connector.clone(),
                url,
                target: target.clone(),
                status: self.status.clone(),
                event_tx: self.event_tx.clone(),
            },
            command_rx,
            cancel_rx,
        ));

        self.binding = Some(Binding {
            target: target.clone(),
            commands: command_tx,
            cancel_tx: Some(cancel_tx),
        });
        target
    }

    /// Opens if needed and waits for the handshake, retrying failed sockets with
    /// exponential backoff until the handshake deadline passes.
    pub async fn ensure_open(
        &mut self,
        conversation_id: &ConversationId,
    ) -> TransportResult<ConnectionTarget> {
        let started = Instant::now();
        let deadline = started + self.config.handshake_timeout;
        let mut delay = self.config.retry_initial_delay;
        let mut last_close: Option<CloseReason> = None;

        loop {
            let target = self.open(conversation_id);
            let mut status_rx = self.status.subscribe();
            // The watch guard must not outlive this statement; the worker writes through it.
            let settled = match tokio::time::timeout_at(
                deadline,
                status_rx.wait_for(|status| {
                    !status.is_current(&target) || !matches!(status.state, ConnectionState::Connecting)
                }),
            )
            .await
            {
                Ok(Ok(status)) => status.clone(),
                Ok(Err(_)) | Err(_) => {
                    // Drop the unacknowledged socket so the next attempt starts a fresh epoch.
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        epoch = target.epoch.0,
                        "no handshake before the deadline, dropping the socket"
                    );
                    self.close();
                    return Err(handshake_timeout(conversation_id, started, last_close.as_ref()));
                }
            };

            if !settled.is_current(&target) {
                return SupersededSnafu {
                    stage: "ensure-open-wait",
                    conversation_id: conversation_id.clone(),
                }
                .fail();
            }

            match settled.state {
                ConnectionState::Open => return Ok(target),
                ConnectionState::Closed(reason) => {
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        reason = %reason.describe(),
                        retry_in_ms = delay.as_millis() as u64,
                        "socket closed before handshake"
                    );
                    last_close = Some(reason);
                    if Instant::now() + delay >= deadline {
                        return Err(handshake_timeout(
                            conversation_id,
                            started,
                            last_close.as_ref(),
                        ));
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.retry_max_delay);
                }
                ConnectionState::Idle | ConnectionState::Connecting | ConnectionState::Closing => {
                    return SupersededSnafu {
                        stage: "ensure-open-settled",
                        conversation_id: conversation_id.clone(),
                    }
                    .fail();
                }
            }
        }
    }

    /// Writes one user turn. Never queues: fails with `NotConnected` unless `Open`.
    pub async fn send(&self, text: &str) -> TransportResult<SendAck> {
        let Some(binding) = &self.binding else {
            return NotConnectedSnafu {
                stage: "send-unbound",
                conversation_id: None::<ConversationId>,
            }
            .fail();
        };

        let not_connected = || TransportError::NotConnected {
            stage: "send-not-open",
            conversation_id: Some(binding.target.conversation_id.clone()),
        };

        {
            let status = self.status.borrow();
            if !status.is_current(&binding.target) || !status.state.is_open() {
                return Err(not_connected());
            }
        }

        let payload = encode_client_frame(text)?;
        let bytes = payload.len();
        let (frame, written_rx) = OutboundFrame::new(payload);
        binding
            .commands
            .send(WorkerCommand::Send(frame))
            .map_err(|_| not_connected())?;

        match written_rx.await {
            Ok(Ok(())) => Ok(SendAck {
                target: binding.target.clone(),
                bytes,
            }),
            Ok(Err(message)) => Err(TransportError::SocketWrite {
                stage: "send-socket-write",
                message,
            }),
            Err(_) => Err(not_connected()),
        }
    }

    /// Releases the socket. Safe from any state, including never opened.
    pub fn close(&mut self) {
        let Some(mut binding) = self.binding.take() else {
            self.status.send_if_modified(|status| {
                if status.state.is_closed() {
                    return false;
                }
                status.state = ConnectionState::Closed(CloseReason::Requested);
                true
            });
            return;
        };

        transition_if_current(&self.status, &binding.target, ConnectionTransition::BeginClose);
        if let Some(cancel_tx) = binding.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        transition_if_current(
            &self.status,
            &binding.target,
            ConnectionTransition::Finish(CloseReason::Requested),
        );

        tracing::debug!(
            conversation_id = %binding.target.conversation_id,
            epoch = binding.target.epoch.0,
            "conversation socket closed"
        );
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn handshake_timeout(
    conversation_id: &ConversationId,
    started: Instant,
    last_close: Option<&CloseReason>,
) -> TransportError {
    HandshakeTimeoutSnafu {
        stage: "ensure-open-deadline",
        conversation_id: conversation_id.clone(),
        waited_ms: started.elapsed().as_millis(),
        last_close: last_close
            .map(CloseReason::describe)
            .unwrap_or_else(|| "none".to_string()),
    }
    .build()
}

/// Applies `transition` only while `target` still owns the published status.
fn transition_if_current(
    status: &watch::Sender<ConnectionStatus>,
    target: &ConnectionTarget,
    transition: ConnectionTransition,
) -> bool {
    status.send_if_modified(|current| {
        if !current.is_current(target) {
            return false;
        }

        match current.state.apply(transition) {
            Ok(next) => {
                let changed = next != current.state;
                current.state = next;
                changed
            }
            Err(rejection) => {
                tracing::debug!(?rejection, epoch = target.epoch.0, "ignored connection transition");
                false
            }
        }
    })
}

struct WorkerContext {
    connector: Arc<dyn Connector>,
    url: String,
    target: ConnectionTarget,
    status: Arc<watch::Sender<ConnectionStatus>>,
    event_tx: mpsc::UnboundedSender<TransportEventMapped>,
}

impl WorkerContext {
    fn emit(&self, payload: TransportEventPayload) {
        let _ = self.event_tx.send(TransportEventMapped {
            target: self.target.clone(),
            payload,
        });
    }

    fn finish(&self, reason: CloseReason) {
        if transition_if_current(
            &self.status,
            &self.target,
            ConnectionTransition::Finish(reason.clone()),
        ) {
            self.emit(TransportEventPayload::Closed(reason));
        }
    }

    fn handle_text(&self, text: String) {
        match parse_server_frame(&text) {
            ServerFrame::Handshake(ack) => {
                if transition_if_current(
                    &self.status,
                    &self.target,
                    ConnectionTransition::HandshakeReceived,
                ) {
                    tracing::info!(
                        conversation_id = %self.target.conversation_id,
                        epoch = self.target.epoch.0,
                        "conversation socket ready"
                    );
                    self.emit(TransportEventPayload::Handshake(ack));
                } else {
                    tracing::warn!(
                        conversation_id = %self.target.conversation_id,
                        "ignoring repeated handshake frame"
                    );
                }
            }
            ServerFrame::Complete => self.emit(TransportEventPayload::Complete),
            ServerFrame::Chunk(chunk) => self.emit(TransportEventPayload::Chunk(chunk)),
        }
    }

    fn forward_outbound(&self, link: &WireLink, frame: OutboundFrame) {
        if !self.status.borrow().state.is_open() {
            // Dropping the frame resolves the sender's ack as not connected.
            return;
        }

        if let Err(rejected) = link.outbound.send(frame) {
            let _ = rejected.0.written.send(Err("socket pump stopped".to_string()));
        }
    }
}

async fn run_connection_worker(
    context: WorkerContext,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let connected = tokio::select! {
        _ = &mut cancel_rx => {
            tracing::debug!(epoch = context.target.epoch.0, "socket cancelled before connect");
            return;
        }
        result = context.connector.connect(&context.url) => result,
    };

    let mut link = match connected {
        Ok(link) => link,
        Err(error) => {
            let message = error.to_string();
            tracing::warn!(
                conversation_id = %context.target.conversation_id,
                url = %context.url,
                error = %message,
                "failed to open conversation socket"
            );
            context.emit(TransportEventPayload::Error(message.clone()));
            context.finish(CloseReason::ConnectFailed(message));
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                // Dropping the link closes the socket; close() already published the state.
                tracing::debug!(epoch = context.target.epoch.0, "socket worker cancelled");
                return;
            }
            frame = link.inbound.recv() => match frame {
                Some(WireFrame::Text(text)) => context.handle_text(text),
                Some(WireFrame::Closed) | None => {
                    context.finish(CloseReason::RemoteClosed);
                    return;
                }
                Some(WireFrame::Error(message)) => {
                    context.emit(TransportEventPayload::Error(message.clone()));
                    context.finish(CloseReason::SocketError(message));
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(WorkerCommand::Send(frame)) => context.forward_outbound(&link, frame),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAcceptor, MemoryConnector};

    fn connection(auto_handshake: bool) -> (
        TransportConnection,
        TransportEventStream,
        MemoryConnector,
        MemoryAcceptor,
    ) {
        let (connector, acceptor) = MemoryConnector::new();
        let connector = connector.with_auto_handshake(auto_handshake);
        let (connection, events) = TransportConnection::new(
            Arc::new(connector.clone()),
            TransportConfig::new("wss://chat.example/"),
        );
        (connection, events, connector, acceptor)
    }

    #[test]
    fn endpoint_embeds_conversation_id() {
        let config = TransportConfig::new("wss://chat.example/");
        assert_eq!(
            config.endpoint_for(&ConversationId::from(12_u64)),
            "wss://chat.example/ws/chats/12/"
        );
    }

    #[tokio::test]
    async fn handshake_opens_and_payload_frames_become_events() {
        let (mut connection, mut events, _connector, mut acceptor) = connection(false);
        let conversation_id = ConversationId::from("7");
        let target = connection.open(&conversation_id);
        assert_eq!(connection.state(), ConnectionState::Connecting);

        let session = acceptor.accept().await.expect("session");
        assert_eq!(session.url(), "wss://chat.example/ws/chats/7/");
        session.handshake();
        session.send_text("Hel");
        session.send_text("lo");
        session.complete();

        let handshake = events.recv().await.expect("handshake event");
        assert_eq!(handshake.target, target);
        assert!(matches!(handshake.payload, TransportEventPayload::Handshake(_)));
        assert_eq!(connection.state(), ConnectionState::Open);

        let mut payloads = Vec::new();
        for _ in 0..3 {
            payloads.push(events.recv().await.expect("event").payload);
        }
        assert_eq!(
            payloads,
            vec![
                TransportEventPayload::Chunk("Hel".into()),
                TransportEventPayload::Chunk("lo".into()),
                TransportEventPayload::Complete,
            ]
        );
        // Turn completion leaves the socket usable.
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn open_is_idempotent_for_the_bound_conversation() {
        let (mut connection, _events, connector, _acceptor) = connection(true);
        let conversation_id = ConversationId::from("7");
        let first = connection.ensure_open(&conversation_id).await.expect("open");
        let second = connection.open(&conversation_id);
        let third = connection.ensure_open(&conversation_id).await.expect("still open");

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn rebinding_tears_down_the_previous_socket() {
        let (mut connection, mut events, _connector, mut acceptor) = connection(true);
        let first = connection
            .ensure_open(&ConversationId::from("a"))
            .await
            .expect("open a");
        let mut first_session = acceptor.accept().await.expect("session a");

        let second = connection
            .ensure_open(&ConversationId::from("b"))
            .await
            .expect("open b");
        assert_ne!(first.epoch, second.epoch);

        // The old socket's pump stops once its link is dropped.
        assert_eq!(first_session.next_sent().await, None);
        assert!(!first_session.send_text("late chunk for a"));

        let mut seen = Vec::new();
        while let Some(event) = events.try_recv() {
            seen.push(event.target);
        }
        assert!(seen.iter().all(|target| *target == first || *target == second));
        assert_eq!(connection.current_target(), Some(&second));
    }

    #[tokio::test]
    async fn send_requires_an_open_socket() {
        let (mut connection, _events, _connector, mut acceptor) = connection(false);
        let error = connection.send("hello").await.unwrap_err();
        assert!(matches!(
            error,
            TransportError::NotConnected { conversation_id: None, .. }
        ));

        let conversation_id = ConversationId::from("7");
        connection.open(&conversation_id);
        let mut session = acceptor.accept().await.expect("session");
        let error = connection.send("too early").await.unwrap_err();
        assert!(matches!(
            &error,
            TransportError::NotConnected { conversation_id: Some(id), .. } if *id == conversation_id
        ));
        assert_eq!(error.to_string(), "connection for conversation 7 is not open");

        session.handshake();
        let target = connection.ensure_open(&conversation_id).await.expect("open");
        let ack = connection.send("hello").await.expect("send");
        assert_eq!(ack.target, target);
        assert_eq!(session.next_sent().await.as_deref(), Some(r#"{"text":"hello"}"#));
        assert_eq!(session.try_next_sent(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_open_fails_closed_without_handshake() {
        let (mut connection, _events, _connector, _acceptor) = connection(false);
        let conversation_id = ConversationId::from("7");

        let error = connection.ensure_open(&conversation_id).await.unwrap_err();
        let TransportError::HandshakeTimeout { waited_ms, .. } = error else {
            panic!("expected handshake timeout, got {error:?}");
        };
        assert!(waited_ms >= DEFAULT_HANDSHAKE_TIMEOUT.as_millis());
        assert_eq!(connection.state(), ConnectionState::Closed(CloseReason::Requested));
    }

    #[tokio::test(start_paused = true)]
    async fn next_ensure_open_after_a_timeout_uses_a_fresh_socket() {
        let (mut connection, _events, connector, mut acceptor) = connection(false);
        let conversation_id = ConversationId::from("7");

        connection.ensure_open(&conversation_id).await.unwrap_err();
        let mut stale = acceptor.try_accept().expect("first socket");
        let timed_out = connection.status().target.expect("target kept");

        connector.set_auto_handshake(true);
        let target = connection.ensure_open(&conversation_id).await.expect("open");
        assert!(target.epoch > timed_out.epoch);
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(stale.next_sent().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connects_are_retried_with_backoff_until_the_deadline() {
        let (mut connection, _events, connector, _acceptor) = connection(true);
        connector.refuse_connections(Some("connection refused"));

        let error = connection
            .ensure_open(&ConversationId::from("7"))
            .await
            .unwrap_err();
        let TransportError::HandshakeTimeout { last_close, .. } = error else {
            panic!("expected handshake timeout, got {error:?}");
        };
        assert!(last_close.contains("connection refused"));
        // 100 + 200 + 400 + 800 + 1000 + 1000 ms of backoff fit inside five seconds.
        assert!(connector.connect_attempts() >= 5);
    }

    #[tokio::test]
    async fn remote_close_is_reported_once() {
        let (mut connection, mut events, _connector, mut acceptor) = connection(true);
        let target = connection
            .ensure_open(&ConversationId::from("7"))
            .await
            .expect("open");
        let session = acceptor.accept().await.expect("session");
        session.close();

        let mut closed = None;
        while let Some(event) = events.recv().await {
            if let TransportEventPayload::Closed(reason) = event.payload {
                closed = Some((event.target, reason));
                break;
            }
        }
        assert_eq!(closed, Some((target, CloseReason::RemoteClosed)));
        assert_eq!(connection.state(), ConnectionState::Closed(CloseReason::RemoteClosed));
    }

    #[tokio::test]
    async fn close_is_safe_before_open_and_repeatable() {
        let (mut connection, _events, _connector, _acceptor) = connection(true);
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed(CloseReason::Requested));
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed(CloseReason::Requested));

        connection
            .ensure_open(&ConversationId::from("7"))
            .await
            .expect("reopen after close");
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed(CloseReason::Requested));
    }
}
