use std::sync::Arc;

use chatsync_storage::KeyValueStore;
use chatsync_transport::{
    CloseReason, ConnectionState, Connector, ConversationId, TransportConfig, TransportConnection,
    TransportError, TransportEventMapped, TransportEventPayload, TransportEventStream,
};
use snafu::{OptionExt, ResultExt};

use super::{
    ConnectFailedSnafu, CreateConversationSnafu, HistoryLoadFailedSnafu, NoAssistantSelectedSnafu,
    NoConversationBoundSnafu, RestSnafu, SessionError, SessionResult,
};
use crate::cache::LocalCache;
use crate::chat::{ConversationHistory, FoldEffect, MessageId, MessageStatus, StreamAccumulator};
use crate::rest::{AssistantId, ChatBackend, RemoteMessage};

pub const NEW_CONVERSATION_TITLE: &str = "New chat";
pub const TITLE_MAX_CHARS: usize = 50;

/// Title given to a conversation after its first message.
pub fn title_from_first_message(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= TITLE_MAX_CHARS {
        return text.to_string();
    }

    let truncated: String = text.chars().take(TITLE_MAX_CHARS).collect();
    format!("{truncated}...")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    Rest,
    Cache,
    Empty,
}

/// History picked at open time, plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydratedHistory {
    pub history: ConversationHistory,
    pub source: HistorySource,
    pub warning: Option<String>,
}

impl HydratedHistory {
    pub fn from_rest(history: ConversationHistory) -> Self {
        Self {
            history,
            source: HistorySource::Rest,
            warning: None,
        }
    }

    pub fn from_cache(history: ConversationHistory, warning: String) -> Self {
        Self {
            history,
            source: HistorySource::Cache,
            warning: Some(warning),
        }
    }

    pub fn empty(warning: Option<String>) -> Self {
        Self {
            history: ConversationHistory::new(),
            source: HistorySource::Empty,
            warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Blank input; nothing was appended or sent.
    Ignored,
    Sent {
        conversation_id: ConversationId,
        message_id: MessageId,
        created_conversation: bool,
    },
}

/// What a folded transport event means to the view layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Connected {
        conversation_id: ConversationId,
    },
    AssistantDelta {
        message_id: MessageId,
        chunk: String,
    },
    TurnComplete {
        message_id: MessageId,
        content: String,
    },
    ConnectionLost {
        conversation_id: ConversationId,
        reason: CloseReason,
        interrupted: Option<MessageId>,
    },
}

/// Drives one chat session: at most one bound conversation, one socket, one history.
///
/// Every mutating operation takes `&mut self`, so a second `submit` cannot start while
/// one is outstanding. A submit future dropped mid-flight leaves its message `Pending`;
/// the next submit marks it `Failed`.
pub struct SessionController {
    backend: Arc<dyn ChatBackend>,
    cache: LocalCache,
    accumulator: StreamAccumulator,
    transport: TransportConnection,
    events: TransportEventStream,
    assistant: Option<AssistantId>,
    conversation_id: Option<ConversationId>,
    history: ConversationHistory,
    pending_send: Option<MessageId>,
    interrupted: Option<MessageId>,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn KeyValueStore>,
        connector: Arc<dyn Connector>,
        transport_config: TransportConfig,
    ) -> Self {
        let cache = LocalCache::new(store);
        let (transport, events) = TransportConnection::new(connector, transport_config);
        Self {
            backend,
            accumulator: StreamAccumulator::new(cache.clone()),
            cache,
            transport,
            events,
            assistant: None,
            conversation_id: None,
            history: ConversationHistory::new(),
            pending_send: None,
            interrupted: None,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn assistant(&self) -> Option<&AssistantId> {
        self.assistant.as_ref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Binds to `conversation_id`, or to a not-yet-created conversation when `None`.
    ///
    /// A bound conversation gets its socket opened even when no history could be
    /// loaded; that case still returns `HistoryLoadFailed`.
    pub async fn open_conversation(
        &mut self,
        assistant: AssistantId,
        conversation_id: Option<ConversationId>,
    ) -> SessionResult<HydratedHistory> {
        self.unbind();
        self.assistant = Some(assistant);

        let Some(conversation_id) = conversation_id else {
            return Ok(HydratedHistory::empty(None));
        };

        self.conversation_id = Some(conversation_id.clone());
        let hydrated = self.hydrate(&conversation_id).await;
        self.transport.open(&conversation_id);

        let hydrated = hydrated?;
        self.history = hydrated.history.clone();
        tracing::info!(
            conversation_id = %conversation_id,
            source = ?hydrated.source,
            messages = hydrated.history.len(),
            "conversation opened"
        );
        Ok(hydrated)
    }

    pub async fn switch_conversation(
        &mut self,
        conversation_id: ConversationId,
    ) -> SessionResult<HydratedHistory> {
        let assistant = self.assistant.clone().context(NoAssistantSelectedSnafu {
            stage: "switch-conversation",
        })?;
        self.open_conversation(assistant, Some(conversation_id)).await
    }

    /// Returns to the unbound state; the next submit creates a conversation.
    pub fn new_conversation(&mut self) {
        self.unbind();
    }

    /// Tears everything down, including the selected assistant.
    pub fn close(&mut self) {
        self.unbind();
        self.assistant = None;
    }

    pub async fn delete_conversation(&mut self, conversation_id: &ConversationId) -> SessionResult<()> {
        self.backend
            .delete_conversation(conversation_id)
            .await
            .context(RestSnafu {
                stage: "delete-conversation",
            })?;
        self.cache.purge(conversation_id).await;

        if self.conversation_id.as_ref() == Some(conversation_id) {
            self.unbind();
        }
        tracing::info!(conversation_id = %conversation_id, "conversation deleted");
        Ok(())
    }

    /// Appends the trimmed `text` as a user message and delivers it over the socket.
    ///
    /// The message stays in the history whatever happens; its status records whether
    /// it reached the socket.
    pub async fn submit(&mut self, text: &str) -> SessionResult<SubmitOutcome> {
        if text.trim().is_empty() {
            tracing::debug!("ignoring blank submission");
            return Ok(SubmitOutcome::Ignored);
        }
        let text = text.trim();

        self.expire_pending_send();

        let (conversation_id, created_conversation) = match self.conversation_id.clone() {
            Some(conversation_id) => (conversation_id, false),
            None => (self.create_conversation().await?, true),
        };

        let message_id = self.history.push_user(text);
        self.pending_send = Some(message_id.clone());
        self.cache.store(&conversation_id, &self.history).await;

        let delivered = self.deliver(&conversation_id, text).await;
        let status = match &delivered {
            Ok(()) => MessageStatus::Sent,
            Err(_) => MessageStatus::Failed,
        };
        self.history.mark_delivery(&message_id, status);
        self.pending_send = None;
        self.cache.store(&conversation_id, &self.history).await;

        if created_conversation {
            self.rename_after_first_message(&conversation_id, text).await;
        }

        delivered?;
        Ok(SubmitOutcome::Sent {
            conversation_id,
            message_id,
            created_conversation,
        })
    }

    /// Re-runs the open-with-retry wait for the bound conversation.
    pub async fn reconnect(&mut self) -> SessionResult<()> {
        let conversation_id = self.conversation_id.clone().context(NoConversationBoundSnafu {
            stage: "reconnect",
        })?;
        self.transport
            .ensure_open(&conversation_id)
            .await
            .context(ConnectFailedSnafu {
                stage: "reconnect",
                conversation_id: conversation_id.clone(),
            })?;
        Ok(())
    }

    /// Waits for the next event from the bound socket and folds it into the history.
    ///
    /// Events from torn-down sockets are dropped without touching the history. Dropping
    /// this future after an event was taken may leave the cache one mutation behind.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            let event = self.events.recv().await?;
            if let Some(update) = self.apply_event(event).await {
                return Some(update);
            }
        }
    }

    /// Folds every event that is already queued.
    pub async fn drain(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(event) = self.events.try_recv() {
            if let Some(update) = self.apply_event(event).await {
                updates.push(update);
            }
        }
        updates
    }

    fn unbind(&mut self) {
        self.transport.close();
        self.conversation_id = None;
        self.history = ConversationHistory::new();
        self.pending_send = None;
        self.interrupted = None;
    }

    fn expire_pending_send(&mut self) {
        if let Some(message_id) = self.pending_send.take() {
            tracing::warn!(message_id = %message_id, "previous submission was abandoned before delivery");
        }
        self.history.fail_pending();
    }

    async fn create_conversation(&mut self) -> SessionResult<ConversationId> {
        let assistant = self.assistant.clone().context(NoAssistantSelectedSnafu {
            stage: "submit-create-conversation",
        })?;
        let summary = self
            .backend
            .create_conversation(&assistant, NEW_CONVERSATION_TITLE)
            .await
            .context(CreateConversationSnafu {
                stage: "submit-create-conversation",
            })?;

        tracing::info!(conversation_id = %summary.id, assistant = %assistant, "conversation created");
        self.conversation_id = Some(summary.id.clone());
        self.transport.open(&summary.id);
        Ok(summary.id)
    }

    async fn deliver(&mut self, conversation_id: &ConversationId, text: &str) -> SessionResult<()> {
        self.transport
            .ensure_open(conversation_id)
            .await
            .context(ConnectFailedSnafu {
                stage: "submit-ensure-open",
                conversation_id: conversation_id.clone(),
            })?;

        match self.transport.send(text).await {
            Ok(ack) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    bytes = ack.bytes,
                    "user message written"
                );
                Ok(())
            }
            Err(source @ TransportError::NotConnected { .. }) => Err(SessionError::ConnectFailed {
                stage: "submit-send",
                conversation_id: conversation_id.clone(),
                source,
            }),
            Err(source) => Err(SessionError::SendRejected {
                stage: "submit-send",
                conversation_id: conversation_id.clone(),
                source,
            }),
        }
    }

    async fn rename_after_first_message(&self, conversation_id: &ConversationId, text: &str) {
        let title = title_from_first_message(text);
        if let Err(error) = self.backend.rename_conversation(conversation_id, &title).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %error,
                "failed to rename conversation after first message"
            );
        }
    }

    async fn hydrate(&self, conversation_id: &ConversationId) -> SessionResult<HydratedHistory> {
        match self.backend.fetch_messages(conversation_id).await {
            Ok(remote) if !remote.is_empty() => {
                let history = ConversationHistory::restored(
                    remote.into_iter().map(RemoteMessage::into_message).collect(),
                );
                self.cache.store(conversation_id, &history).await;
                Ok(HydratedHistory::from_rest(history))
            }
            Ok(_) => match self.cache.load(conversation_id).await {
                Some(history) if !history.is_empty() => Ok(HydratedHistory::from_cache(
                    history,
                    "server returned no messages; showing cached history".to_string(),
                )),
                _ => Ok(HydratedHistory::empty(None)),
            },
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to fetch conversation history"
                );
                match self.cache.load(conversation_id).await {
                    Some(history) => Ok(HydratedHistory::from_cache(
                        history,
                        format!("showing cached history: {error}"),
                    )),
                    None => Err(error).context(HistoryLoadFailedSnafu {
                        stage: "hydrate-history",
                        conversation_id: conversation_id.clone(),
                    }),
                }
            }
        }
    }

    /// The bound conversation, if `event` came from the socket currently serving it.
    fn owner_of(&self, event: &TransportEventMapped) -> Option<ConversationId> {
        let target = self.transport.current_target()?;
        let conversation_id = self.conversation_id.as_ref()?;
        (*target == event.target && target.conversation_id == *conversation_id)
            .then(|| conversation_id.clone())
    }

    async fn apply_event(&mut self, event: TransportEventMapped) -> Option<SessionUpdate> {
        let Some(conversation_id) = self.owner_of(&event) else {
            tracing::debug!(
                conversation_id = %event.target.conversation_id,
                epoch = event.target.epoch.0,
                "dropping event from a torn-down socket"
            );
            return None;
        };

        let effect = self
            .accumulator
            .apply(&conversation_id, &mut self.history, &event.payload)
            .await;

        match event.payload {
            TransportEventPayload::Handshake(_) => Some(SessionUpdate::Connected { conversation_id }),
            TransportEventPayload::Chunk(chunk) => effect
                .message_id()
                .cloned()
                .map(|message_id| SessionUpdate::AssistantDelta { message_id, chunk }),
            TransportEventPayload::Complete => match effect {
                FoldEffect::Completed(message_id) => {
                    let content = self
                        .history
                        .get(&message_id)
                        .map(|message| message.content.clone())
                        .unwrap_or_default();
                    Some(SessionUpdate::TurnComplete {
                        message_id,
                        content,
                    })
                }
                _ => None,
            },
            TransportEventPayload::Error(message) => {
                tracing::warn!(conversation_id = %conversation_id, error = %message, "conversation socket error");
                if let FoldEffect::Interrupted(message_id) = effect {
                    self.interrupted = Some(message_id);
                }
                None
            }
            TransportEventPayload::Closed(reason) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    reason = %reason.describe(),
                    "conversation socket closed"
                );
                let interrupted = self
                    .interrupted
                    .take()
                    .or_else(|| effect.message_id().cloned());
                Some(SessionUpdate::ConnectionLost {
                    conversation_id,
                    reason,
                    interrupted,
                })
            }
        }
    }
}
