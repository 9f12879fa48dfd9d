use chatsync_transport::{ConversationId, TransportEventPayload};

use super::message::{ConversationHistory, MessageId, MessageStatus};
use crate::cache::LocalCache;

/// What folding one transport event did to the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldEffect {
    Started(MessageId),
    Appended(MessageId),
    Completed(MessageId),
    Interrupted(MessageId),
    Unchanged,
}

impl FoldEffect {
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Started(id) | Self::Appended(id) | Self::Completed(id) | Self::Interrupted(id) => {
                Some(id)
            }
            Self::Unchanged => None,
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Folds one event into `history` in place.
///
/// A `complete` with no turn in flight is a no-op. Socket errors and closes seal an
/// in-flight turn as interrupted, keeping whatever text already arrived.
pub fn fold_event(history: &mut ConversationHistory, payload: &TransportEventPayload) -> FoldEffect {
    match payload {
        TransportEventPayload::Chunk(chunk) => match history.append_assistant_chunk(chunk) {
            (id, true) => FoldEffect::Started(id),
            (id, false) => FoldEffect::Appended(id),
        },
        TransportEventPayload::Complete => history
            .seal_assistant(MessageStatus::Complete)
            .map_or(FoldEffect::Unchanged, FoldEffect::Completed),
        TransportEventPayload::Error(_) | TransportEventPayload::Closed(_) => history
            .seal_assistant(MessageStatus::Interrupted)
            .map_or(FoldEffect::Unchanged, FoldEffect::Interrupted),
        TransportEventPayload::Handshake(_) => FoldEffect::Unchanged,
    }
}

/// Value-style form of [`fold_event`].
pub fn reduce(mut history: ConversationHistory, payload: &TransportEventPayload) -> ConversationHistory {
    fold_event(&mut history, payload);
    history
}

/// Applies events and writes every changed history through to the local cache.
#[derive(Clone)]
pub struct StreamAccumulator {
    cache: LocalCache,
}

impl StreamAccumulator {
    pub fn new(cache: LocalCache) -> Self {
        Self { cache }
    }

    pub async fn apply(
        &self,
        conversation_id: &ConversationId,
        history: &mut ConversationHistory,
        payload: &TransportEventPayload,
    ) -> FoldEffect {
        let effect = fold_event(history, payload);
        debug_assert!(history.unsealed_assistant_count() <= 1);

        if effect.changed() {
            self.cache.store(conversation_id, history).await;
        }
        effect
    }
}
