use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Locally unique message identifier.
///
/// Fresh ids are UUIDv7, so lexical order follows creation order. Ids taken from the
/// server are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mints a new time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Maps a server `sender` field: only `"user"` is a user, everything else is the assistant.
    pub fn from_sender(sender: &str) -> Self {
        if sender == "user" {
            Self::User
        } else {
            Self::Assistant
        }
    }
}

/// Delivery status for user messages, turn status for assistant messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Appended locally, not yet confirmed written to an open socket.
    Pending,
    Sent,
    Failed,
    /// Assistant turn still receiving chunks.
    Streaming,
    Complete,
    /// The socket failed or closed before the turn completed.
    Interrupted,
}

impl MessageStatus {
    pub fn is_sealed(self) -> bool {
        !matches!(self, Self::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sealed: bool,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp,
            sealed: status.is_sealed(),
            status,
        }
    }

    /// User messages are sealed from the start; only their delivery status moves.
    pub fn user_pending(content: impl Into<String>) -> Self {
        Self::new(
            MessageId::generate(),
            Role::User,
            content,
            Utc::now(),
            MessageStatus::Pending,
        )
    }

    pub fn assistant_streaming(content: impl Into<String>) -> Self {
        Self::new(
            MessageId::generate(),
            Role::Assistant,
            content,
            Utc::now(),
            MessageStatus::Streaming,
        )
    }

    /// A message the server already persisted.
    pub fn persisted(
        id: MessageId,
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let status = match role {
            Role::User => MessageStatus::Sent,
            Role::Assistant => MessageStatus::Complete,
        };
        Self::new(id, role, content, timestamp, status)
    }

    pub fn is_streaming_assistant(&self) -> bool {
        self.role == Role::Assistant && !self.sealed
    }

    fn set_status(&mut self, status: MessageStatus) {
        self.status = status;
        self.sealed = status.is_sealed();
    }
}

/// Ordered message list of one conversation.
///
/// Holds at most one unsealed assistant message; every mutation goes through methods
/// that preserve that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a history loaded from outside the live session.
    ///
    /// Nothing is in flight after a reload, so leftover streaming turns become
    /// `Interrupted` and unconfirmed user messages become `Failed`.
    pub fn restored(messages: Vec<Message>) -> Self {
        let mut history = Self { messages };
        for message in &mut history.messages {
            match message.status {
                MessageStatus::Streaming => message.set_status(MessageStatus::Interrupted),
                MessageStatus::Pending => message.set_status(MessageStatus::Failed),
                _ => message.sealed = message.status.is_sealed(),
            }
        }
        history
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == *id)
    }

    pub fn streaming_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.is_streaming_assistant())
    }

    pub fn unsealed_assistant_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.is_streaming_assistant())
            .count()
    }

    /// Appends a sealed, pending user message; returns its id.
    pub fn push_user(&mut self, content: impl Into<String>) -> MessageId {
        let message = Message::user_pending(content);
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    /// Appends `chunk` to the in-flight assistant message, starting one if none exists.
    ///
    /// Returns the message id and whether a new message was started.
    pub fn append_assistant_chunk(&mut self, chunk: &str) -> (MessageId, bool) {
        if let Some(message) = self
            .messages
            .iter_mut()
            .rev()
            .find(|message| message.is_streaming_assistant())
        {
            message.content.push_str(chunk);
            return (message.id.clone(), false);
        }

        let message = Message::assistant_streaming(chunk);
        let id = message.id.clone();
        self.messages.push(message);
        (id, true)
    }

    /// Seals the in-flight assistant message with `status`, if there is one.
    pub fn seal_assistant(&mut self, status: MessageStatus) -> Option<MessageId> {
        let message = self
            .messages
            .iter_mut()
            .rev()
            .find(|message| message.is_streaming_assistant())?;
        message.set_status(status);
        Some(message.id.clone())
    }

    /// Updates a user message's delivery status. Returns false for unknown ids.
    pub fn mark_delivery(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| message.id == *id && message.role == Role::User)
        else {
            return false;
        };
        message.set_status(status);
        true
    }

    /// Marks every still-pending user message as failed; returns how many changed.
    pub fn fail_pending(&mut self) -> usize {
        let mut changed = 0;
        for message in &mut self.messages {
            if message.role == Role::User && message.status == MessageStatus::Pending {
                message.set_status(MessageStatus::Failed);
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_fold_into_one_streaming_message() {
        let mut history = ConversationHistory::new();
        let (first, started) = history.append_assistant_chunk("Hel");
        let (second, started_again) = history.append_assistant_chunk("lo");

        assert!(started);
        assert!(!started_again);
        assert_eq!(first, second);
        assert_eq!(history.len(), 1);
        assert_eq!(history.unsealed_assistant_count(), 1);

        let sealed = history.seal_assistant(MessageStatus::Complete);
        assert_eq!(sealed, Some(first.clone()));
        let message = history.get(&first).expect("message");
        assert_eq!(message.content, "Hello");
        assert!(message.sealed);
        assert_eq!(history.unsealed_assistant_count(), 0);
        assert_eq!(history.seal_assistant(MessageStatus::Complete), None);
    }

    #[test]
    fn sealed_turn_is_never_extended() {
        let mut history = ConversationHistory::new();
        let (first, _) = history.append_assistant_chunk("one");
        history.seal_assistant(MessageStatus::Complete);
        let (second, started) = history.append_assistant_chunk("two");

        assert!(started);
        assert_ne!(first, second);
        assert_eq!(history.get(&first).map(|m| m.content.as_str()), Some("one"));
    }

    #[test]
    fn restored_history_has_nothing_in_flight() {
        let pending = Message::user_pending("hi");
        let streaming = Message::assistant_streaming("partial");
        let history = ConversationHistory::restored(vec![pending, streaming]);

        assert_eq!(history.messages()[0].status, MessageStatus::Failed);
        assert_eq!(history.messages()[1].status, MessageStatus::Interrupted);
        assert!(history.messages().iter().all(|message| message.sealed));
    }

    #[test]
    fn only_user_messages_take_delivery_status() {
        let mut history = ConversationHistory::new();
        let user = history.push_user("hello");
        let (assistant, _) = history.append_assistant_chunk("hey");

        assert!(history.mark_delivery(&user, MessageStatus::Sent));
        assert!(!history.mark_delivery(&assistant, MessageStatus::Sent));
        assert_eq!(history.fail_pending(), 0);
        assert_eq!(history.get(&user).map(|m| m.status), Some(MessageStatus::Sent));
    }

    #[test]
    fn server_sender_maps_to_role() {
        assert_eq!(Role::from_sender("user"), Role::User);
        assert_eq!(Role::from_sender("assistant"), Role::Assistant);
        assert_eq!(Role::from_sender("bot"), Role::Assistant);
    }
}
