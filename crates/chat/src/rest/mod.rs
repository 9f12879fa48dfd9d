//! REST collaborator the session controller calls into.
//!
//! Only the four chat operations the controller needs are modelled. Everything else
//! the backend offers (assistant CRUD, login, uploads) lives elsewhere.

use std::fmt;

use chatsync_transport::{BoxFuture, ConversationId, StringOrNumberVisitor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::Snafu;

use crate::chat::{Message, MessageId, Role};

mod http;
mod memory;

pub use http::{CHATS_PATH, HttpChatBackend, TokenPair};
pub use memory::{BackendCall, BackendOperation, MemoryChatBackend, ScriptedFailure};

/// Assistant a conversation is held with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssistantId(String);

impl AssistantId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssistantId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for AssistantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<u64> for AssistantId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl Serialize for AssistantId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // The backend keys assistants by integer primary key.
        match self.0.parse::<u64>() {
            Ok(number) => serializer.serialize_u64(number),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for AssistantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(StringOrNumberVisitor).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub name: String,
}

/// Message as the server returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    #[serde(deserialize_with = "deserialize_string_or_number")]
    pub id: String,
    pub sender: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "createdAt", alias = "created_at", default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RemoteMessage {
    pub fn into_message(self) -> Message {
        Message::persisted(
            MessageId::new(self.id),
            Role::from_sender(&self.sender),
            self.content,
            self.created_at.unwrap_or_else(Utc::now),
        )
    }
}

fn deserialize_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(StringOrNumberVisitor)
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RestError {
    #[snafu(display("{endpoint} rejected the credentials ({status}) on `{stage}`"))]
    Unauthorized {
        stage: &'static str,
        endpoint: String,
        status: u16,
    },
    #[snafu(display("request to {endpoint} failed on `{stage}`: {source}"))]
    Network {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
    #[snafu(display("{endpoint} answered {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        endpoint: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode response from {endpoint} on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        endpoint: String,
        source: reqwest::Error,
    },
}

impl RestError {
    /// Authentication failures are reported apart from everything else.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

pub type RestResult<T> = Result<T, RestError>;

pub trait ChatBackend: Send + Sync {
    fn create_conversation<'a>(
        &'a self,
        assistant: &'a AssistantId,
        title: &'a str,
    ) -> BoxFuture<'a, RestResult<ConversationSummary>>;

    /// Messages in conversational order.
    fn fetch_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, RestResult<Vec<RemoteMessage>>>;

    fn rename_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        title: &'a str,
    ) -> BoxFuture<'a, RestResult<()>>;

    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, RestResult<()>>;
}
