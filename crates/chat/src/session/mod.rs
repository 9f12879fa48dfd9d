use chatsync_transport::{ConversationId, TransportError};
use snafu::Snafu;

use crate::rest::RestError;

mod controller;

pub use controller::{
    HistorySource, HydratedHistory, NEW_CONVERSATION_TITLE, SessionController, SessionUpdate,
    SubmitOutcome, TITLE_MAX_CHARS, title_from_first_message,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("no assistant selected on `{stage}`"))]
    NoAssistantSelected { stage: &'static str },
    #[snafu(display("no conversation bound on `{stage}`"))]
    NoConversationBound { stage: &'static str },
    #[snafu(display("failed to create conversation on `{stage}`: {source}"))]
    CreateConversation {
        stage: &'static str,
        source: RestError,
    },
    #[snafu(display("could not connect to conversation {conversation_id} on `{stage}`: {source}"))]
    ConnectFailed {
        stage: &'static str,
        conversation_id: ConversationId,
        source: TransportError,
    },
    #[snafu(display("socket refused the message for {conversation_id} on `{stage}`: {source}"))]
    SendRejected {
        stage: &'static str,
        conversation_id: ConversationId,
        source: TransportError,
    },
    #[snafu(display(
        "history for {conversation_id} unavailable from server and cache on `{stage}`: {source}"
    ))]
    HistoryLoadFailed {
        stage: &'static str,
        conversation_id: ConversationId,
        source: RestError,
    },
    #[snafu(display("chat backend request failed on `{stage}`: {source}"))]
    Rest {
        stage: &'static str,
        source: RestError,
    },
}

impl SessionError {
    /// Connection problems the user can retry from.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. } | Self::SendRejected { .. })
    }

    pub fn is_auth(&self) -> bool {
        match self {
            Self::CreateConversation { source, .. }
            | Self::HistoryLoadFailed { source, .. }
            | Self::Rest { source, .. } => source.is_auth(),
            _ => false,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
