use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chatsync_transport::{BoxFuture, ConversationId};

use super::{
    AssistantId, ChatBackend, ConversationSummary, RemoteMessage, RestError, RestResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOperation {
    Create,
    Fetch,
    Rename,
    Delete,
}

/// Failure the in-process backend answers with instead of succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Unauthorized,
    Status(u16),
}

impl ScriptedFailure {
    fn into_error(self, operation: BackendOperation) -> RestError {
        let endpoint = format!("memory://{operation:?}").to_lowercase();
        match self {
            Self::Unauthorized => RestError::Unauthorized {
                stage: "memory-backend",
                endpoint,
                status: 401,
            },
            Self::Status(status) => RestError::Status {
                stage: "memory-backend",
                endpoint,
                status,
                body: String::new(),
            },
        }
    }
}

/// One recorded call, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create {
        assistant: AssistantId,
        title: String,
    },
    Fetch(ConversationId),
    Rename {
        conversation_id: ConversationId,
        title: String,
    },
    Delete(ConversationId),
}

#[derive(Debug, Clone)]
struct StoredConversation {
    name: String,
    messages: Vec<RemoteMessage>,
}

#[derive(Debug, Default)]
struct MemoryBackendState {
    next_id: u64,
    conversations: BTreeMap<ConversationId, StoredConversation>,
    failures: HashMap<BackendOperation, ScriptedFailure>,
    calls: Vec<BackendCall>,
}

/// In-process chat backend that records every call.
#[derive(Debug, Default)]
pub struct MemoryChatBackend {
    state: Mutex<MemoryBackendState>,
}

impl MemoryChatBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_conversation(
        &self,
        conversation_id: ConversationId,
        name: impl Into<String>,
        messages: Vec<RemoteMessage>,
    ) {
        self.lock().conversations.insert(
            conversation_id,
            StoredConversation {
                name: name.into(),
                messages,
            },
        );
    }

    /// Makes `operation` fail until cleared with `None`.
    pub fn fail(&self, operation: BackendOperation, failure: Option<ScriptedFailure>) {
        let mut state = self.lock();
        match failure {
            Some(failure) => state.failures.insert(operation, failure),
            None => state.failures.remove(&operation),
        };
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn conversation_name(&self, conversation_id: &ConversationId) -> Option<String> {
        self.lock()
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.name.clone())
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.lock().conversations.contains_key(conversation_id)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryBackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(
        &self,
        call: BackendCall,
        operation: BackendOperation,
    ) -> RestResult<MutexGuard<'_, MemoryBackendState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(failure) = state.failures.get(&operation).copied() {
            return Err(failure.into_error(operation));
        }
        Ok(state)
    }

    fn create(&self, assistant: &AssistantId, title: &str) -> RestResult<ConversationSummary> {
        let mut state = self.record(
            BackendCall::Create {
                assistant: assistant.clone(),
                title: title.to_string(),
            },
            BackendOperation::Create,
        )?;

        // Skip ids seeded through insert_conversation.
        let conversation_id = loop {
            state.next_id += 1;
            let candidate = ConversationId::from(state.next_id);
            if !state.conversations.contains_key(&candidate) {
                break candidate;
            }
        };
        state.conversations.insert(
            conversation_id.clone(),
            StoredConversation {
                name: title.to_string(),
                messages: Vec::new(),
            },
        );

        Ok(ConversationSummary {
            id: conversation_id,
            name: title.to_string(),
        })
    }

    fn fetch(&self, conversation_id: &ConversationId) -> RestResult<Vec<RemoteMessage>> {
        let state = self.record(
            BackendCall::Fetch(conversation_id.clone()),
            BackendOperation::Fetch,
        )?;
        match state.conversations.get(conversation_id) {
            Some(conversation) => Ok(conversation.messages.clone()),
            None => Err(ScriptedFailure::Status(404).into_error(BackendOperation::Fetch)),
        }
    }

    fn rename(&self, conversation_id: &ConversationId, title: &str) -> RestResult<()> {
        let mut state = self.record(
            BackendCall::Rename {
                conversation_id: conversation_id.clone(),
                title: title.to_string(),
            },
            BackendOperation::Rename,
        )?;
        match state.conversations.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.name = title.to_string();
                Ok(())
            }
            None => Err(ScriptedFailure::Status(404).into_error(BackendOperation::Rename)),
        }
    }

    fn delete(&self, conversation_id: &ConversationId) -> RestResult<()> {
        let mut state = self.record(
            BackendCall::Delete(conversation_id.clone()),
            BackendOperation::Delete,
        )?;
        match state.conversations.remove(conversation_id) {
            Some(_) => Ok(()),
            None => Err(ScriptedFailure::Status(404).into_error(BackendOperation::Delete)),
        }
    }
}

impl ChatBackend for MemoryChatBackend {
    fn create_conversation<'a>(
        &'a self,
        assistant: &'a AssistantId,
        title: &'a str,
    ) -> BoxFuture<'a, RestResult<ConversationSummary>> {
        Box::pin(async move { self.create(assistant, title) })
    }

    fn fetch_messages<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, RestResult<Vec<RemoteMessage>>> {
        Box::pin(async move { self.fetch(conversation_id) })
    }

    fn rename_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        title: &'a str,
    ) -> BoxFuture<'a, RestResult<()>> {
        Box::pin(async move { self.rename(conversation_id, title) })
    }

    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, RestResult<()>> {
        Box::pin(async move { self.delete(conversation_id) })
    }
}
