#![deny(unsafe_code)]

//! Chat streaming synchronization: keeps a conversation's message history in step
//! with a streamed WebSocket reply, a REST backend and a local cache.

/// Per-conversation history cache over a key-value store.
pub mod cache;
/// Message model and stream folding.
pub mod chat;
/// REST collaborator boundary.
pub mod rest;
/// Session orchestration the view layer drives.
pub mod session;
pub mod settings;

pub use cache::{CACHE_KEY_PREFIX, CacheError, LocalCache};
pub use chat::{
    ConversationHistory, FoldEffect, Message, MessageId, MessageStatus, Role, StreamAccumulator,
};
pub use rest::{
    AssistantId, ChatBackend, ConversationSummary, HttpChatBackend, RemoteMessage, RestError,
    TokenPair,
};
pub use session::{
    HistorySource, HydratedHistory, SessionController, SessionError, SessionResult,
    SessionUpdate, SubmitOutcome,
};
pub use settings::{ClientSettings, SettingsError, SettingsStore};
