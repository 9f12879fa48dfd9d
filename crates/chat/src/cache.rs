use std::sync::Arc;

use chatsync_storage::{KeyValueStore, StorageError};
use chatsync_transport::ConversationId;
use snafu::{ResultExt, Snafu};

use crate::chat::ConversationHistory;

pub const CACHE_KEY_PREFIX: &str = "chat_messages_";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    #[snafu(display("cache store failed on `{stage}` for key {key}: {source}"))]
    Store {
        stage: &'static str,
        key: String,
        source: StorageError,
    },
    #[snafu(display("failed to decode cached history on `{stage}` for key {key}: {source}"))]
    Decode {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode history on `{stage}` for key {key}: {source}"))]
    Encode {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Advisory per-conversation copy of the message history.
///
/// The `try_*` methods report failures; the plain ones log and carry on.
#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
}

impl LocalCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn key_for(conversation_id: &ConversationId) -> String {
        format!("{CACHE_KEY_PREFIX}{conversation_id}")
    }

    pub async fn try_load(
        &self,
        conversation_id: &ConversationId,
    ) -> CacheResult<Option<ConversationHistory>> {
        let key = Self::key_for(conversation_id);
        let Some(raw) = self.store.get(&key).await.context(StoreSnafu {
            stage: "cache-read",
            key: key.clone(),
        })?
        else {
            return Ok(None);
        };

        let messages = serde_json::from_str(&raw).context(DecodeSnafu {
            stage: "cache-decode",
            key,
        })?;
        Ok(Some(ConversationHistory::restored(messages)))
    }

    pub async fn try_store(
        &self,
        conversation_id: &ConversationId,
        history: &ConversationHistory,
    ) -> CacheResult<()> {
        let key = Self::key_for(conversation_id);
        let raw = serde_json::to_string(history).context(EncodeSnafu {
            stage: "cache-encode",
            key: key.clone(),
        })?;
        self.store.put(&key, raw).await.context(StoreSnafu {
            stage: "cache-write",
            key,
        })
    }

    pub async fn load(&self, conversation_id: &ConversationId) -> Option<ConversationHistory> {
        match self.try_load(conversation_id).await {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "ignoring unreadable cached history"
                );
                None
            }
        }
    }

    pub async fn store(&self, conversation_id: &ConversationId, history: &ConversationHistory) {
        if let Err(error) = self.try_store(conversation_id, history).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                messages = history.len(),
                error = %error,
                "failed to write cached history"
            );
        }
    }

    pub async fn purge(&self, conversation_id: &ConversationId) {
        let key = Self::key_for(conversation_id);
        match self.store.remove(&key).await {
            Ok(removed) => {
                tracing::debug!(conversation_id = %conversation_id, removed, "purged cached history");
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to purge cached history"
                );
            }
        }
    }

    /// Conversations that currently have a cache entry.
    pub async fn cached_conversations(&self) -> CacheResult<Vec<ConversationId>> {
        let keys = self
            .store
            .keys_with_prefix(CACHE_KEY_PREFIX)
            .await
            .context(StoreSnafu {
                stage: "cache-list",
                key: CACHE_KEY_PREFIX.to_string(),
            })?;

        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(CACHE_KEY_PREFIX)
                    .filter(|id| !id.is_empty())
                    .map(ConversationId::from)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chatsync_storage::{MemoryStore, SqliteStore};

    use super::*;
    use crate::chat::MessageStatus;

    fn sample_history() -> ConversationHistory {
        let mut history = ConversationHistory::new();
        let user = history.push_user("hello");
        history.mark_delivery(&user, MessageStatus::Sent);
        history.append_assistant_chunk("Hel");
        history.append_assistant_chunk("lo");
        history.seal_assistant(MessageStatus::Complete);
        history.push_user("again");
        history
    }

    #[tokio::test]
    async fn history_survives_a_store_and_reload() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("cache.sqlite3");
        let conversation_id = ConversationId::from(9_u64);
        let mut history = sample_history();
        let pending = history.messages()[2].id.clone();
        history.mark_delivery(&pending, MessageStatus::Sent);

        {
            let store = SqliteStore::open(path.to_str().expect("utf-8 path"))
                .await
                .expect("open sqlite");
            LocalCache::new(Arc::new(store))
                .try_store(&conversation_id, &history)
                .await
                .expect("store");
        }

        let store = SqliteStore::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("reopen sqlite");
        let reloaded = LocalCache::new(Arc::new(store))
            .try_load(&conversation_id)
            .await
            .expect("load")
            .expect("entry");
        assert_eq!(reloaded, history);
    }

    #[tokio::test]
    async fn entries_are_keyed_by_conversation_id() {
        let store = Arc::new(MemoryStore::new());
        let cache = LocalCache::new(store.clone());
        cache
            .store(&ConversationId::from("42"), &sample_history())
            .await;

        let raw = store
            .get("chat_messages_42")
            .await
            .expect("get")
            .expect("raw entry");
        let decoded: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(decoded[0]["role"], "user");
        assert_eq!(decoded[0]["content"], "hello");
        assert_eq!(
            cache.cached_conversations().await.expect("list"),
            vec![ConversationId::from("42")]
        );
    }

    #[tokio::test]
    async fn unreadable_entries_are_treated_as_missing() {
        let store = Arc::new(MemoryStore::new());
        store
            .put("chat_messages_7", "not json".to_string())
            .await
            .expect("put");
        let cache = LocalCache::new(store);
        let conversation_id = ConversationId::from("7");

        assert!(matches!(
            cache.try_load(&conversation_id).await,
            Err(CacheError::Decode { .. })
        ));
        assert_eq!(cache.load(&conversation_id).await, None);

        cache.purge(&conversation_id).await;
        assert!(cache.try_load(&conversation_id).await.expect("load").is_none());
    }
}
