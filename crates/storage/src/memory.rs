use std::collections::BTreeMap;

use snafu::ensure;
use tokio::sync::RwLock;

use super::error::{EmptyKeySnafu, StorageResult};
use super::{BoxFuture, KeyValueStore};

/// Process-local store; contents vanish with the value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move { Ok(self.entries.read().await.get(key).cloned()) })
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            ensure!(
                !key.is_empty(),
                EmptyKeySnafu {
                    stage: "memory-put-validate-key"
                }
            );
            self.entries.write().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move { Ok(self.entries.write().await.remove(key).is_some()) })
    }

    fn keys_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_scan_stops_at_first_non_matching_key() {
        let store = MemoryStore::new();
        store.put("a", "0".into()).await.expect("put");
        store.put("chat_messages_1", "1".into()).await.expect("put");
        store.put("chat_messages_2", "2".into()).await.expect("put");
        store.put("z", "3".into()).await.expect("put");

        let keys = store.keys_with_prefix("chat_messages_").await.expect("keys");
        assert_eq!(keys, vec!["chat_messages_1", "chat_messages_2"]);
        assert_eq!(store.len().await, 4);
    }
}
