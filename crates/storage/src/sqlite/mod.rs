use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{ResultExt, ensure};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::error::{
    CreateSqliteDirectorySnafu, EmptyKeySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::{BoxFuture, KeyValueStore};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `:memory:` databases alive for the pool lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite cache store");
        Ok(Self { pool, database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn read_entry(&self, key: &str) -> StorageResult<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "cache-get-query",
            })
    }

    async fn write_entry(&self, key: &str, value: String) -> StorageResult<()> {
        ensure!(
            !key.is_empty(),
            EmptyKeySnafu {
                stage: "cache-put-validate-key"
            }
        );

        sqlx::query(
            "INSERT INTO cache_entries (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(unix_timestamp_seconds())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "cache-put-upsert",
        })?;

        Ok(())
    }

    async fn delete_entry(&self, key: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "cache-remove-delete",
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // substr comparison sidesteps LIKE wildcard escaping for arbitrary prefixes.
        sqlx::query_scalar::<_, String>(
            "SELECT key FROM cache_entries WHERE substr(key, 1, length(?)) = ? ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "cache-keys-with-prefix",
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(self.read_entry(key))
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.write_entry(key, value))
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(self.delete_entry(key))
    }

    fn keys_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, StorageResult<Vec<String>>> {
        Box::pin(self.list_keys(prefix))
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_urls_are_normalized() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
        assert_eq!(
            normalize_database_url("/tmp/cache/chat.db"),
            "sqlite:///tmp/cache/chat.db"
        );
    }

    #[tokio::test]
    async fn entries_survive_reopen_and_upsert_in_place() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("nested").join("cache.db");
        let location = path.to_string_lossy().to_string();

        let store = SqliteStore::open(&location).await.expect("open store");
        store
            .put("chat_messages_7", "[1]".to_string())
            .await
            .expect("first put");
        store
            .put("chat_messages_7", "[1,2]".to_string())
            .await
            .expect("second put");
        drop(store);

        let reopened = SqliteStore::open(&location).await.expect("reopen store");
        assert_eq!(
            reopened.get("chat_messages_7").await.expect("get"),
            Some("[1,2]".to_string())
        );
        assert_eq!(
            reopened.keys_with_prefix("chat_").await.expect("keys"),
            vec!["chat_messages_7".to_string()]
        );
    }

    #[tokio::test]
    async fn memory_database_supports_remove_and_prefix_scans() {
        let store = SqliteStore::open(":memory:").await.expect("open store");
        store.put("chat_messages_1", "a".into()).await.expect("put");
        store.put("chat_messages_2", "b".into()).await.expect("put");
        store.put("chat_%_other", "c".into()).await.expect("put");

        let keys = store.keys_with_prefix("chat_messages_").await.expect("keys");
        assert_eq!(keys, vec!["chat_messages_1", "chat_messages_2"]);

        assert!(store.remove("chat_messages_1").await.expect("remove"));
        assert!(!store.remove("chat_messages_1").await.expect("remove twice"));
        assert_eq!(store.get("chat_messages_1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn empty_keys_are_rejected() {
        let store = SqliteStore::open(":memory:").await.expect("open store");
        let error = store.put("", "value".into()).await.unwrap_err();
        assert!(matches!(error, crate::StorageError::EmptyKey { .. }));
    }
}
