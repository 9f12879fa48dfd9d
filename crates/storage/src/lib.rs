pub mod error;
pub mod memory;
pub mod sqlite;

use std::future::Future;
use std::pin::Pin;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable string-keyed store backing the per-conversation message cache.
///
/// Values are opaque strings; callers own the encoding. There is no TTL and no
/// eviction, entries live until they are removed explicitly.
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>>;
    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>>;
    /// Returns true when an entry existed.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<bool>>;
    fn keys_with_prefix<'a>(&'a self, prefix: &'a str)
    -> BoxFuture<'a, StorageResult<Vec<String>>>;
}
