//! Durable key-value storage used by the outbox.
//!
//! Defines the [`KvStore`] trait (`get` / `set` / `delete` by string key),
//! an in-memory [`MemoryKv`] for tests and ephemeral sessions, and the
//! file-backed [`file::FileKv`] for durable on-disk storage.

pub mod file;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The underlying storage is full, missing or otherwise unusable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),
}

/// Scoped durable key-value storage.
///
/// Implementations include:
/// - [`MemoryKv`]: in-memory map, optionally switched into a failing mode
/// - [`file::FileKv`]: one file per key inside a directory
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`, or `None` if there is none.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, StorageError>> + Send;

    /// Store `value` under `key`, replacing any previous value.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Delete `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str)
    -> impl std::future::Future<Output = Result<(), StorageError>> + Send;
}

/// In-memory implementation of [`KvStore`].
///
/// Not persistent: all data is lost when the value is dropped. Calling
/// [`set_available(false)`](Self::set_available) makes every operation fail
/// with [`StorageError::Unavailable`], which is how tests exercise the
/// degraded outbox path.
#[derive(Debug)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    available: AtomicBool,
}

impl MemoryKv {
    /// Create a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated storage availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory store switched off".into()))
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.check()?;
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }
}

impl<T: KvStore> KvStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        (**self).delete(key).await
    }
}
