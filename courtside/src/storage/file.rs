//! File-backed [`KvStore`]: one file per key inside a directory.
//!
//! Keys are escaped into file names (`%XX` for anything outside
//! `[A-Za-z0-9._-]`), so distinct keys never share a file. Writes go to a
//! temporary file first and are renamed into place, so a crash mid-write
//! leaves the previous value intact.

use std::path::{Path, PathBuf};

use super::{KvStore, StorageError};

/// Directory-backed durable storage.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Create a store rooted at `dir`. The directory is created lazily on
    /// the first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the stored keys.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(escape_key(key))
    }
}

/// Escape a key into a portable file name.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

impl KvStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadFailed(format!("{key}: {e}"))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", self.dir.display())))?;

        let path = self.path_for(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("{key}: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("{key}: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::WriteFailed(format!("{key}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("courtside-kv-{name}-{}", std::process::id()))
    }

    #[test]
    fn escape_keeps_safe_chars_and_escapes_the_rest() {
        assert_eq!(escape_key("chat-outbox.v1_x"), "chat-outbox.v1_x");
        assert_eq!(escape_key("chat-outbox:GAME:g/1"), "chat-outbox%3AGAME%3Ag%2F1");
    }

    #[test]
    fn escape_is_injective_for_lookalike_keys() {
        assert_ne!(escape_key("GAME:a"), escape_key("GAME_a"));
        assert_ne!(escape_key("a%3A"), escape_key("a:"));
    }

    #[tokio::test]
    async fn values_survive_a_new_store_instance() {
        let dir = scratch_dir("reopen");
        let first = FileKv::new(&dir);
        first.set("chat-outbox:GAME:1", b"[1]".to_vec()).await.unwrap();

        let reopened = FileKv::new(&dir);
        assert_eq!(
            reopened.get("chat-outbox:GAME:1").await.unwrap(),
            Some(b"[1]".to_vec())
        );

        reopened.delete("chat-outbox:GAME:1").await.unwrap();
        assert!(first.get("chat-outbox:GAME:1").await.unwrap().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_key_and_missing_dir_read_as_none() {
        let kv = FileKv::new(scratch_dir("missing"));
        assert!(kv.get("nothing").await.unwrap().is_none());
        assert!(kv.delete("nothing").await.is_ok());
    }
}
