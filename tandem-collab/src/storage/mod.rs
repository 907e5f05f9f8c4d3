//! Local key/value persistence for session state.
//!
//! Four values survive a restart, each under its own key:
//!
//! | Key                     | Value                          |
//! |-------------------------|--------------------------------|
//! | `collaboration-room-id` | room the editor rejoins        |
//! | `peer-id`               | preferred transport peer id    |
//! | `editor-content`        | plain text of the document     |
//! | `editor-state`          | CRDT state the text came from  |
//!
//! The CRDT state lets a restarted peer rejoin collaborators that still hold
//! the same history without replaying its text as a fresh insert.
//!
//! There is no schema versioning: a value is either valid or absent.
//! Callers treat every [`StoreError`] as "storage unavailable" and carry on
//! in memory.

pub mod rocks;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use rocks::{RocksStore, StoreConfig};

pub const ROOM_KEY: &str = "collaboration-room-id";
pub const PEER_KEY: &str = "peer-id";
pub const CONTENT_KEY: &str = "editor-content";
pub const SNAPSHOT_KEY: &str = "editor-state";

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("stored value is not valid UTF-8")]
    Encoding,
    #[error("storage unavailable")]
    Unavailable,
}

/// String key/value storage scoped to one editor profile.
pub trait LocalStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    /// Encoded document state saved by the last [`save_snapshot`](Self::save_snapshot).
    fn load_snapshot(&self) -> Result<Option<Vec<u8>>, StoreError>;
    fn save_snapshot(&mut self, state: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store. Clones share the same map, like tabs sharing a profile.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    snapshot: Arc<Mutex<Option<Vec<u8>>>>,
    unavailable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation fails, for exercising degraded paths.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable);
        }
        self.values.lock().map_err(|_| StoreError::Unavailable)
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map()?.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.map()?.remove(key);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Vec<u8>>, StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable);
        }
        let slot = self.snapshot.lock().map_err(|_| StoreError::Unavailable)?;
        Ok(slot.clone())
    }

    fn save_snapshot(&mut self, state: &[u8]) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable);
        }
        let mut slot = self.snapshot.lock().map_err(|_| StoreError::Unavailable)?;
        *slot = Some(state.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_set_get_remove() {
        let mut store = MemoryStore::new();
        assert_eq!(store.get(ROOM_KEY).unwrap(), None);

        store.set(ROOM_KEY, "room-1").unwrap();
        assert_eq!(store.get(ROOM_KEY).unwrap().as_deref(), Some("room-1"));

        store.remove(ROOM_KEY).unwrap();
        assert_eq!(store.get(ROOM_KEY).unwrap(), None);
    }

    #[test]
    fn test_memory_store_clones_share_state() {
        let mut store = MemoryStore::new();
        let other = store.clone();
        store.set(PEER_KEY, "peer-a").unwrap();

        assert_eq!(other.get(PEER_KEY).unwrap().as_deref(), Some("peer-a"));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_unavailable_store_errors() {
        let mut store = MemoryStore::unavailable();
        assert!(store.get(CONTENT_KEY).is_err());
        assert!(store.set(CONTENT_KEY, "x").is_err());
        assert!(store.remove(CONTENT_KEY).is_err());
        assert!(store.save_snapshot(&[1, 2, 3]).is_err());
        assert!(store.load_snapshot().is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_snapshot_shared_by_clones() {
        let mut store = MemoryStore::new();
        let other = store.clone();
        assert_eq!(other.load_snapshot().unwrap(), None);

        store.save_snapshot(&[1, 2, 3]).unwrap();
        assert_eq!(other.load_snapshot().unwrap(), Some(vec![1, 2, 3]));
    }
}
