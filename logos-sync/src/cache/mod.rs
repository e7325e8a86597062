//! Local durable cache: one serialized snapshot per document id.
//!
//! ```text
//! ┌──────────────┐   store(doc, snapshot)   ┌──────────────────────────┐
//! │ SyncEngine   │ ───────────────────────► │ LocalCache               │
//! │ (sole writer)│ ◄─────────────────────── │  MemoryCache (tests)     │
//! └──────────────┘   load(doc)              │  RocksCache  (LZ4 + CFs) │
//!                                           └──────────────────────────┘
//! ```
//!
//! Each document id has exactly one writer, the engine that owns it, so
//! implementations need no cross-writer locking.

pub mod rocks;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;

pub use rocks::{CacheMetadata, RocksCache};

#[async_trait]
pub trait LocalCache: Send + Sync + 'static {
    /// Stored snapshot for `document_id`, if any.
    async fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the stored snapshot for `document_id`.
    async fn store(&self, document_id: &str, snapshot: &[u8]) -> Result<()>;
}

/// Volatile cache, handy for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
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

#[async_trait]
impl LocalCache for MemoryCache {
    async fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(document_id).cloned())
    }

    async fn store(&self, document_id: &str, snapshot: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(document_id.to_string(), snapshot.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        assert!(cache.load("wb-1").await.unwrap().is_none());

        cache.store("wb-1", &[1, 2, 3]).await.unwrap();
        cache.store("wb-1", &[4]).await.unwrap();
        assert_eq!(cache.load("wb-1").await.unwrap(), Some(vec![4]));
        assert_eq!(cache.len().await, 1);
    }
}
