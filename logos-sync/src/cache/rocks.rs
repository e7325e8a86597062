//! RocksDB-backed snapshot cache.
//!
//! Column families:
//! - `documents`: latest document snapshot (LZ4 compressed), keyed by document id
//! - `metadata`: sizes and last-write time (bincode)
//!
//! RocksDB calls block, so every trait method hops onto the blocking pool.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, Options,
    WriteBatch, WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

use super::LocalCache;
use crate::config::CacheConfig;
use crate::error::{Result, SyncError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Metadata stored alongside each cached snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub document_id: String,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Last write (seconds since epoch)
    pub updated_at: u64,
}

impl CacheMetadata {
    fn encode(&self) -> Result<Vec<u8>> {
        crate::protocol::encode(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        crate::protocol::decode(bytes)
    }
}

struct RocksInner {
    db: DB,
    sync_writes: bool,
}

impl RocksInner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SyncError::Cache(format!("Column family '{name}' not found")))
    }

    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(compressed) => Ok(Some(lz4_flex::decompress_size_prepended(&compressed)?)),
            None => Ok(None),
        }
    }

    fn store(&self, document_id: &str, snapshot: &[u8]) -> Result<CacheMetadata> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let meta = CacheMetadata {
            document_id: document_id.to_string(),
            snapshot_size: snapshot.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        // Snapshot and metadata land atomically.
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, document_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, document_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(meta)
    }

    fn metadata(&self, document_id: &str) -> Result<Option<CacheMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(CacheMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Durable [`LocalCache`] on RocksDB.
#[derive(Clone)]
pub struct RocksCache {
    inner: Arc<RocksInner>,
}

impl RocksCache {
    /// Open the cache at the configured path, creating it if missing.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(config)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened snapshot cache at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(RocksInner {
                db,
                sync_writes: config.sync_writes,
            }),
        })
    }

    fn cf_options(config: &CacheConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Metadata of the cached snapshot, if any.
    pub async fn metadata(&self, document_id: &str) -> Result<Option<CacheMetadata>> {
        let inner = self.inner.clone();
        let document_id = document_id.to_string();
        blocking(move || inner.metadata(&document_id)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Cache(format!("cache task failed: {e}")))?
}

#[async_trait]
impl LocalCache for RocksCache {
    async fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.clone();
        let document_id = document_id.to_string();
        blocking(move || inner.load(&document_id)).await
    }

    async fn store(&self, document_id: &str, snapshot: &[u8]) -> Result<()> {
        let inner = self.inner.clone();
        let document_id = document_id.to_string();
        let snapshot = snapshot.to_vec();
        let meta = blocking(move || inner.store(&document_id, &snapshot)).await?;
        log::debug!(
            "Cached snapshot for {} ({} → {} bytes)",
            meta.document_id,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}
