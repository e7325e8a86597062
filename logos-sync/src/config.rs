//! Tunables for the sync engine, the session manager and the RocksDB cache.
//!
//! Durations are stored in milliseconds so the structs serialize cleanly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest chunk payload. Keeps each chunk event below a 64 KiB cap once the
/// transport adds its own envelope.
pub const DEFAULT_CHUNK_SIZE: usize = 60_000;

/// Default session lifetime: 4 hours.
pub const DEFAULT_SESSION_TTL_MS: u64 = 4 * 60 * 60 * 1000;

/// Document sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Snapshot publish throttle window (trailing edge).
    pub snapshot_interval_ms: u64,
    /// Maximum bytes per snapshot chunk.
    pub chunk_size: usize,
    /// Descriptors fetched per history page.
    pub history_page_size: usize,
    /// Chunks fetched per related-events page.
    pub chunk_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 5_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            history_page_size: 20,
            chunk_page_size: 50,
        }
    }
}

impl SyncConfig {
    /// Small pages and chunks so tests exercise pagination and reassembly.
    pub fn for_testing() -> Self {
        Self {
            snapshot_interval_ms: 5_000,
            chunk_size: 64,
            history_page_size: 2,
            chunk_page_size: 2,
        }
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

/// Session/presence manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lifetime of an advertised session record.
    pub session_ttl_ms: u64,
    /// Delay after which the deferred "removed" record fires unless renewed.
    pub lease_grace_ms: u64,
    /// Refresh and renewal happen at this fraction of the respective window.
    pub renew_factor: f64,
    /// Preferred media foci advertised with the session.
    pub focus_preferences: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: DEFAULT_SESSION_TTL_MS,
            lease_grace_ms: 10_000,
            renew_factor: 0.75,
            focus_preferences: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_millis(self.lease_grace_ms)
    }

    /// Interval of the record refresh timer (`ttl * renew_factor`).
    pub fn refresh_interval(&self) -> Duration {
        scaled(self.session_ttl_ms, self.renew_factor)
    }

    /// Interval of the lease renewal timer (`grace * renew_factor`).
    pub fn lease_renew_interval(&self) -> Duration {
        scaled(self.lease_grace_ms, self.renew_factor)
    }
}

fn scaled(ms: u64, factor: f64) -> Duration {
    let scaled = (ms as f64 * factor).round() as u64;
    Duration::from_millis(scaled.max(1))
}

/// RocksDB-backed local cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_cache"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl CacheConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}
