//! # logos-sync: Document sync & presence over a lossy broadcast transport
//!
//! Keeps a replicated whiteboard document consistent across clients that
//! share nothing but an eventually-consistent event timeline and keyed
//! broadcast records. There is no server-side merge, no reliable peer
//! channel and event payloads are size-capped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  diffs / snapshots  ┌──────────────────┐
//! │ DocumentSync     │ ◄─────────────────► │ Transport        │
//! │ Engine           │                     │ (timeline +      │
//! └──┬──────────┬────┘                     │  records +       │
//!    │          │                          │  deferred)       │
//!    ▼          ▼                          └────────▲─────────┘
//! ┌───────┐ ┌────────────┐                          │ session records
//! │ Yrs   │ │ LocalCache │                 ┌────────┴─────────┐
//! │ Doc   │ │ (RocksDB)  │                 │ SessionManager   │
//! └───────┘ └────────────┘                 │ + DisconnectLease│
//!    ▲                                     └──────────────────┘
//!    │ reassembled snapshots
//! ┌──┴───────────────┐
//! │ SnapshotBacklog  │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: transport boundary and the in-process [`MemoryHub`]
//! - [`document`]: replicated document boundary and [`YrsDocument`]
//! - [`cache`]: local snapshot cache (memory and RocksDB)
//! - [`protocol`]: event contents, bincode codec, snapshot chunking
//! - [`backlog`]: chunked snapshot reassembly
//! - [`engine`]: document sync engine
//! - [`session`]: presence advertisement and disconnect leases
//!
//! ## Wire budget
//!
//! | Item | Value |
//! |------|-------|
//! | Chunk payload | ≤ 60 000 bytes |
//! | Snapshot publish window | 5 s |
//! | Session TTL / refresh | 4 h / 3 h |
//! | Disconnect grace / renew | 10 s / 7.5 s |

pub mod backlog;
pub mod cache;
pub mod clock;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod transport;

// Re-exports for convenience
pub use backlog::{LowWaterMark, SnapshotBacklog, SnapshotValidator};
pub use cache::{CacheMetadata, LocalCache, MemoryCache, RocksCache};
pub use clock::Clock;
pub use config::{CacheConfig, SessionConfig, SyncConfig};
pub use document::{
    ContentValidator, DocumentContent, DocumentStatistics, ReplicatedDocument, YrsDocument,
};
pub use engine::{DocumentSyncEngine, SyncHandle, Validators};
pub use error::{Result, SyncError};
pub use protocol::{
    Chunk, ReassembledSnapshot, SessionRecord, SnapshotDescriptor, StateRecord, TimelineEvent,
};
pub use session::{DisconnectLease, SessionEvent, SessionManager, SessionState};
pub use stats::{StatusFlags, SyncStatistics};
pub use transport::{
    EventPage, LeaseToken, MemoryHub, MemoryTransport, RelationQuery, Transport, TransportStats,
};
