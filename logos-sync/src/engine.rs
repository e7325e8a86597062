//! Document sync engine.
//!
//! Bridges one replicated document to the transport:
//!
//! ```text
//!                 ┌──────────────── DocumentSyncEngine ────────────────┐
//!  local edits ──►│ run_local_changes ──► append UPDATE, mark dirty,   │
//!                 │                       write cache, poke throttle   │
//!  UPDATE events ►│ run_remote_diffs  ──► apply_change (validated)     │
//!  CREATE/CHUNK ─►│ run_snapshots     ──► history search, then live    │
//!                 │                       backlog ──► merge_from       │
//!  LocalCache ───►│ run_cache_load    ──► merge_from (validated)       │
//!                 │ run_throttle      ──► persist(false) while dirty   │
//!                 │ run_statistics    ──► SyncStatistics watch         │
//!                 └────────────────────────────────────────────────────┘
//! ```
//!
//! Each input has exactly one consumer task and all of them select on one
//! [`CancellationToken`]. Snapshot publication is single-flight: a publish
//! that finds another one running is coalesced into it, and the throttle
//! keeps ticking until the outstanding flag is cleared.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backlog::{SnapshotBacklog, SnapshotValidator};
use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::document::{ContentValidator, DocumentContent, ReplicatedDocument};
use crate::error::{Result, SyncError};
use crate::protocol::{
    compress_snapshot, decode, decompress_snapshot, encode, split_into_chunks, Chunk,
    ChunkContent, DescriptorContent, EventId, ReassembledSnapshot, SnapshotDescriptor,
    TimelineEvent, UpdateContent, DOCUMENT_CHUNK_EVENT, DOCUMENT_CREATE_EVENT,
    DOCUMENT_UPDATE_EVENT,
};
use crate::stats::{StatsTracker, StatusFlags, SyncStatistics};
use crate::transport::Transport;

/// Own descriptor ids remembered so live echoes are not merged back.
const OWN_SNAPSHOT_HISTORY: usize = 16;

/// Validators applied to incoming state.
#[derive(Clone, Default)]
pub struct Validators {
    /// Checked against the content that would result from a remote diff.
    pub content: Option<ContentValidator>,
    /// Checked against the content of a snapshot on its own (cache or remote).
    pub snapshot: Option<ContentValidator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadSource {
    Cache,
    Remote,
}

#[derive(Default)]
struct LoadProgress {
    cache_absent: bool,
    remote_absent: bool,
    resolved: bool,
}

/// Clears the single-flight flag even if the publish future is dropped.
struct PublishGuard<'a>(&'a AtomicBool);

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DocumentSyncEngine {
    document_id: String,
    document: Arc<dyn ReplicatedDocument>,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn LocalCache>,
    validators: Validators,
    config: SyncConfig,
    stats: StatsTracker,
    loading_tx: watch::Sender<bool>,
    load_progress: Mutex<LoadProgress>,
    /// Set while a snapshot publish is in flight.
    publishing: AtomicBool,
    /// Bumped on every local change; a publish only clears the outstanding
    /// flag if no change happened since it serialized the document.
    generation: AtomicU64,
    publish_trigger: Notify,
    /// Recent descriptors this engine published, oldest first.
    own_snapshots: Mutex<VecDeque<EventId>>,
    cancel: CancellationToken,
}

impl DocumentSyncEngine {
    /// Start syncing `document` as `document_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        document: Arc<dyn ReplicatedDocument>,
        transport: Arc<dyn Transport>,
        cache: Arc<dyn LocalCache>,
        document_id: impl Into<String>,
        validators: Validators,
        config: SyncConfig,
    ) -> SyncHandle {
        let (loading_tx, _) = watch::channel(true);
        let stats = StatsTracker::new(document.statistics());
        let engine = Arc::new(Self {
            document_id: document_id.into(),
            document,
            transport,
            cache,
            validators,
            config,
            stats,
            loading_tx,
            load_progress: Mutex::new(LoadProgress::default()),
            publishing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            publish_trigger: Notify::new(),
            own_snapshots: Mutex::new(VecDeque::new()),
            cancel: CancellationToken::new(),
        });

        // Subscribe before spawning so nothing published in between is lost.
        let local_diffs = engine.document.observe_publish();
        let changes = engine.document.observe_changes();
        let remote_diffs = engine.transport.observe_events(DOCUMENT_UPDATE_EVENT);
        let descriptors = engine.transport.observe_events(DOCUMENT_CREATE_EVENT);
        let chunks = engine.transport.observe_events(DOCUMENT_CHUNK_EVENT);

        log::info!("Starting sync engine for {}", engine.document_id);

        let tasks = vec![
            tokio::spawn(engine.clone().run_local_changes(local_diffs)),
            tokio::spawn(engine.clone().run_remote_diffs(remote_diffs)),
            tokio::spawn(engine.clone().run_snapshots(descriptors, chunks)),
            tokio::spawn(engine.clone().run_cache_load()),
            tokio::spawn(engine.clone().run_statistics(changes)),
            tokio::spawn(engine.clone().run_throttle()),
        ];

        SyncHandle {
            engine,
            tasks: Mutex::new(tasks),
        }
    }

    // ─── Local side ─────────────────────────────────────────────

    async fn run_local_changes(self: Arc<Self>, mut diffs: BoxStream<'static, Vec<u8>>) {
        loop {
            let diff = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = diffs.next() => match next {
                    Some(diff) => diff,
                    None => break,
                },
            };

            if let Err(e) = self.send_diff(diff).await {
                log::warn!("Failed to send diff for {}: {e}", self.document_id);
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.stats.set_outstanding(true);
            self.publish_trigger.notify_one();
            self.write_cache().await;
        }
    }

    async fn send_diff(&self, diff: Vec<u8>) -> Result<()> {
        let content = encode(&UpdateContent {
            document_id: self.document_id.clone(),
            data: diff,
        })?;
        self.transport
            .append_event(DOCUMENT_UPDATE_EVENT, content, None)
            .await?;
        Ok(())
    }

    async fn write_cache(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let state = self.document.store();
        if let Err(e) = self.cache.store(&self.document_id, &state).await {
            log::warn!("Failed to cache {}: {e}", self.document_id);
        }
    }

    // ─── Remote diffs ───────────────────────────────────────────

    async fn run_remote_diffs(self: Arc<Self>, mut events: BoxStream<'static, TimelineEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_remote_diff(&event);
        }
    }

    fn handle_remote_diff(&self, event: &TimelineEvent) {
        let update: UpdateContent = match decode(&event.content) {
            Ok(update) => update,
            Err(e) => {
                log::debug!("Ignoring malformed diff {}: {e}", event.event_id);
                return;
            }
        };
        if update.document_id != self.document_id {
            return;
        }
        if let Err(e) = self
            .document
            .apply_change(&update.data, self.validators.content.as_ref())
        {
            log::warn!(
                "Discarding diff {} from {} for {}: {e}",
                event.event_id,
                event.sender,
                self.document_id
            );
        }
    }

    // ─── Snapshots ──────────────────────────────────────────────

    async fn run_snapshots(
        self: Arc<Self>,
        mut descriptors: BoxStream<'static, TimelineEvent>,
        mut chunks: BoxStream<'static, TimelineEvent>,
    ) {
        let mut backlog =
            SnapshotBacklog::new(self.document_id.clone()).with_validator(self.snapshot_validator());

        let history = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = backlog.search_history(
                self.transport.as_ref(),
                self.config.history_page_size,
                self.config.chunk_page_size,
            ) => result,
        };
        match history {
            Ok(snapshot) => {
                if !self.apply_remote_snapshot(snapshot).await {
                    self.resolve_load(LoadSource::Remote, false).await;
                }
            }
            Err(SyncError::NotFound(_)) => {
                log::debug!("No snapshot in history for {}", self.document_id);
                self.resolve_load(LoadSource::Remote, false).await;
            }
            Err(e) => {
                log::warn!("History search failed for {}: {e}", self.document_id);
                if !self.cancel.is_cancelled() {
                    self.stats.set_load_failed(true);
                }
                self.resolve_load(LoadSource::Remote, false).await;
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = descriptors.next() => match SnapshotDescriptor::from_event(&event) {
                    Ok(descriptor) => {
                        backlog.register_descriptor(descriptor);
                    }
                    Err(e) => log::debug!("Ignoring descriptor {}: {e}", event.event_id),
                },
                Some(event) = chunks.next() => match Chunk::from_event(&event) {
                    Ok(chunk) => {
                        backlog.register_chunk(chunk);
                    }
                    Err(e) => log::debug!("Ignoring chunk {}: {e}", event.event_id),
                },
                else => break,
            }

            if let Some(snapshot) = backlog.find_complete_snapshot() {
                self.apply_remote_snapshot(snapshot).await;
            }
        }
    }

    /// Decompress, then check the snapshot on a scratch replica.
    fn snapshot_validator(&self) -> SnapshotValidator {
        let document = self.document.clone();
        let validator = self.validators.snapshot.clone();
        Arc::new(move |snapshot: &ReassembledSnapshot| {
            match decompress_snapshot(&snapshot.payload) {
                Ok(state) => match document.check_snapshot(&state, validator.as_ref()) {
                    Ok(()) => true,
                    Err(e) => {
                        log::debug!("Snapshot {} rejected: {e}", snapshot.descriptor.event_id);
                        false
                    }
                },
                Err(e) => {
                    log::debug!("Snapshot {} undecodable: {e}", snapshot.descriptor.event_id);
                    false
                }
            }
        })
    }

    /// Merge a reassembled remote snapshot. Returns whether the document now
    /// reflects it.
    async fn apply_remote_snapshot(&self, snapshot: ReassembledSnapshot) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let event_id = &snapshot.descriptor.event_id;
        {
            let mut own = self.own_snapshots.lock().await;
            if let Some(pos) = own.iter().position(|id| id == event_id) {
                // The backlog never yields the same snapshot twice.
                own.remove(pos);
                log::debug!("Skipping own snapshot {event_id}");
                return true;
            }
        }

        let merged = decompress_snapshot(&snapshot.payload).and_then(|state| {
            self.document
                .merge_from(&state, self.validators.snapshot.as_ref())
        });
        match merged {
            Ok(()) => {
                log::info!(
                    "Merged snapshot {event_id} ({} chunks) into {}",
                    snapshot.descriptor.chunk_count,
                    self.document_id
                );
                self.stats.record_received();
                self.resolve_load(LoadSource::Remote, true).await;
                self.write_cache().await;
                true
            }
            Err(e) => {
                log::warn!("Failed to merge snapshot {event_id}: {e}");
                false
            }
        }
    }

    // ─── Initial load ───────────────────────────────────────────

    async fn run_cache_load(self: Arc<Self>) {
        let loaded = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.cache.load(&self.document_id) => result,
        };

        let found = match loaded {
            Ok(Some(state)) => {
                match self
                    .document
                    .merge_from(&state, self.validators.snapshot.as_ref())
                {
                    Ok(()) => {
                        log::info!("Restored {} from local cache", self.document_id);
                        true
                    }
                    Err(e) => {
                        log::warn!("Ignoring cached state of {}: {e}", self.document_id);
                        false
                    }
                }
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("Cache read failed for {}: {e}", self.document_id);
                false
            }
        };
        self.resolve_load(LoadSource::Cache, found).await;
    }

    async fn resolve_load(&self, source: LoadSource, found: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut progress = self.load_progress.lock().await;

        if found {
            self.stats.set_load_failed(false);
            if !progress.resolved {
                progress.resolved = true;
                self.loading_tx.send_replace(false);
                log::info!("{} loaded from {source:?}", self.document_id);
            }
            return;
        }

        match source {
            LoadSource::Cache => progress.cache_absent = true,
            LoadSource::Remote => progress.remote_absent = true,
        }
        if !progress.resolved && progress.cache_absent && progress.remote_absent {
            progress.resolved = true;
            self.stats.set_load_failed(true);
            self.loading_tx.send_replace(false);
            log::warn!("No stored state found for {}", self.document_id);
        }
    }

    // ─── Statistics ─────────────────────────────────────────────

    async fn run_statistics(self: Arc<Self>, mut changes: watch::Receiver<DocumentContent>) {
        self.stats.update_document(self.document.statistics());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            self.stats.update_document(self.document.statistics());
        }
    }

    // ─── Publication ────────────────────────────────────────────

    /// Trailing-edge throttle: the first change after a quiet period opens a
    /// window; the publish runs when it closes. While the outstanding flag
    /// stays set (failed or coalesced publish, edits during a publish) the
    /// next window opens right away.
    async fn run_throttle(self: Arc<Self>) {
        let window = self.config.snapshot_interval();
        loop {
            if !self.stats.current().snapshot_outstanding {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.publish_trigger.notified() => {}
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(window) => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.persist(false) => {}
            }
        }
    }

    async fn persist(&self, force: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        if !force && !self.stats.current().snapshot_outstanding {
            log::debug!("Nothing outstanding for {}", self.document_id);
            return;
        }
        if self
            .publishing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Publish of {} already running, coalescing", self.document_id);
            return;
        }
        let _guard = PublishGuard(&self.publishing);

        let result = self.publish_snapshot().await;
        if self.cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(generation) => {
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.stats.set_outstanding(false);
                }
                self.stats.record_sent();
                self.stats.set_save_failed(false);
            }
            Err(e) => {
                log::warn!("Snapshot publish failed for {}: {e}", self.document_id);
                self.stats.set_save_failed(true);
            }
        }
    }

    /// Publish the descriptor, then each chunk. Returns the change
    /// generation the snapshot covers.
    async fn publish_snapshot(&self) -> Result<u64> {
        let generation = self.generation.load(Ordering::SeqCst);
        let state = self.document.store();
        let payload = compress_snapshot(&state);
        let parts = split_into_chunks(&payload, self.config.chunk_size);
        let chunk_count = parts.len();

        let descriptor = encode(&DescriptorContent {
            document_id: self.document_id.clone(),
            chunk_count: chunk_count as u32,
        })?;
        let event_id = self
            .transport
            .append_event(DOCUMENT_CREATE_EVENT, descriptor, None)
            .await?;
        {
            let mut own = self.own_snapshots.lock().await;
            if own.len() == OWN_SNAPSHOT_HISTORY {
                own.pop_front();
            }
            own.push_back(event_id.clone());
        }

        for (sequence_number, data) in parts.into_iter().enumerate() {
            let content = encode(&ChunkContent {
                document_id: self.document_id.clone(),
                sequence_number: sequence_number as u32,
                data,
            })?;
            if let Err(e) = self
                .transport
                .append_event(DOCUMENT_CHUNK_EVENT, content, Some(event_id.clone()))
                .await
            {
                log::warn!("Chunk {sequence_number}/{chunk_count} of {event_id} failed: {e}");
            }
        }

        log::info!(
            "Published snapshot {event_id} for {} ({} bytes, {chunk_count} chunks)",
            self.document_id,
            state.len()
        );
        Ok(generation)
    }
}

/// Owner-side handle of a running [`DocumentSyncEngine`].
///
/// Dropping the handle cancels the engine; [`SyncHandle::destroy`] also
/// waits for its tasks to wind down.
pub struct SyncHandle {
    engine: Arc<DocumentSyncEngine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncHandle {
    pub fn document_id(&self) -> &str {
        &self.engine.document_id
    }

    /// `true` until the initial load resolved.
    pub fn observe_is_loading(&self) -> watch::Receiver<bool> {
        self.engine.loading_tx.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        *self.engine.loading_tx.borrow()
    }

    pub fn observe_statistics(&self) -> watch::Receiver<SyncStatistics> {
        self.engine.stats.subscribe()
    }

    pub fn statistics(&self) -> SyncStatistics {
        self.engine.stats.current()
    }

    pub fn observe_status(&self) -> watch::Receiver<StatusFlags> {
        self.engine.stats.subscribe_flags()
    }

    pub fn status(&self) -> StatusFlags {
        self.engine.stats.flags()
    }

    /// Publish a snapshot now.
    ///
    /// Without `force` this only publishes when local changes are
    /// outstanding. Returns once the attempt finished, or right away when it
    /// was skipped or coalesced into a publish already running.
    pub async fn persist(&self, force: bool) {
        self.engine.persist(force).await;
    }

    /// Stop every task and subscription. Safe to call more than once.
    pub async fn destroy(&self) {
        if !self.engine.cancel.is_cancelled() {
            log::info!("Stopping sync engine for {}", self.engine.document_id);
            self.engine.cancel.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Sync task ended abnormally: {e}");
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.engine.cancel.is_cancelled()
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.engine.cancel.cancel();
    }
}
