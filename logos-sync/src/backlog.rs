//! Reassembly of chunked snapshots from an unordered event stream.
//!
//! Descriptors and chunks arrive in any order, possibly duplicated, possibly
//! incomplete, from both live observation and paginated history. The
//! backlog keeps what might still complete and answers "what is the newest
//! complete snapshot that validates?".
//!
//! ```text
//!  descriptors (newest first)      chunks (by sequence number)
//!  ┌────────────┐                  ┌─────┬─────┬─────┬─────┐
//!  │ s3 ts=3000 │ ◄─── related ─── │ s3#0│ s2#0│ s3#1│ s2#1│
//!  │ s2 ts=2000 │                  └─────┴─────┴─────┴─────┘
//!  └────────────┘
//!        │ complete + valid
//!        ▼
//!  low-water mark = (3000, s3)  → everything at or before it is purged
//! ```
//!
//! A descriptor whose chunks are complete but whose payload fails the
//! validator is skipped without moving the mark, so a newer broken snapshot
//! never hides an older good one.

use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::protocol::{
    Chunk, EventId, ReassembledSnapshot, SnapshotDescriptor, DOCUMENT_CHUNK_EVENT,
    DOCUMENT_CREATE_EVENT,
};
use crate::transport::{RelationQuery, Transport};

/// Decides whether a reassembled snapshot is usable.
pub type SnapshotValidator = Arc<dyn Fn(&ReassembledSnapshot) -> bool + Send + Sync>;

/// Timestamp and event id of the most recently accepted descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowWaterMark {
    pub origin_server_ts: u64,
    pub event_id: EventId,
}

pub struct SnapshotBacklog {
    document_id: String,
    /// Sorted newest first by `origin_server_ts`.
    descriptors: Vec<SnapshotDescriptor>,
    /// Sorted by sequence number.
    chunks: Vec<Chunk>,
    low_water_mark: Option<LowWaterMark>,
    validator: Option<SnapshotValidator>,
}

impl SnapshotBacklog {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            descriptors: Vec::new(),
            chunks: Vec::new(),
            low_water_mark: None,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: SnapshotValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn low_water_mark(&self) -> Option<&LowWaterMark> {
        self.low_water_mark.as_ref()
    }

    pub fn pending_descriptors(&self) -> usize {
        self.descriptors.len()
    }

    pub fn pending_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty() && self.chunks.is_empty()
    }

    fn is_stale(&self, origin_server_ts: u64) -> bool {
        self.low_water_mark
            .as_ref()
            .is_some_and(|mark| origin_server_ts <= mark.origin_server_ts)
    }

    /// Track a descriptor. Returns whether it was kept.
    pub fn register_descriptor(&mut self, descriptor: SnapshotDescriptor) -> bool {
        if descriptor.document_id != self.document_id {
            return false;
        }
        if self.is_stale(descriptor.origin_server_ts) {
            log::debug!("Ignoring stale snapshot descriptor {}", descriptor.event_id);
            return false;
        }
        if descriptor.chunk_count == 0 {
            log::debug!("Ignoring empty snapshot descriptor {}", descriptor.event_id);
            return false;
        }
        if self.descriptors.iter().any(|d| d.event_id == descriptor.event_id) {
            return false;
        }

        let position = self.descriptors.partition_point(|d| {
            (d.origin_server_ts, d.event_id.as_str())
                > (descriptor.origin_server_ts, descriptor.event_id.as_str())
        });
        self.descriptors.insert(position, descriptor);
        true
    }

    /// Track a chunk. Returns whether it was kept.
    pub fn register_chunk(&mut self, chunk: Chunk) -> bool {
        if chunk.document_id != self.document_id {
            return false;
        }
        if self.is_stale(chunk.origin_server_ts) {
            return false;
        }
        if self
            .low_water_mark
            .as_ref()
            .is_some_and(|mark| mark.event_id == chunk.snapshot_event_id)
        {
            return false;
        }
        if self.chunks.iter().any(|c| {
            c.snapshot_event_id == chunk.snapshot_event_id
                && c.sequence_number == chunk.sequence_number
        }) {
            return false;
        }

        let position = self
            .chunks
            .partition_point(|c| c.sequence_number <= chunk.sequence_number);
        self.chunks.insert(position, chunk);
        true
    }

    /// Newest complete snapshot that passes the validator, if any.
    ///
    /// On success the low-water mark advances to that descriptor and every
    /// entry at or before it is purged.
    pub fn find_complete_snapshot(&mut self) -> Option<ReassembledSnapshot> {
        let mut accepted = None;

        for descriptor in &self.descriptors {
            let related: Vec<&Chunk> = self
                .chunks
                .iter()
                .filter(|c| {
                    c.snapshot_event_id == descriptor.event_id
                        && c.sequence_number < descriptor.chunk_count
                })
                .collect();
            if related.len() != descriptor.chunk_count as usize {
                continue;
            }

            let payload: Vec<u8> = related
                .iter()
                .flat_map(|c| c.payload.iter().copied())
                .collect();
            let snapshot = ReassembledSnapshot {
                descriptor: descriptor.clone(),
                payload,
            };

            if let Some(validator) = &self.validator {
                if !validator(&snapshot) {
                    log::warn!(
                        "Snapshot {} for {} failed validation, trying older ones",
                        descriptor.event_id,
                        self.document_id
                    );
                    continue;
                }
            }

            accepted = Some(snapshot);
            break;
        }

        let snapshot = accepted?;
        self.advance_low_water_mark(&snapshot.descriptor);
        Some(snapshot)
    }

    fn advance_low_water_mark(&mut self, descriptor: &SnapshotDescriptor) {
        let mark = LowWaterMark {
            origin_server_ts: descriptor.origin_server_ts,
            event_id: descriptor.event_id.clone(),
        };
        self.descriptors
            .retain(|d| d.origin_server_ts > mark.origin_server_ts);
        self.chunks.retain(|c| {
            c.origin_server_ts > mark.origin_server_ts && c.snapshot_event_id != mark.event_id
        });
        self.low_water_mark = Some(mark);
    }

    /// Walk snapshot history newest first until one snapshot reassembles
    /// and validates.
    ///
    /// Every candidate's related chunks are paged in and fed through the
    /// same registration logic as live events.
    pub async fn search_history(
        &mut self,
        transport: &dyn Transport,
        history_page_size: usize,
        chunk_page_size: usize,
    ) -> Result<ReassembledSnapshot> {
        let mut cursor = None;
        loop {
            let page = transport
                .read_events(DOCUMENT_CREATE_EVENT, cursor, history_page_size)
                .await?;

            for event in &page.events {
                let descriptor = match SnapshotDescriptor::from_event(event) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        log::debug!("Skipping malformed descriptor {}: {e}", event.event_id);
                        continue;
                    }
                };
                if descriptor.document_id != self.document_id {
                    continue;
                }
                let event_id = descriptor.event_id.clone();
                self.register_descriptor(descriptor);

                if let Some(snapshot) = self.load_related_chunks(transport, &event_id, chunk_page_size).await? {
                    return Ok(snapshot);
                }
            }

            cursor = match page.next_cursor {
                Some(next) => Some(next),
                None => {
                    return Err(SyncError::NotFound(format!(
                        "no complete snapshot in history for {}",
                        self.document_id
                    )))
                }
            };
        }
    }

    async fn load_related_chunks(
        &mut self,
        transport: &dyn Transport,
        event_id: &str,
        chunk_page_size: usize,
    ) -> Result<Option<ReassembledSnapshot>> {
        let mut cursor = None;
        loop {
            let page = transport
                .read_related_events(
                    event_id,
                    RelationQuery {
                        event_type: DOCUMENT_CHUNK_EVENT.to_string(),
                        cursor,
                        limit: chunk_page_size,
                    },
                )
                .await?;

            for event in &page.events {
                match Chunk::from_event(event) {
                    Ok(chunk) => {
                        self.register_chunk(chunk);
                    }
                    Err(e) => log::debug!("Skipping malformed chunk {}: {e}", event.event_id),
                }
            }

            if let Some(snapshot) = self.find_complete_snapshot() {
                return Ok(Some(snapshot));
            }

            cursor = match page.next_cursor {
                Some(next) => Some(next),
                None => return Ok(None),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::protocol::{encode, ChunkContent, DescriptorContent};
    use crate::transport::MemoryHub;

    const DOC: &str = "wb-1";

    fn descriptor(event_id: &str, chunk_count: u32, ts: u64) -> SnapshotDescriptor {
        SnapshotDescriptor {
            event_id: event_id.into(),
            document_id: DOC.into(),
            origin_server_ts: ts,
            chunk_count,
        }
    }

    fn chunk(snapshot: &str, seq: u32, payload: &[u8], ts: u64) -> Chunk {
        Chunk {
            document_id: DOC.into(),
            snapshot_event_id: snapshot.into(),
            sequence_number: seq,
            payload: payload.to_vec(),
            origin_server_ts: ts,
        }
    }

    #[test]
    fn test_single_chunk_snapshot() {
        let mut backlog = SnapshotBacklog::new(DOC);
        backlog.register_descriptor(descriptor("s1", 1, 1000));
        backlog.register_chunk(chunk("s1", 0, &[1], 1001));

        let snapshot = backlog.find_complete_snapshot().unwrap();
        assert_eq!(snapshot.descriptor.event_id, "s1");
        assert_eq!(snapshot.payload, vec![1]);
        assert!(backlog.is_empty());
        assert_eq!(backlog.low_water_mark().unwrap().origin_server_ts, 1000);
    }

    #[test]
    fn test_any_permutation_with_duplicates() {
        let parts: Vec<Vec<u8>> = vec![vec![1, 2], vec![3], vec![4, 5, 6], vec![7]];
        let expected: Vec<u8> = parts.concat();
        let orders: [[u32; 6]; 3] = [
            [0, 1, 2, 3, 0, 2],
            [3, 3, 2, 1, 1, 0],
            [2, 0, 3, 0, 1, 3],
        ];

        for order in orders {
            let mut backlog = SnapshotBacklog::new(DOC);
            backlog.register_descriptor(descriptor("s1", 4, 1000));
            for (i, seq) in order.iter().enumerate() {
                backlog.register_chunk(chunk("s1", *seq, &parts[*seq as usize], 1001 + i as u64));
            }

            let snapshot = backlog.find_complete_snapshot().unwrap();
            assert_eq!(snapshot.payload, expected);
            assert!(backlog.find_complete_snapshot().is_none());
        }
    }

    #[test]
    fn test_duplicate_chunk_is_not_counted_twice() {
        let mut backlog = SnapshotBacklog::new(DOC);
        backlog.register_descriptor(descriptor("s1", 3, 1000));
        assert!(backlog.register_chunk(chunk("s1", 0, &[1], 1001)));
        assert!(backlog.register_chunk(chunk("s1", 1, &[2], 1002)));
        assert!(!backlog.register_chunk(chunk("s1", 1, &[2], 1003)));

        assert_eq!(backlog.pending_chunks(), 2);
        assert!(backlog.find_complete_snapshot().is_none());
    }

    #[test]
    fn test_incomplete_snapshot_returns_nothing() {
        let mut backlog = SnapshotBacklog::new(DOC);
        backlog.register_descriptor(descriptor("s1", 3, 1000));
        backlog.register_chunk(chunk("s1", 0, &[1], 1001));
        backlog.register_chunk(chunk("s1", 2, &[3], 1002));

        assert!(backlog.find_complete_snapshot().is_none());
        assert_eq!(backlog.pending_descriptors(), 1);
    }

    #[test]
    fn test_out_of_range_sequence_is_discarded() {
        let mut backlog = SnapshotBacklog::new(DOC);
        backlog.register_descriptor(descriptor("s1", 2, 1000));
        backlog.register_chunk(chunk("s1", 0, &[1], 1001));
        backlog.register_chunk(chunk("s1", 5, &[9], 1002));
        assert!(backlog.find_complete_snapshot().is_none());

        backlog.register_chunk(chunk("s1", 1, &[2], 1003));
        assert_eq!(backlog.find_complete_snapshot().unwrap().payload, vec![1, 2]);
    }

    #[test]
    fn test_other_documents_are_ignored() {
        let mut backlog = SnapshotBacklog::new(DOC);
        let mut foreign = descriptor("s1", 1, 1000);
        foreign.document_id = "wb-2".into();
        assert!(!backlog.register_descriptor(foreign));

        let mut foreign_chunk = chunk("s1", 0, &[1], 1001);
        foreign_chunk.document_id = "wb-2".into();
        assert!(!backlog.register_chunk(foreign_chunk));
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_newest_complete_snapshot_wins() {
        let mut backlog = SnapshotBacklog::new(DOC);
        backlog.register_descriptor(descriptor("old", 1, 1000));
        backlog.register_descriptor(descriptor("new", 1, 2000));
        backlog.register_chunk(chunk("old", 0, &[1], 1001));
        backlog.register_chunk(chunk("new", 0, &[2], 2001));

        let snapshot = backlog.find_complete_snapshot().unwrap();
        assert_eq!(snapshot.descriptor.event_id, "new");
        // The older snapshot was purged with the mark.
        assert!(backlog.find_complete_snapshot().is_none());
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_low_water_mark_blocks_older_snapshots() {
        let mut backlog = SnapshotBacklog::new(DOC);
        backlog.register_descriptor(descriptor("s1000", 1, 1000));
        backlog.register_chunk(chunk("s1000", 0, &[1], 1000));
        assert!(backlog.find_complete_snapshot().is_some());

        assert!(!backlog.register_descriptor(descriptor("s500", 1, 500)));
        assert!(!backlog.register_chunk(chunk("s500", 0, &[2], 500)));
        assert!(backlog.find_complete_snapshot().is_none());

        // Equal timestamps are also stale.
        assert!(!backlog.register_descriptor(descriptor("s1000b", 1, 1000)));
        // Late chunks of the accepted snapshot are dropped.
        assert!(!backlog.register_chunk(chunk("s1000", 0, &[1], 1005)));
    }

    #[test]
    fn test_invalid_newer_snapshot_does_not_mask_older_valid_one() {
        let validator: SnapshotValidator = Arc::new(|s: &ReassembledSnapshot| s.payload != vec![0xBA, 0xD]);
        let mut backlog = SnapshotBacklog::new(DOC).with_validator(validator);

        backlog.register_descriptor(descriptor("good", 1, 1000));
        backlog.register_chunk(chunk("good", 0, &[1], 1001));
        backlog.register_descriptor(descriptor("broken", 1, 2000));
        backlog.register_chunk(chunk("broken", 0, &[0xBA, 0xD], 2001));

        let snapshot = backlog.find_complete_snapshot().unwrap();
        assert_eq!(snapshot.descriptor.event_id, "good");
        assert_eq!(backlog.low_water_mark().unwrap().event_id, "good");
        // The broken one is newer than the mark, so it is still pending.
        assert_eq!(backlog.pending_descriptors(), 1);
    }

    #[test]
    fn test_invalid_snapshot_is_revalidated_on_each_evaluation() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let validator: SnapshotValidator = Arc::new(move |_: &ReassembledSnapshot| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            false
        });
        let mut backlog = SnapshotBacklog::new(DOC).with_validator(validator);
        backlog.register_descriptor(descriptor("s1", 1, 1000));
        backlog.register_chunk(chunk("s1", 0, &[1], 1001));

        assert!(backlog.find_complete_snapshot().is_none());
        assert!(backlog.find_complete_snapshot().is_none());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(backlog.low_water_mark().is_none());
    }

    #[test]
    fn test_zero_chunk_descriptor_rejected() {
        let mut backlog = SnapshotBacklog::new(DOC);
        assert!(!backlog.register_descriptor(descriptor("s0", 0, 1000)));
    }

    async fn publish(hub: &MemoryHub, ts: u64, parts: &[&[u8]]) -> EventId {
        let descriptor = encode(&DescriptorContent {
            document_id: DOC.into(),
            chunk_count: parts.len() as u32,
        })
        .unwrap();
        let event_id = hub
            .inject_event(DOCUMENT_CREATE_EVENT, "@alice", ts, None, descriptor)
            .await;
        for (seq, data) in parts.iter().enumerate() {
            let content = encode(&ChunkContent {
                document_id: DOC.into(),
                sequence_number: seq as u32,
                data: data.to_vec(),
            })
            .unwrap();
            hub.inject_event(DOCUMENT_CHUNK_EVENT, "@alice", ts + 1, Some(event_id.clone()), content)
                .await;
        }
        event_id
    }

    #[tokio::test]
    async fn test_search_history_finds_newest_valid_snapshot() {
        let hub = MemoryHub::new(Clock::starting_at(0));
        let transport = hub.connect("@bob");

        publish(&hub, 1000, &[&[1], &[2], &[3]]).await;
        let valid = publish(&hub, 2000, &[&[4], &[5], &[6]]).await;
        publish(&hub, 3000, &[&[0xBA], &[0xD]]).await;

        let validator: SnapshotValidator = Arc::new(|s: &ReassembledSnapshot| s.payload[0] != 0xBA);
        let mut backlog = SnapshotBacklog::new(DOC).with_validator(validator);

        let snapshot = backlog.search_history(&transport, 1, 2).await.unwrap();
        assert_eq!(snapshot.descriptor.event_id, valid);
        assert_eq!(snapshot.payload, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_search_history_not_found() {
        let hub = MemoryHub::new(Clock::starting_at(0));
        let transport = hub.connect("@bob");

        // Descriptor announces 2 chunks, only 1 was ever delivered.
        publish(&hub, 1000, &[&[1]]).await;
        let descriptor = encode(&DescriptorContent {
            document_id: DOC.into(),
            chunk_count: 2,
        })
        .unwrap();
        hub.inject_event(DOCUMENT_CREATE_EVENT, "@alice", 2000, None, descriptor)
            .await;

        let mut backlog = SnapshotBacklog::new(DOC).with_validator(Arc::new(|_: &ReassembledSnapshot| false));
        let result = backlog.search_history(&transport, 5, 5).await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_search_history_propagates_transport_errors() {
        let hub = MemoryHub::new(Clock::starting_at(0));
        let transport = hub.connect("@bob");
        transport.set_failing(true);

        let mut backlog = SnapshotBacklog::new(DOC);
        let result = backlog.search_history(&transport, 5, 5).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }
}
