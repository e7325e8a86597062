//! Wire model for snapshot publication, diff exchange and presence records.
//!
//! Contents travel through the transport as opaque byte vectors, encoded
//! with bincode (standard config):
//! ```text
//! DOCUMENT_CREATE_EVENT  ── DescriptorContent { document_id, chunk_count }
//!        ▲ relates_to
//! DOCUMENT_CHUNK_EVENT   ── ChunkContent { document_id, sequence_number, data }
//! DOCUMENT_UPDATE_EVENT  ── UpdateContent { document_id, data }
//! SESSION_RECORD[key]    ── SessionContent | <empty> (removed)
//! ```
//!
//! Snapshots are LZ4-compressed before chunking so a typical whiteboard
//! fits in a single chunk.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub type EventId = String;

/// Announces a snapshot and the number of chunks that make it up.
pub const DOCUMENT_CREATE_EVENT: &str = "net.logos.document.create";
/// One fragment of a snapshot, related to its create event.
pub const DOCUMENT_CHUNK_EVENT: &str = "net.logos.document.chunk";
/// One incremental CRDT diff.
pub const DOCUMENT_UPDATE_EVENT: &str = "net.logos.document.update";
/// Presence record, keyed by session id.
pub const SESSION_RECORD: &str = "net.logos.document.sessions";

// ───────────────────────────────────────────────────────────────────
// Transport envelopes
// ───────────────────────────────────────────────────────────────────

/// An event appended to the ordered timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub sender: String,
    pub origin_server_ts: u64,
    /// Event this one refers to (chunks point at their descriptor).
    pub relates_to: Option<EventId>,
    pub content: Vec<u8>,
}

/// The latest value of a keyed broadcast record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub record_type: String,
    pub key: String,
    pub sender: String,
    pub origin_server_ts: u64,
    /// Empty content means the record was removed.
    pub content: Vec<u8>,
}

impl StateRecord {
    pub fn is_removed(&self) -> bool {
        self.content.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Content payloads
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorContent {
    pub document_id: String,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkContent {
    pub document_id: String,
    pub sequence_number: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateContent {
    pub document_id: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContent {
    pub user_id: String,
    pub device_id: String,
    pub document_id: String,
    pub created_ts: u64,
    pub expires_ts: u64,
    pub focus_preferences: Vec<String>,
}

/// Encode a content payload.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| SyncError::Codec(e.to_string()))
}

/// Decode a content payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(value)
}

// ───────────────────────────────────────────────────────────────────
// Snapshot model
// ───────────────────────────────────────────────────────────────────

/// Announces a snapshot's existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub event_id: EventId,
    pub document_id: String,
    pub origin_server_ts: u64,
    pub chunk_count: u32,
}

impl SnapshotDescriptor {
    pub fn from_event(event: &TimelineEvent) -> Result<Self> {
        if event.event_type != DOCUMENT_CREATE_EVENT {
            return Err(SyncError::validation(format!(
                "expected {DOCUMENT_CREATE_EVENT}, got {}",
                event.event_type
            )));
        }
        let content: DescriptorContent = decode(&event.content)?;
        Ok(Self {
            event_id: event.event_id.clone(),
            document_id: content.document_id,
            origin_server_ts: event.origin_server_ts,
            chunk_count: content.chunk_count,
        })
    }
}

/// One fragment of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub document_id: String,
    pub snapshot_event_id: EventId,
    pub sequence_number: u32,
    pub payload: Vec<u8>,
    pub origin_server_ts: u64,
}

impl Chunk {
    pub fn from_event(event: &TimelineEvent) -> Result<Self> {
        if event.event_type != DOCUMENT_CHUNK_EVENT {
            return Err(SyncError::validation(format!(
                "expected {DOCUMENT_CHUNK_EVENT}, got {}",
                event.event_type
            )));
        }
        let snapshot_event_id = event
            .relates_to
            .clone()
            .ok_or_else(|| SyncError::validation("chunk without snapshot relation"))?;
        let content: ChunkContent = decode(&event.content)?;
        Ok(Self {
            document_id: content.document_id,
            snapshot_event_id,
            sequence_number: content.sequence_number,
            payload: content.data,
            origin_server_ts: event.origin_server_ts,
        })
    }
}

/// All chunks of one descriptor, concatenated in sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledSnapshot {
    pub descriptor: SnapshotDescriptor,
    pub payload: Vec<u8>,
}

/// Compress a serialized document for publication.
pub fn compress_snapshot(state: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(state)
}

/// Inverse of [`compress_snapshot`].
pub fn decompress_snapshot(payload: &[u8]) -> Result<Vec<u8>> {
    Ok(lz4_flex::decompress_size_prepended(payload)?)
}

/// Split a payload into chunks of at most `chunk_size` bytes.
///
/// Always yields at least one chunk, so an empty payload is still
/// announced with `chunk_count = 1`.
pub fn split_into_chunks(payload: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if payload.is_empty() {
        return vec![Vec::new()];
    }
    payload
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

// ───────────────────────────────────────────────────────────────────
// Session model
// ───────────────────────────────────────────────────────────────────

/// Deterministic session id for a `(user, device)` pair.
pub fn session_id_for(user_id: &str, device_id: &str) -> String {
    format!("_{user_id}_{device_id}")
}

/// Presence advertisement of one device on one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub document_id: String,
    pub created_ts: u64,
    pub expires_ts: u64,
    pub focus_preferences: Vec<String>,
}

impl SessionRecord {
    /// Build from a received record; the record key is the session id.
    pub fn from_content(session_id: &str, content: SessionContent) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: content.user_id,
            device_id: content.device_id,
            document_id: content.document_id,
            created_ts: content.created_ts,
            expires_ts: content.expires_ts,
            focus_preferences: content.focus_preferences,
        }
    }

    pub fn to_content(&self) -> SessionContent {
        SessionContent {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            document_id: self.document_id.clone(),
            created_ts: self.created_ts,
            expires_ts: self.expires_ts,
            focus_preferences: self.focus_preferences.clone(),
        }
    }

    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, relates_to: Option<&str>, content: Vec<u8>) -> TimelineEvent {
        TimelineEvent {
            event_id: "$ev".into(),
            event_type: event_type.into(),
            sender: "@alice".into(),
            origin_server_ts: 1000,
            relates_to: relates_to.map(String::from),
            content,
        }
    }

    #[test]
    fn test_descriptor_from_event() {
        let content = encode(&DescriptorContent {
            document_id: "wb-1".into(),
            chunk_count: 3,
        })
        .unwrap();
        let descriptor =
            SnapshotDescriptor::from_event(&event(DOCUMENT_CREATE_EVENT, None, content)).unwrap();

        assert_eq!(descriptor.event_id, "$ev");
        assert_eq!(descriptor.document_id, "wb-1");
        assert_eq!(descriptor.origin_server_ts, 1000);
        assert_eq!(descriptor.chunk_count, 3);
    }

    #[test]
    fn test_chunk_requires_relation() {
        let content = encode(&ChunkContent {
            document_id: "wb-1".into(),
            sequence_number: 0,
            data: vec![1, 2],
        })
        .unwrap();

        assert!(Chunk::from_event(&event(DOCUMENT_CHUNK_EVENT, None, content.clone())).is_err());

        let chunk = Chunk::from_event(&event(DOCUMENT_CHUNK_EVENT, Some("$s1"), content)).unwrap();
        assert_eq!(chunk.snapshot_event_id, "$s1");
        assert_eq!(chunk.payload, vec![1, 2]);
    }

    #[test]
    fn test_wrong_event_type_rejected() {
        let content = encode(&DescriptorContent {
            document_id: "wb-1".into(),
            chunk_count: 1,
        })
        .unwrap();
        let err = SnapshotDescriptor::from_event(&event(DOCUMENT_UPDATE_EVENT, None, content));
        assert!(matches!(err, Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = decode::<SessionContent>(&[0xFF, 0xFE, 0xFD]);
        assert!(matches!(err, Err(SyncError::Codec(_))));
    }

    #[test]
    fn test_split_into_chunks() {
        let payload: Vec<u8> = (0..10).collect();
        let chunks = split_into_chunks(&payload, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec![8, 9]);
        assert_eq!(chunks.concat(), payload);

        assert_eq!(split_into_chunks(&[], 4), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_snapshot_compression_shrinks_repetitive_state() {
        let state = b"rectangle;".repeat(500);
        let compressed = compress_snapshot(&state);
        assert!(compressed.len() < state.len() / 5);
        assert_eq!(decompress_snapshot(&compressed).unwrap(), state);
        assert!(decompress_snapshot(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_session_id_is_deterministic() {
        assert_eq!(session_id_for("U", "D"), "_U_D");
        assert_eq!(session_id_for("U", "D"), session_id_for("U", "D"));
    }

    #[test]
    fn test_session_record_validity() {
        let record = SessionRecord {
            session_id: "_U_D".into(),
            user_id: "U".into(),
            device_id: "D".into(),
            document_id: "wb-1".into(),
            created_ts: 0,
            expires_ts: 100,
            focus_preferences: vec![],
        };
        assert!(record.is_valid_at(99));
        assert!(!record.is_valid_at(100));

        let back = SessionRecord::from_content("_U_D", record.to_content());
        assert_eq!(back, record);
    }
}
