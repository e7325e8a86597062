//! Replicated document boundary and its yrs implementation.
//!
//! The sync engine treats the CRDT as opaque: it only needs to apply
//! diffs, merge snapshots, serialize state, and be told about local edits.
//! [`YrsDocument`] keeps whiteboard elements in one root map
//! (`element id → serialized element`).
//!
//! Validators see the *resulting* content. A diff or snapshot is first
//! applied to a scratch replica; only if the validator accepts the result
//! is it applied to the live document, so a rejected change never touches
//! visible state.

use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::error::{Result, SyncError};
use crate::transport::broadcast_stream;

/// Visible document content.
pub type DocumentContent = BTreeMap<String, String>;

/// Accepts or rejects a candidate document content.
pub type ContentValidator = Arc<dyn Fn(&DocumentContent) -> bool + Send + Sync>;

/// Name of the root map holding whiteboard elements.
pub const ROOT_MAP: &str = "elements";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentStatistics {
    /// Size of the full serialized CRDT state (including tombstones).
    pub document_size_in_bytes: usize,
    /// Size of the visible content as JSON.
    pub content_size_in_bytes: usize,
}

pub trait ReplicatedDocument: Send + Sync + 'static {
    /// Apply a remote diff. Rejected diffs leave the document unchanged.
    fn apply_change(&self, diff: &[u8], validator: Option<&ContentValidator>) -> Result<()>;

    /// Check that a serialized snapshot decodes and passes `validator`
    /// on its own, without touching this document.
    fn check_snapshot(&self, snapshot: &[u8], validator: Option<&ContentValidator>) -> Result<()>;

    /// Merge a full snapshot into this document.
    fn merge_from(&self, snapshot: &[u8], validator: Option<&ContentValidator>) -> Result<()>;

    /// Serialize the full state.
    fn store(&self) -> Vec<u8>;

    fn content(&self) -> DocumentContent;

    /// Stream of diffs produced by local mutations.
    fn observe_publish(&self) -> BoxStream<'static, Vec<u8>>;

    /// Latest visible content, updated on every change.
    fn observe_changes(&self) -> watch::Receiver<DocumentContent>;

    fn statistics(&self) -> DocumentStatistics;
}

/// yrs-backed replicated whiteboard document.
pub struct YrsDocument {
    doc: Doc,
    publish_tx: broadcast::Sender<Vec<u8>>,
    changes_tx: watch::Sender<DocumentContent>,
}

impl YrsDocument {
    pub fn new() -> Self {
        let (publish_tx, _) = broadcast::channel(256);
        let (changes_tx, _) = watch::channel(DocumentContent::new());
        Self {
            doc: Doc::new(),
            publish_tx,
            changes_tx,
        }
    }

    /// Run a local mutation and publish the resulting diff.
    ///
    /// Mutations that leave the visible content unchanged publish nothing.
    pub fn perform_change<F>(&self, mutator: F)
    where
        F: FnOnce(&MapRef, &mut TransactionMut<'_>),
    {
        let before = self.content();
        let map = self.doc.get_or_insert_map(ROOT_MAP);
        let sv_before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            mutator(&map, &mut txn);
        }

        let after = self.content();
        if after == before {
            return;
        }
        let diff = self.doc.transact().encode_state_as_update_v1(&sv_before);
        let _ = self.publish_tx.send(diff);
        self.changes_tx.send_replace(after);
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.perform_change(|map, txn| {
            map.insert(txn, key, value);
        });
    }

    pub fn remove(&self, key: &str) {
        self.perform_change(|map, txn| {
            map.remove(txn, key);
        });
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let map = self.doc.get_or_insert_map(ROOT_MAP);
        let txn = self.doc.transact();
        map.get(&txn, key).and_then(|v| v.cast::<String>().ok())
    }

    fn apply_raw(&self, bytes: &[u8]) -> Result<()> {
        let update = Update::decode_v1(bytes)?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| SyncError::validation(format!("failed to apply update: {e}")))?;
        }
        self.changes_tx.send_if_modified(|content| {
            let next = read_content(&self.doc);
            if *content == next {
                false
            } else {
                *content = next;
                true
            }
        });
        Ok(())
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn read_content(doc: &Doc) -> DocumentContent {
    let map = doc.get_or_insert_map(ROOT_MAP);
    let txn = doc.transact();
    map.keys(&txn)
        .filter_map(|key| {
            map.get(&txn, key)
                .and_then(|v| v.cast::<String>().ok())
                .map(|value| (key.to_string(), value))
        })
        .collect()
}

/// Build a throwaway replica from a sequence of updates.
fn scratch_replica(updates: &[&[u8]]) -> Result<Doc> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for bytes in updates {
            let update = Update::decode_v1(bytes)?;
            txn.apply_update(update)
                .map_err(|e| SyncError::validation(format!("failed to apply update: {e}")))?;
        }
    }
    Ok(doc)
}

fn validate(doc: &Doc, validator: Option<&ContentValidator>) -> Result<()> {
    match validator {
        Some(validator) if !validator(&read_content(doc)) => {
            Err(SyncError::validation("content rejected by validator"))
        }
        _ => Ok(()),
    }
}

impl ReplicatedDocument for YrsDocument {
    fn apply_change(&self, diff: &[u8], validator: Option<&ContentValidator>) -> Result<()> {
        if validator.is_some() {
            let current = self.store();
            let scratch = scratch_replica(&[&current, diff])?;
            validate(&scratch, validator)?;
        }
        self.apply_raw(diff)
    }

    fn check_snapshot(&self, snapshot: &[u8], validator: Option<&ContentValidator>) -> Result<()> {
        let scratch = scratch_replica(&[snapshot])?;
        validate(&scratch, validator)
    }

    fn merge_from(&self, snapshot: &[u8], validator: Option<&ContentValidator>) -> Result<()> {
        self.check_snapshot(snapshot, validator)?;
        self.apply_raw(snapshot)
    }

    fn store(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn content(&self) -> DocumentContent {
        read_content(&self.doc)
    }

    fn observe_publish(&self) -> BoxStream<'static, Vec<u8>> {
        broadcast_stream(self.publish_tx.subscribe())
    }

    fn observe_changes(&self) -> watch::Receiver<DocumentContent> {
        self.changes_tx.subscribe()
    }

    fn statistics(&self) -> DocumentStatistics {
        let content = self.content();
        DocumentStatistics {
            document_size_in_bytes: self.store().len(),
            content_size_in_bytes: serde_json::to_vec(&content).map(|v| v.len()).unwrap_or(0),
        }
    }
}
