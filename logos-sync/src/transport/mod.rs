//! Transport boundary.
//!
//! The sync subsystem only ever talks to peers through this trait: keyed
//! broadcast records (presence), an ordered event timeline (diffs and
//! snapshots) with relation lookups, and deferred records that fire unless
//! renewed (disconnect detection). Delivery is lossy and eventually
//! consistent; nothing here promises exactly-once or total order.
//!
//! [`memory::MemoryHub`] is an in-process implementation used by tests and
//! single-process embeddings.

pub mod memory;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::protocol::{EventId, StateRecord, TimelineEvent};

pub use memory::{MemoryHub, MemoryTransport, TransportStats};

/// Handle of a scheduled deferred record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(pub String);

/// One page of timeline history.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<TimelineEvent>,
    /// Cursor for the next page; `None` when history is exhausted.
    pub next_cursor: Option<String>,
}

/// Filter for [`Transport::read_related_events`].
#[derive(Debug, Clone)]
pub struct RelationQuery {
    pub event_type: String,
    pub cursor: Option<String>,
    pub limit: usize,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish the latest value of a keyed record. Empty content removes it.
    async fn send_record(&self, record_type: &str, key: &str, content: Vec<u8>) -> Result<()>;

    /// Current value of a keyed record, if any.
    async fn read_record(&self, record_type: &str, key: &str) -> Result<Option<StateRecord>>;

    /// Current values of every record of one type, removed ones included.
    async fn read_records(&self, record_type: &str) -> Result<Vec<StateRecord>>;

    /// Live stream of record updates of one type, optionally for one key.
    fn observe_records(&self, record_type: &str, key: Option<&str>) -> BoxStream<'static, StateRecord>;

    /// Append an event to the timeline and return its id.
    async fn append_event(
        &self,
        event_type: &str,
        content: Vec<u8>,
        relates_to: Option<EventId>,
    ) -> Result<EventId>;

    /// Live stream of appended events of one type.
    fn observe_events(&self, event_type: &str) -> BoxStream<'static, TimelineEvent>;

    /// Page through timeline history of one type, newest first.
    async fn read_events(
        &self,
        event_type: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<EventPage>;

    /// Page through events relating to `event_id`.
    async fn read_related_events(&self, event_id: &str, query: RelationQuery) -> Result<EventPage>;

    /// Whether deferred records are natively supported.
    fn supports_deferred_records(&self) -> bool {
        true
    }

    /// Schedule `content` to be published under `key` after `delay` unless
    /// renewed or cancelled first.
    async fn schedule_deferred_record(
        &self,
        record_type: &str,
        key: &str,
        content: Vec<u8>,
        delay: Duration,
    ) -> Result<LeaseToken>;

    /// Push the deadline of a deferred record out by its original delay.
    async fn renew_deferred(&self, token: &LeaseToken) -> Result<()>;

    /// Drop a deferred record without publishing it.
    async fn cancel_deferred(&self, token: &LeaseToken) -> Result<()>;
}

/// Adapt a broadcast receiver into a stream, skipping over lag.
///
/// A lagging subscriber loses messages, which the protocol tolerates.
pub(crate) fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Subscriber lagged, {skipped} messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
