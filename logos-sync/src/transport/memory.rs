//! In-process transport hub.
//!
//! Every participant gets a [`MemoryTransport`] handle onto one shared
//! [`MemoryHub`]. Records and timeline events fan out through tokio
//! broadcast channels, so each subscriber holds an independent receiver and
//! a lagging one drops messages instead of stalling the sender.
//!
//! ```text
//! MemoryTransport(alice) ──┐                ┌── observe_records()
//!                          ├── MemoryHub ───┤
//! MemoryTransport(bob)  ───┘   records      └── observe_events()
//!                              timeline
//!                              deferred (timers)
//! ```
//!
//! Handles can inject failures so tests can exercise the retry paths.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::{broadcast_stream, EventPage, LeaseToken, RelationQuery, Transport};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::protocol::{EventId, StateRecord, TimelineEvent};

/// Per-handle call statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub records_sent: u64,
    pub events_appended: u64,
    pub lease_calls: u64,
    pub failed_calls: u64,
}

/// Lock-free counters; read via [`MemoryTransport::stats`].
#[derive(Default)]
struct AtomicTransportStats {
    records_sent: AtomicU64,
    events_appended: AtomicU64,
    lease_calls: AtomicU64,
    failed_calls: AtomicU64,
}

struct DeferredEntry {
    record: StateRecord,
    delay: Duration,
    deadline: Instant,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct HubState {
    records: HashMap<(String, String), StateRecord>,
    timeline: Vec<TimelineEvent>,
    deferred: HashMap<String, DeferredEntry>,
    /// Every record transmission, in order, including deferred ones.
    record_log: Vec<StateRecord>,
}

struct HubInner {
    clock: Clock,
    state: Mutex<HubState>,
    records_tx: broadcast::Sender<StateRecord>,
    events_tx: broadcast::Sender<TimelineEvent>,
}

impl HubInner {
    async fn publish_record(&self, record: StateRecord) {
        {
            let mut state = self.state.lock().await;
            state
                .records
                .insert((record.record_type.clone(), record.key.clone()), record.clone());
            state.record_log.push(record.clone());
        }
        let _ = self.records_tx.send(record);
    }

    /// Wait out a deferred record's deadline, following renewals.
    async fn run_deferred(self: Arc<Self>, token: String) {
        loop {
            let deadline = {
                let state = self.state.lock().await;
                match state.deferred.get(&token) {
                    Some(entry) => entry.deadline,
                    None => return,
                }
            };
            tokio::time::sleep_until(deadline).await;

            let fired = {
                let mut state = self.state.lock().await;
                let due = match state.deferred.get(&token) {
                    None => return,
                    Some(entry) => entry.deadline <= Instant::now(),
                };
                if due {
                    state.deferred.remove(&token)
                } else {
                    None
                }
            };
            if let Some(mut entry) = fired {
                log::debug!("Deferred record {} fired for key {}", token, entry.record.key);
                entry.record.origin_server_ts = self.clock.now_ms();
                self.publish_record(entry.record).await;
                return;
            }
        }
    }
}

/// Shared in-process "server" for a set of [`MemoryTransport`] handles.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create a hub whose timestamps come from `clock`.
    pub fn new(clock: Clock) -> Self {
        Self::with_capacity(clock, 1024)
    }

    /// `capacity` bounds how many messages a subscriber may fall behind.
    pub fn with_capacity(clock: Clock, capacity: usize) -> Self {
        let (records_tx, _) = broadcast::channel(capacity);
        let (events_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(HubInner {
                clock,
                state: Mutex::new(HubState::default()),
                records_tx,
                events_tx,
            }),
        }
    }

    /// Open a handle acting as `sender`.
    pub fn connect(&self, sender: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            hub: self.inner.clone(),
            sender: sender.into(),
            failing: AtomicBool::new(false),
            failing_event_type: RwLock::new(None),
            event_delay: RwLock::new(None),
            record_delay_ms: AtomicU64::new(0),
            renew_delay_ms: AtomicU64::new(0),
            lease_failing: AtomicBool::new(false),
            deferred_supported: AtomicBool::new(true),
            stats: AtomicTransportStats::default(),
        }
    }

    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    /// All record transmissions so far, oldest first.
    pub async fn record_log(&self) -> Vec<StateRecord> {
        self.inner.state.lock().await.record_log.clone()
    }

    /// All timeline events so far, oldest first.
    pub async fn timeline(&self) -> Vec<TimelineEvent> {
        self.inner.state.lock().await.timeline.clone()
    }

    pub async fn record(&self, record_type: &str, key: &str) -> Option<StateRecord> {
        self.inner
            .state
            .lock()
            .await
            .records
            .get(&(record_type.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of deferred records still pending.
    pub async fn pending_deferred(&self) -> usize {
        self.inner.state.lock().await.deferred.len()
    }

    /// Inject an event with an explicit server timestamp, bypassing any
    /// handle. Used to replay history.
    pub async fn inject_event(
        &self,
        event_type: &str,
        sender: &str,
        origin_server_ts: u64,
        relates_to: Option<EventId>,
        content: Vec<u8>,
    ) -> EventId {
        let event = TimelineEvent {
            event_id: new_event_id(),
            event_type: event_type.to_string(),
            sender: sender.to_string(),
            origin_server_ts,
            relates_to,
            content,
        };
        self.inner.state.lock().await.timeline.push(event.clone());
        let _ = self.inner.events_tx.send(event.clone());
        event.event_id
    }

    /// Publish a record with an explicit timestamp, bypassing any handle.
    pub async fn inject_record(&self, record: StateRecord) {
        self.inner.publish_record(record).await;
    }
}

fn new_event_id() -> EventId {
    format!("${}", Uuid::new_v4().simple())
}

fn parse_cursor(cursor: Option<String>) -> Result<usize> {
    match cursor {
        None => Ok(0),
        Some(c) => c
            .parse()
            .map_err(|_| SyncError::transport(format!("invalid cursor: {c}"))),
    }
}

fn paginate(events: Vec<TimelineEvent>, offset: usize, limit: usize) -> EventPage {
    let limit = limit.max(1);
    let total = events.len();
    let page: Vec<TimelineEvent> = events.into_iter().skip(offset).take(limit).collect();
    let next = offset + page.len();
    EventPage {
        events: page,
        next_cursor: (next < total).then(|| next.to_string()),
    }
}

/// One participant's view of a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<HubInner>,
    sender: String,
    failing: AtomicBool,
    failing_event_type: RwLock<Option<String>>,
    event_delay: RwLock<Option<(String, Duration)>>,
    record_delay_ms: AtomicU64,
    renew_delay_ms: AtomicU64,
    lease_failing: AtomicBool,
    deferred_supported: AtomicBool,
    stats: AtomicTransportStats,
}

impl MemoryTransport {
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Make every call through this handle fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make appends of one event type fail.
    pub async fn set_failing_event_type(&self, event_type: Option<&str>) {
        *self.failing_event_type.write().await = event_type.map(String::from);
    }

    /// Hold appends of one event type for `delay` before they land.
    pub async fn set_event_delay(&self, event_type: Option<&str>, delay: Duration) {
        *self.event_delay.write().await = event_type.map(|t| (t.to_string(), delay));
    }

    /// Hold records that carry content for `delay`; removals are not delayed.
    pub fn set_record_delay(&self, delay: Duration) {
        self.record_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold lease renewals for `delay` before the deadline moves.
    pub fn set_renew_delay(&self, delay: Duration) {
        self.renew_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make lease scheduling and renewal fail.
    pub fn set_lease_failing(&self, failing: bool) {
        self.lease_failing.store(failing, Ordering::SeqCst);
    }

    /// Pretend the server lacks deferred-record support.
    pub fn set_deferred_supported(&self, supported: bool) {
        self.deferred_supported.store(supported, Ordering::SeqCst);
    }

    /// Snapshot of this handle's call counters.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            records_sent: self.stats.records_sent.load(Ordering::Relaxed),
            events_appended: self.stats.events_appended.load(Ordering::Relaxed),
            lease_calls: self.stats.lease_calls.load(Ordering::Relaxed),
            failed_calls: self.stats.failed_calls.load(Ordering::Relaxed),
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::transport("transport unavailable"));
        }
        Ok(())
    }

    fn check_lease(&self) -> Result<()> {
        self.stats.lease_calls.fetch_add(1, Ordering::Relaxed);
        self.check_online()?;
        if self.lease_failing.load(Ordering::SeqCst) {
            self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::Lease("deferred record rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_record(&self, record_type: &str, key: &str, content: Vec<u8>) -> Result<()> {
        self.check_online()?;
        let delay_ms = self.record_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 && !content.is_empty() {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        self.stats.records_sent.fetch_add(1, Ordering::Relaxed);
        let record = StateRecord {
            record_type: record_type.to_string(),
            key: key.to_string(),
            sender: self.sender.clone(),
            origin_server_ts: self.hub.clock.now_ms(),
            content,
        };
        self.hub.publish_record(record).await;
        Ok(())
    }

    async fn read_record(&self, record_type: &str, key: &str) -> Result<Option<StateRecord>> {
        self.check_online()?;
        let state = self.hub.state.lock().await;
        Ok(state
            .records
            .get(&(record_type.to_string(), key.to_string()))
            .cloned())
    }

    async fn read_records(&self, record_type: &str) -> Result<Vec<StateRecord>> {
        self.check_online()?;
        let state = self.hub.state.lock().await;
        let mut records: Vec<StateRecord> = state
            .records
            .values()
            .filter(|r| r.record_type == record_type)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    fn observe_records(&self, record_type: &str, key: Option<&str>) -> BoxStream<'static, StateRecord> {
        let record_type = record_type.to_string();
        let key = key.map(String::from);
        broadcast_stream(self.hub.records_tx.subscribe())
            .filter(move |record| {
                let matches = record.record_type == record_type
                    && key.as_ref().map_or(true, |k| &record.key == k);
                futures_util::future::ready(matches)
            })
            .boxed()
    }

    async fn append_event(
        &self,
        event_type: &str,
        content: Vec<u8>,
        relates_to: Option<EventId>,
    ) -> Result<EventId> {
        self.check_online()?;
        if self.failing_event_type.read().await.as_deref() == Some(event_type) {
            self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::transport(format!("{event_type} rejected")));
        }
        let delay = match self.event_delay.read().await.as_ref() {
            Some((delayed, delay)) if delayed == event_type => Some(*delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.stats.events_appended.fetch_add(1, Ordering::Relaxed);

        let event = TimelineEvent {
            event_id: new_event_id(),
            event_type: event_type.to_string(),
            sender: self.sender.clone(),
            origin_server_ts: self.hub.clock.now_ms(),
            relates_to,
            content,
        };
        self.hub.state.lock().await.timeline.push(event.clone());
        let _ = self.hub.events_tx.send(event.clone());
        Ok(event.event_id)
    }

    fn observe_events(&self, event_type: &str) -> BoxStream<'static, TimelineEvent> {
        let event_type = event_type.to_string();
        broadcast_stream(self.hub.events_tx.subscribe())
            .filter(move |event| futures_util::future::ready(event.event_type == event_type))
            .boxed()
    }

    async fn read_events(
        &self,
        event_type: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<EventPage> {
        self.check_online()?;
        let offset = parse_cursor(cursor)?;
        let newest_first: Vec<TimelineEvent> = {
            let state = self.hub.state.lock().await;
            state
                .timeline
                .iter()
                .rev()
                .filter(|e| e.event_type == event_type)
                .cloned()
                .collect()
        };
        Ok(paginate(newest_first, offset, limit))
    }

    async fn read_related_events(&self, event_id: &str, query: RelationQuery) -> Result<EventPage> {
        self.check_online()?;
        let offset = parse_cursor(query.cursor)?;
        let related: Vec<TimelineEvent> = {
            let state = self.hub.state.lock().await;
            state
                .timeline
                .iter()
                .filter(|e| {
                    e.event_type == query.event_type && e.relates_to.as_deref() == Some(event_id)
                })
                .cloned()
                .collect()
        };
        Ok(paginate(related, offset, query.limit))
    }

    fn supports_deferred_records(&self) -> bool {
        self.deferred_supported.load(Ordering::SeqCst)
    }

    async fn schedule_deferred_record(
        &self,
        record_type: &str,
        key: &str,
        content: Vec<u8>,
        delay: Duration,
    ) -> Result<LeaseToken> {
        self.check_lease()?;
        if !self.supports_deferred_records() {
            return Err(SyncError::Lease("deferred records not supported".into()));
        }

        let token = Uuid::new_v4().simple().to_string();
        let entry = DeferredEntry {
            record: StateRecord {
                record_type: record_type.to_string(),
                key: key.to_string(),
                sender: self.sender.clone(),
                origin_server_ts: 0,
                content,
            },
            delay,
            deadline: Instant::now() + delay,
            task: None,
        };
        self.hub.state.lock().await.deferred.insert(token.clone(), entry);

        let task = tokio::spawn(self.hub.clone().run_deferred(token.clone()));
        if let Some(entry) = self.hub.state.lock().await.deferred.get_mut(&token) {
            entry.task = Some(task);
        }
        Ok(LeaseToken(token))
    }

    async fn renew_deferred(&self, token: &LeaseToken) -> Result<()> {
        self.check_lease()?;
        let delay_ms = self.renew_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let mut state = self.hub.state.lock().await;
        match state.deferred.get_mut(&token.0) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.delay;
                Ok(())
            }
            None => Err(SyncError::Lease(format!("unknown lease {}", token.0))),
        }
    }

    async fn cancel_deferred(&self, token: &LeaseToken) -> Result<()> {
        self.check_lease()?;
        let removed = self.hub.state.lock().await.deferred.remove(&token.0);
        match removed {
            Some(entry) => {
                if let Some(task) = entry.task {
                    task.abort();
                }
                Ok(())
            }
            None => Err(SyncError::Lease(format!("unknown lease {}", token.0))),
        }
    }
}
