//! Session manager: advertises the local session and tracks peers.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::lease::DisconnectLease;
use super::{SessionEvent, SessionState};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::{Result, SyncError};
use crate::protocol::{
    decode, encode, session_id_for, SessionContent, SessionRecord, StateRecord, SESSION_RECORD,
};
use crate::transport::{broadcast_stream, Transport};

#[derive(Default)]
struct Presence {
    document_id: Option<String>,
    own: Option<SessionRecord>,
    /// Remote sessions on `document_id`, keyed by session id.
    sessions: HashMap<String, SessionRecord>,
    lease: Option<DisconnectLease>,
    /// Arming or renewing the lease failed; re-arm on the next own update.
    lease_lost: bool,
    /// Refresh and renewal timers of the current join.
    timers: Option<(CancellationToken, JoinHandle<()>)>,
    focus_preferences: Vec<String>,
}

enum Observed {
    Peer(SessionEvent),
    Own,
    Ignored,
}

fn observe_record(
    presence: &mut Presence,
    own_session_id: &str,
    record: &StateRecord,
    now_ms: u64,
) -> Observed {
    let Some(document_id) = presence.document_id.clone() else {
        return Observed::Ignored;
    };
    if record.key == own_session_id {
        return if record.is_removed() {
            Observed::Ignored
        } else {
            Observed::Own
        };
    }

    let left = |presence: &mut Presence| match presence.sessions.remove(&record.key) {
        Some(_) => Observed::Peer(SessionEvent::Left {
            session_id: record.key.clone(),
        }),
        None => Observed::Ignored,
    };

    if record.is_removed() {
        return left(presence);
    }
    let content: SessionContent = match decode(&record.content) {
        Ok(content) => content,
        Err(e) => {
            log::debug!("Ignoring malformed session record {}: {e}", record.key);
            return Observed::Ignored;
        }
    };
    if content.document_id != document_id {
        return left(presence);
    }

    let session = SessionRecord::from_content(&record.key, content);
    if !session.is_valid_at(now_ms) {
        presence.sessions.remove(&record.key);
        return Observed::Ignored;
    }
    match presence.sessions.insert(record.key.clone(), session.clone()) {
        None => Observed::Peer(SessionEvent::Joined(session)),
        Some(_) => Observed::Ignored,
    }
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    user_id: String,
    device_id: String,
    session_id: String,
    clock: Clock,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    presence: Mutex<Presence>,
    /// Serializes join, leave and own-record edits.
    transitions: Mutex<()>,
    cancel: CancellationToken,
}

impl SessionInner {
    async fn publish(&self, record: &SessionRecord) -> Result<()> {
        let content = encode(&record.to_content())?;
        self.transport
            .send_record(SESSION_RECORD, &record.session_id, content)
            .await
    }

    async fn run_observer(self: Arc<Self>, mut records: BoxStream<'static, StateRecord>) {
        loop {
            let record = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = records.next() => match next {
                    Some(record) => record,
                    None => break,
                },
            };
            self.ingest(&record).await;
        }
    }

    async fn ingest(&self, record: &StateRecord) {
        let now = self.clock.now_ms();
        let observed = {
            let mut presence = self.presence.lock().await;
            let observed = observe_record(&mut presence, &self.session_id, record, now);
            presence.sessions.retain(|_, session| session.is_valid_at(now));
            observed
        };

        match observed {
            Observed::Peer(event) => {
                log::debug!("Session event: {event:?}");
                let _ = self.events_tx.send(event);
            }
            Observed::Own => self.rearm_lease().await,
            Observed::Ignored => {}
        }
    }

    async fn join_locked(self: &Arc<Self>, document_id: &str) {
        self.state_tx.send_replace(SessionState::Joining);

        let now = self.clock.now_ms();
        let focus_preferences = {
            let mut presence = self.presence.lock().await;
            presence.document_id = Some(document_id.to_string());
            presence.sessions.clear();
            presence.focus_preferences.clone()
        };
        let record = SessionRecord {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            document_id: document_id.to_string(),
            created_ts: now,
            expires_ts: now + self.config.session_ttl_ms,
            focus_preferences,
        };

        match self.transport.read_records(SESSION_RECORD).await {
            Ok(records) => {
                for existing in &records {
                    self.ingest(existing).await;
                }
            }
            Err(e) => log::warn!("Could not read current sessions of {document_id}: {e}"),
        }

        if let Err(e) = self.publish(&record).await {
            log::warn!("Failed to join {document_id} as {}: {e}", self.session_id);
            {
                let mut presence = self.presence.lock().await;
                presence.document_id = None;
                presence.sessions.clear();
            }
            self.state_tx.send_replace(SessionState::Idle);
            return;
        }

        let lease = match DisconnectLease::arm(
            self.transport.clone(),
            &self.session_id,
            self.config.lease_grace(),
        )
        .await
        {
            Ok(lease) => Some(lease),
            Err(e) => {
                log::warn!("Disconnect lease unavailable for {}: {e}", self.session_id);
                None
            }
        };

        let timers = self.cancel.child_token();
        {
            let mut presence = self.presence.lock().await;
            presence.lease_lost = lease.is_none();
            presence.lease = lease;
            presence.own = Some(record);
            let task = tokio::spawn(self.clone().run_timers(timers.clone()));
            presence.timers = Some((timers, task));
        }

        self.state_tx.send_replace(SessionState::Joined);
        log::info!("Joined {document_id} as {}", self.session_id);
    }

    async fn leave_locked(&self) {
        let (own, timers) = {
            let mut presence = self.presence.lock().await;
            let Some(own) = presence.own.take() else {
                return;
            };
            presence.document_id = None;
            presence.sessions.clear();
            (own, presence.timers.take())
        };
        self.state_tx.send_replace(SessionState::Leaving);

        // A refresh or renewal already in flight must land before the
        // removed record.
        if let Some((token, task)) = timers {
            token.cancel();
            if let Err(e) = task.await {
                log::warn!("Session timers of {} ended abnormally: {e}", own.session_id);
            }
        }
        let lease = {
            let mut presence = self.presence.lock().await;
            presence.lease_lost = false;
            presence.lease.take()
        };
        if let Err(e) = self
            .transport
            .send_record(SESSION_RECORD, &own.session_id, Vec::new())
            .await
        {
            log::warn!("Failed to publish leave of {}: {e}", own.session_id);
        }
        if let Some(lease) = lease {
            if let Err(e) = lease.cancel().await {
                log::debug!("Lease cancel for {} failed: {e}", own.session_id);
            }
        }

        self.state_tx.send_replace(SessionState::Idle);
        log::info!("Left {} as {}", own.document_id, own.session_id);
    }

    async fn run_timers(self: Arc<Self>, token: CancellationToken) {
        let refresh_every = self.config.refresh_interval();
        let renew_every = self.config.lease_renew_interval();
        let mut refresh = interval_at(Instant::now() + refresh_every, refresh_every);
        let mut renew = interval_at(Instant::now() + renew_every, renew_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = refresh.tick() => self.refresh(&token).await,
                _ = renew.tick() => self.renew_lease().await,
            }
        }
    }

    /// Re-read the own record, keep externally edited fields, extend expiry.
    async fn refresh(&self, token: &CancellationToken) {
        let Some(own) = self.presence.lock().await.own.clone() else {
            return;
        };

        let current = match self.transport.read_record(SESSION_RECORD, &own.session_id).await {
            Ok(record) => record
                .filter(|r| !r.is_removed())
                .and_then(|r| decode::<SessionContent>(&r.content).ok()),
            Err(e) => {
                log::warn!("Could not read own session {}: {e}", own.session_id);
                None
            }
        };

        let mut next = own.clone();
        if let Some(current) = &current {
            if current.document_id == own.document_id {
                next.focus_preferences = current.focus_preferences.clone();
            }
        }
        next.expires_ts = self.clock.now_ms() + self.config.session_ttl_ms;

        if current.as_ref() == Some(&next.to_content()) || token.is_cancelled() {
            return;
        }
        match self.publish(&next).await {
            Ok(()) => {
                let mut presence = self.presence.lock().await;
                let still_joined = presence
                    .own
                    .as_ref()
                    .is_some_and(|o| o.document_id == next.document_id);
                if still_joined {
                    log::debug!("Refreshed {} until {}", next.session_id, next.expires_ts);
                    presence.focus_preferences = next.focus_preferences.clone();
                    presence.own = Some(next);
                }
            }
            Err(e) => log::warn!("Failed to refresh session {}: {e}", own.session_id),
        }
    }

    async fn renew_lease(&self) {
        let Some(lease) = self.presence.lock().await.lease.take() else {
            return;
        };
        let renewed = lease.renew().await;

        let mut presence = self.presence.lock().await;
        match renewed {
            Ok(()) if presence.own.is_some() && presence.lease.is_none() => {
                presence.lease = Some(lease);
            }
            Ok(()) => {
                drop(presence);
                let _ = lease.cancel().await;
            }
            Err(e) => {
                log::warn!("Disconnect lease for {} lost: {e}", self.session_id);
                presence.lease_lost = true;
            }
        }
    }

    async fn rearm_lease(&self) {
        {
            let mut presence = self.presence.lock().await;
            let joined = *self.state_tx.borrow() == SessionState::Joined;
            if !presence.lease_lost || presence.own.is_none() || !joined {
                return;
            }
            presence.lease_lost = false;
        }

        match DisconnectLease::arm(
            self.transport.clone(),
            &self.session_id,
            self.config.lease_grace(),
        )
        .await
        {
            Ok(lease) => {
                let mut presence = self.presence.lock().await;
                if presence.own.is_some() && presence.lease.is_none() {
                    log::info!("Re-armed disconnect lease for {}", self.session_id);
                    presence.lease = Some(lease);
                } else {
                    drop(presence);
                    let _ = lease.cancel().await;
                }
            }
            Err(e) => {
                log::warn!("Re-arming lease for {} failed: {e}", self.session_id);
                self.presence.lock().await.lease_lost = true;
            }
        }
    }
}

/// Presence for one local `(user, device)` across documents.
///
/// Joined to at most one document at a time.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Create a manager and start observing session records.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        clock: Clock,
        config: SessionConfig,
    ) -> Self {
        let user_id = user_id.into();
        let device_id = device_id.into();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (events_tx, _) = broadcast::channel(256);
        let presence = Presence {
            focus_preferences: config.focus_preferences.clone(),
            ..Presence::default()
        };

        let inner = Arc::new(SessionInner {
            session_id: session_id_for(&user_id, &device_id),
            transport,
            user_id,
            device_id,
            clock,
            config,
            state_tx,
            events_tx,
            presence: Mutex::new(presence),
            transitions: Mutex::new(()),
            cancel: CancellationToken::new(),
        });

        let records = inner.transport.observe_records(SESSION_RECORD, None);
        tokio::spawn(inner.clone().run_observer(records));

        Self { inner }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn observe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Joins and leaves of remote sessions on the joined document.
    pub fn observe_session_events(&self) -> BoxStream<'static, SessionEvent> {
        broadcast_stream(self.inner.events_tx.subscribe())
    }

    pub async fn document_id(&self) -> Option<String> {
        self.inner.presence.lock().await.document_id.clone()
    }

    /// Valid remote sessions on the joined document, sorted by session id.
    pub async fn sessions(&self) -> Vec<SessionRecord> {
        let now = self.inner.clock.now_ms();
        let presence = self.inner.presence.lock().await;
        let mut sessions: Vec<SessionRecord> = presence
            .sessions
            .values()
            .filter(|session| session.is_valid_at(now))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub async fn own_session(&self) -> Option<SessionRecord> {
        self.inner.presence.lock().await.own.clone()
    }

    /// Advertise presence on `document_id`, leaving any other document
    /// first.
    ///
    /// Only identity problems are returned. Transport failures are logged
    /// and leave the manager `Idle` so the join can be retried.
    pub async fn join(&self, document_id: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.user_id.is_empty() || inner.device_id.is_empty() {
            return Err(SyncError::Identity(format!(
                "user id {:?} and device id {:?} are required to join",
                inner.user_id, inner.device_id
            )));
        }
        if inner.cancel.is_cancelled() {
            return Err(SyncError::transport("session manager was shut down"));
        }

        let _transition = inner.transitions.lock().await;
        {
            let presence = inner.presence.lock().await;
            if presence.own.as_ref().map(|own| own.document_id.as_str()) == Some(document_id) {
                return Ok(());
            }
        }
        inner.leave_locked().await;
        inner.join_locked(document_id).await;
        Ok(())
    }

    /// Withdraw the own session. Safe to call when not joined.
    pub async fn leave(&self) {
        let _transition = self.inner.transitions.lock().await;
        self.inner.leave_locked().await;
    }

    /// Change the advertised focus preferences, republishing when joined.
    pub async fn set_focus_preferences(&self, focus_preferences: Vec<String>) {
        let _transition = self.inner.transitions.lock().await;
        let record = {
            let mut presence = self.inner.presence.lock().await;
            presence.focus_preferences = focus_preferences.clone();
            presence.own.as_mut().map(|own| {
                own.focus_preferences = focus_preferences;
                own.clone()
            })
        };
        if let Some(record) = record {
            if let Err(e) = self.inner.publish(&record).await {
                log::warn!("Failed to publish focus preferences of {}: {e}", record.session_id);
            }
        }
    }

    /// Leave and stop observing records.
    pub async fn shutdown(&self) {
        self.leave().await;
        self.inner.cancel.cancel();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
