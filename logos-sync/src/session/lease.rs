//! Best-effort disconnect detection.
//!
//! A lease is a "removed" session record scheduled to fire after a grace
//! window unless renewed. If the client vanishes without leaving, renewals
//! stop and peers eventually see the session disappear.
//!
//! When the transport cannot schedule deferred records the lease degrades to
//! a local timer. It still fires when renewals stop, but not if the whole
//! process dies.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};
use crate::protocol::SESSION_RECORD;
use crate::transport::{LeaseToken, Transport};

enum LeaseHandle {
    Remote(LeaseToken),
    Local {
        deadline: watch::Sender<Instant>,
        cancel: CancellationToken,
    },
}

pub struct DisconnectLease {
    transport: Arc<dyn Transport>,
    session_id: String,
    grace: Duration,
    handle: LeaseHandle,
}

impl DisconnectLease {
    /// Arm a lease removing `session_id` after `grace`.
    pub async fn arm(transport: Arc<dyn Transport>, session_id: &str, grace: Duration) -> Result<Self> {
        let handle = if transport.supports_deferred_records() {
            let token = transport
                .schedule_deferred_record(SESSION_RECORD, session_id, Vec::new(), grace)
                .await?;
            LeaseHandle::Remote(token)
        } else {
            log::info!("No deferred record support, using a local disconnect timer for {session_id}");
            let (deadline, deadline_rx) = watch::channel(Instant::now() + grace);
            let cancel = CancellationToken::new();
            tokio::spawn(run_local_lease(
                transport.clone(),
                session_id.to_string(),
                deadline_rx,
                cancel.clone(),
            ));
            LeaseHandle::Local { deadline, cancel }
        };

        Ok(Self {
            transport,
            session_id: session_id.to_string(),
            grace,
            handle,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether this lease is the local-timer fallback.
    pub fn is_local(&self) -> bool {
        matches!(self.handle, LeaseHandle::Local { .. })
    }

    /// Push the deadline out by another grace window.
    pub async fn renew(&self) -> Result<()> {
        match &self.handle {
            LeaseHandle::Remote(token) => self.transport.renew_deferred(token).await,
            LeaseHandle::Local { deadline, cancel } => {
                if cancel.is_cancelled() {
                    return Err(SyncError::Lease(format!(
                        "local lease for {} already fired",
                        self.session_id
                    )));
                }
                deadline.send_replace(Instant::now() + self.grace);
                Ok(())
            }
        }
    }

    /// Disarm without firing.
    pub async fn cancel(self) -> Result<()> {
        match self.handle {
            LeaseHandle::Remote(token) => self.transport.cancel_deferred(&token).await,
            LeaseHandle::Local { cancel, .. } => {
                cancel.cancel();
                Ok(())
            }
        }
    }
}

async fn run_local_lease(
    transport: Arc<dyn Transport>,
    session_id: String,
    mut deadline: watch::Receiver<Instant>,
    cancel: CancellationToken,
) {
    // A dropped lease still fires at its last deadline.
    let mut renewable = true;
    loop {
        let at = *deadline.borrow_and_update();
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = deadline.changed(), if renewable => {
                if changed.is_err() {
                    renewable = false;
                }
            }
            _ = tokio::time::sleep_until(at) => {
                log::info!("Local disconnect lease for {session_id} fired");
                cancel.cancel();
                if let Err(e) = transport.send_record(SESSION_RECORD, &session_id, Vec::new()).await {
                    log::warn!("Failed to publish removal of {session_id}: {e}");
                }
                return;
            }
        }
    }
}
