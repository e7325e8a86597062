//! Engine statistics and status flags, published on watch channels.

use tokio::sync::watch;

use crate::document::DocumentStatistics;

/// Engine counters plus the latest document size measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatistics {
    pub document_size_in_bytes: usize,
    pub content_size_in_bytes: usize,
    /// Local changes exist that no published snapshot covers yet.
    pub snapshot_outstanding: bool,
    pub snapshots_received: u64,
    pub snapshots_sent: u64,
}

/// Failure flags. Each clears itself on the next success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub save_failed: bool,
    pub load_failed: bool,
}

/// Owner of the statistics and flag channels.
///
/// Subscribers are only woken when a value actually changes.
pub(crate) struct StatsTracker {
    stats_tx: watch::Sender<SyncStatistics>,
    flags_tx: watch::Sender<StatusFlags>,
}

impl StatsTracker {
    pub(crate) fn new(initial: DocumentStatistics) -> Self {
        let (stats_tx, _) = watch::channel(SyncStatistics {
            document_size_in_bytes: initial.document_size_in_bytes,
            content_size_in_bytes: initial.content_size_in_bytes,
            ..SyncStatistics::default()
        });
        let (flags_tx, _) = watch::channel(StatusFlags::default());
        Self { stats_tx, flags_tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SyncStatistics> {
        self.stats_tx.subscribe()
    }

    pub(crate) fn subscribe_flags(&self) -> watch::Receiver<StatusFlags> {
        self.flags_tx.subscribe()
    }

    pub(crate) fn current(&self) -> SyncStatistics {
        *self.stats_tx.borrow()
    }

    pub(crate) fn flags(&self) -> StatusFlags {
        *self.flags_tx.borrow()
    }

    fn update_stats(&self, f: impl FnOnce(&mut SyncStatistics)) {
        self.stats_tx.send_if_modified(|stats| {
            let before = *stats;
            f(stats);
            *stats != before
        });
    }

    fn update_flags(&self, f: impl FnOnce(&mut StatusFlags)) {
        self.flags_tx.send_if_modified(|flags| {
            let before = *flags;
            f(flags);
            *flags != before
        });
    }

    pub(crate) fn set_outstanding(&self, outstanding: bool) {
        self.update_stats(|s| s.snapshot_outstanding = outstanding);
    }

    pub(crate) fn record_sent(&self) {
        self.update_stats(|s| s.snapshots_sent += 1);
    }

    pub(crate) fn record_received(&self) {
        self.update_stats(|s| s.snapshots_received += 1);
    }

    pub(crate) fn update_document(&self, document: DocumentStatistics) {
        self.update_stats(|s| {
            s.document_size_in_bytes = document.document_size_in_bytes;
            s.content_size_in_bytes = document.content_size_in_bytes;
        });
    }

    pub(crate) fn set_save_failed(&self, failed: bool) {
        self.update_flags(|f| f.save_failed = failed);
    }

    pub(crate) fn set_load_failed(&self, failed: bool) {
        self.update_flags(|f| f.load_failed = failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_real_changes_notify() {
        let tracker = StatsTracker::new(DocumentStatistics::default());
        let mut rx = tracker.subscribe();

        tracker.set_outstanding(false);
        assert!(!rx.has_changed().unwrap());

        tracker.set_outstanding(true);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().snapshot_outstanding);

        tracker.record_sent();
        tracker.record_received();
        let stats = tracker.current();
        assert_eq!(stats.snapshots_sent, 1);
        assert_eq!(stats.snapshots_received, 1);
    }

    #[test]
    fn test_flags() {
        let tracker = StatsTracker::new(DocumentStatistics::default());
        let mut rx = tracker.subscribe_flags();

        tracker.set_save_failed(true);
        assert!(rx.borrow_and_update().save_failed);
        tracker.set_save_failed(false);
        tracker.set_load_failed(true);
        assert_eq!(
            tracker.flags(),
            StatusFlags {
                save_failed: false,
                load_failed: true
            }
        );
    }
}
