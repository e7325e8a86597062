//! End-to-end document sync over the in-process hub.
//!
//! Verifies:
//! - Several engines converge through diffs alone
//! - A late joiner recovers from a chunked snapshot in history
//! - A restarted client recovers from its RocksDB cache
//! - A newer broken snapshot does not hide an older valid one
//! - Throttled publication coalesces bursts of edits and retries failures

use logos_sync::protocol::{
    compress_snapshot, encode, split_into_chunks, ChunkContent, DescriptorContent,
    DOCUMENT_CHUNK_EVENT, DOCUMENT_CREATE_EVENT,
};
use logos_sync::{
    CacheConfig, Clock, ContentValidator, DocumentContent, DocumentSyncEngine, LocalCache,
    MemoryCache, MemoryHub, ReplicatedDocument, RocksCache, SyncConfig, SyncHandle, Validators,
    YrsDocument,
};

use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const DOC: &str = "wb-1";

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn start(
    hub: &MemoryHub,
    sender: &str,
    cache: Arc<dyn LocalCache>,
    validators: Validators,
) -> (Arc<YrsDocument>, SyncHandle) {
    let document = Arc::new(YrsDocument::new());
    let handle = DocumentSyncEngine::start(
        document.clone(),
        Arc::new(hub.connect(sender)),
        cache,
        DOC,
        validators,
        SyncConfig::for_testing(),
    );
    (document, handle)
}

async fn loaded(handle: &SyncHandle) {
    handle
        .observe_is_loading()
        .wait_for(|loading| !*loading)
        .await
        .unwrap();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Publish `state` as a chunked snapshot with an explicit timestamp.
async fn inject_snapshot(hub: &MemoryHub, ts: u64, state: &[u8]) {
    let payload = compress_snapshot(state);
    let parts = split_into_chunks(&payload, 16);
    let descriptor = encode(&DescriptorContent {
        document_id: DOC.into(),
        chunk_count: parts.len() as u32,
    })
    .unwrap();
    let event_id = hub
        .inject_event(DOCUMENT_CREATE_EVENT, "@carol", ts, None, descriptor)
        .await;
    for (seq, data) in parts.into_iter().enumerate() {
        let chunk = encode(&ChunkContent {
            document_id: DOC.into(),
            sequence_number: seq as u32,
            data,
        })
        .unwrap();
        hub.inject_event(DOCUMENT_CHUNK_EVENT, "@carol", ts + 1, Some(event_id.clone()), chunk)
            .await;
    }
}

async fn cached_content(cache: &dyn LocalCache) -> DocumentContent {
    let document = YrsDocument::new();
    if let Some(state) = cache.load(DOC).await.unwrap() {
        document.merge_from(&state, None).unwrap();
    }
    document.content()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_three_peers_converge() {
    let hub = MemoryHub::new(Clock::starting_at(0));
    let peers: Vec<_> = ["@alice", "@bob", "@carol"]
        .iter()
        .map(|sender| start(&hub, sender, Arc::new(MemoryCache::new()), Validators::default()))
        .collect();
    for (_, handle) in &peers {
        loaded(handle).await;
    }

    for (i, (document, _)) in peers.iter().enumerate() {
        document.insert(&format!("shape-{i}"), "rect");
        document.insert("shared", &format!("owner-{i}"));
    }
    settle().await;

    let reference = peers[0].0.content();
    assert_eq!(reference.len(), 4);
    for (document, _) in &peers[1..] {
        assert_eq!(document.content(), reference);
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_recovers_from_snapshot() {
    let hub = MemoryHub::new(Clock::starting_at(0));
    let (alice, alice_handle) = start(&hub, "@alice", Arc::new(MemoryCache::new()), Validators::default());
    loaded(&alice_handle).await;

    for i in 0..50 {
        alice.insert(&format!("e{i}"), &format!("polygon {i} with a long description"));
    }
    // Let the throttle window close and publish.
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(alice_handle.statistics().snapshots_sent, 1);

    let (bob, bob_handle) = start(&hub, "@bob", Arc::new(MemoryCache::new()), Validators::default());
    loaded(&bob_handle).await;

    assert_eq!(bob.content(), alice.content());
    assert!(!bob_handle.status().load_failed);
}

#[tokio::test(start_paused = true)]
async fn test_restart_recovers_from_rocks_cache() {
    let dir = tempdir().unwrap();
    let config = CacheConfig::for_testing(dir.path().join("cache"));
    let hub = MemoryHub::new(Clock::starting_at(0));

    {
        let cache = Arc::new(RocksCache::open(&config).unwrap());
        let (document, handle) = start(&hub, "@alice", cache.clone(), Validators::default());
        loaded(&handle).await;
        document.insert("e1", "rect");
        document.insert("e2", "circle");
        for _ in 0..100 {
            if cached_content(cache.as_ref()).await.len() == 2 {
                break;
            }
            settle().await;
        }
        handle.destroy().await;
    }

    // Fresh hub: nothing in history, only the local cache remains.
    let hub = MemoryHub::new(Clock::starting_at(0));
    let cache = Arc::new(RocksCache::open(&config).unwrap());
    let (document, handle) = start(&hub, "@alice", cache.clone(), Validators::default());
    loaded(&handle).await;

    assert_eq!(document.get("e1"), Some("rect".to_string()));
    assert_eq!(document.get("e2"), Some("circle".to_string()));
    assert!(!handle.status().load_failed);

    let meta = cache.metadata(DOC).await.unwrap().unwrap();
    assert_eq!(meta.document_id, DOC);
    handle.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn test_broken_newer_snapshot_falls_back_to_older() {
    let hub = MemoryHub::new(Clock::starting_at(0));

    let good = YrsDocument::new();
    good.insert("e1", "rect");
    inject_snapshot(&hub, 1000, &good.store()).await;

    let bad = YrsDocument::new();
    bad.insert("e1", "bad");
    inject_snapshot(&hub, 2000, &bad.store()).await;

    let reject_bad: ContentValidator =
        Arc::new(|content: &DocumentContent| !content.values().any(|v| v == "bad"));
    let validators = Validators {
        content: Some(reject_bad.clone()),
        snapshot: Some(reject_bad),
    };
    let (document, handle) = start(&hub, "@bob", Arc::new(MemoryCache::new()), validators);
    loaded(&handle).await;

    assert_eq!(document.get("e1"), Some("rect".to_string()));
    assert_eq!(handle.statistics().snapshots_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_edits_publishes_one_snapshot_per_window() {
    let hub = MemoryHub::new(Clock::starting_at(0));
    let (document, handle) = start(&hub, "@alice", Arc::new(MemoryCache::new()), Validators::default());
    loaded(&handle).await;

    for i in 0..10 {
        document.insert(&format!("e{i}"), "rect");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(handle.statistics().snapshots_sent, 1);

    document.insert("late", "circle");
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(handle.statistics().snapshots_sent, 2);
    assert!(!handle.statistics().snapshot_outstanding);

    // Quiet period: nothing further is published.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(handle.statistics().snapshots_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn test_publish_recovers_after_outage_without_new_edits() {
    let hub = MemoryHub::new(Clock::starting_at(0));
    let transport = Arc::new(hub.connect("@alice"));
    let document = Arc::new(YrsDocument::new());
    let handle = DocumentSyncEngine::start(
        document.clone(),
        transport.clone(),
        Arc::new(MemoryCache::new()),
        DOC,
        Validators::default(),
        SyncConfig::for_testing(),
    );
    loaded(&handle).await;

    transport
        .set_failing_event_type(Some(DOCUMENT_CREATE_EVENT))
        .await;
    document.insert("e1", "rect");
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(handle.status().save_failed);

    transport.set_failing_event_type(None).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!handle.status().save_failed);
    assert!(!handle.statistics().snapshot_outstanding);
    assert_eq!(handle.statistics().snapshots_sent, 1);

    // The diff predates bob, so only the retried snapshot can carry it.
    let (bob, bob_handle) = start(&hub, "@bob", Arc::new(MemoryCache::new()), Validators::default());
    loaded(&bob_handle).await;
    assert_eq!(bob.get("e1"), Some("rect".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_statistics_are_observable() {
    let hub = MemoryHub::new(Clock::starting_at(0));
    let (document, handle) = start(&hub, "@alice", Arc::new(MemoryCache::new()), Validators::default());
    loaded(&handle).await;

    let mut stats = handle.observe_statistics();
    document.insert("e1", "rect");
    stats.wait_for(|s| s.snapshot_outstanding).await.unwrap();
    settle().await;

    handle.persist(false).await;
    let latest = *stats.borrow_and_update();
    assert!(!latest.snapshot_outstanding);
    assert_eq!(latest.snapshots_sent, 1);
    assert!(latest.content_size_in_bytes > 0);
}
