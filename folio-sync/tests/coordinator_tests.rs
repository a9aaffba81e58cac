use folio_sync::transport::mock::{MockDiscovery, MockNetwork};
use folio_sync::{
    ChannelProvider, Connection, ConflictResolutionStrategy, CoordinatorConfig,
    DiscoveryTransport, ErrorMessage, HelloAckMessage, LibrarySnapshot, MemoryDataStore,
    Resolution, RetryConfig, Role, SyncCoordinator, SyncError, SyncLogStatus, SyncStatus,
    TransferMessage,
};
use folio_types::{
    BookSyncData, BookmarkData, DeviceId, DeviceInfo, DeviceType, ItemId, ReadingProgressData,
    SyncData, SyncManifest, SyncPayload, Timestamp,
};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const A: &str = "device-a";
const B: &str = "device-b";

struct Peer {
    coordinator: SyncCoordinator,
    store: Arc<MemoryDataStore>,
    discovery: MockDiscovery,
    info: DeviceInfo,
}

impl Peer {
    fn id(&self) -> DeviceId {
        self.info.device_id.clone()
    }
}

fn info(id: &str, name: &str, version: &str) -> DeviceInfo {
    DeviceInfo::new(
        DeviceId::new(id).unwrap(),
        name,
        DeviceType::Android,
        version,
        "127.0.0.1".parse().unwrap(),
        8963,
    )
}

fn peer_with(
    network: &MockNetwork,
    info: DeviceInfo,
    library: LibrarySnapshot,
    configure: impl FnOnce(CoordinatorConfig) -> CoordinatorConfig,
) -> Peer {
    let store = Arc::new(MemoryDataStore::from_snapshot(library));
    let discovery = MockDiscovery::new();
    let config = CoordinatorConfig::new(info.clone())
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
        .with_handshake_timeout(Duration::from_secs(5))
        .with_manifest_timeout(Duration::from_secs(5))
        .with_transfer_timeout(Duration::from_secs(5));
    let coordinator = SyncCoordinator::new(
        configure(config),
        store.clone(),
        Arc::new(discovery.clone()),
        Arc::new(network.provider(info.device_id.clone())),
    );
    Peer {
        coordinator,
        store,
        discovery,
        info,
    }
}

fn peer(network: &MockNetwork, id: &str, name: &str, library: LibrarySnapshot) -> Peer {
    peer_with(network, info(id, name, "1.4.0"), library, |c| c)
}

fn book(id: &str, title: &str, updated: i64) -> BookSyncData {
    BookSyncData {
        book_id: id.into(),
        title: title.into(),
        author: "Author".into(),
        cover_url: None,
        source_id: 1,
        source_url: format!("https://example.org/{id}"),
        favorite: false,
        added_at: Timestamp::from_millis(1),
        updated_at: Timestamp::from_millis(updated),
        file_hash: None,
    }
}

fn progress(book_id: &str, chapter: u32, offset: u32, read_at: i64) -> ReadingProgressData {
    ReadingProgressData {
        book_id: book_id.into(),
        chapter_id: format!("ch{chapter}"),
        chapter_index: chapter,
        offset,
        progress: chapter as f32 / 20.0,
        last_read_at: Timestamp::from_millis(read_at),
    }
}

fn bookmark(id: &str, book_id: &str) -> BookmarkData {
    BookmarkData {
        bookmark_id: id.into(),
        book_id: book_id.into(),
        chapter_id: "ch1".into(),
        position: 7,
        note: None,
        created_at: Timestamp::from_millis(5),
    }
}

async fn connect_pair(a: &Peer, b: &Peer) -> (Connection, Connection) {
    let (ca, cb) = tokio::join!(
        a.coordinator.connect_to_device(&b.info),
        b.coordinator.connect_to_device(&a.info)
    );
    (ca.unwrap(), cb.unwrap())
}

fn titles(snapshot: &LibrarySnapshot) -> Vec<(String, String)> {
    snapshot
        .books
        .values()
        .map(|b| (b.book_id.clone(), b.title.clone()))
        .collect()
}

// ── Full sync ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn two_peers_converge() {
    let network = MockNetwork::new();
    let a = peer(
        &network,
        A,
        "Laptop",
        LibrarySnapshot::default()
            .with_books([book("b1", "Dune", 10), book("b2", "Emma", 10)])
            .with_bookmarks([bookmark("m1", "b1")]),
    );
    let b = peer(
        &network,
        B,
        "Tablet",
        LibrarySnapshot::default()
            .with_books([book("b3", "Ulysses", 10)])
            .with_progress([progress("b3", 4, 100, 50)]),
    );

    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    let ra = ra.unwrap();
    let rb = rb.unwrap();

    assert_eq!(ra.device_id, b.id());
    assert_eq!(ra.items_sent, 3);
    assert_eq!(ra.items_received, 2);
    assert_eq!(rb.items_sent, 2);
    assert_eq!(rb.items_received, 3);
    assert_eq!(ra.items_transferred, 5);

    let sa = a.store.snapshot().await;
    let sb = b.store.snapshot().await;
    assert_eq!(titles(&sa), titles(&sb));
    assert_eq!(sa.books.len(), 3);
    assert_eq!(sa.reading_progress, sb.reading_progress);
    assert_eq!(sa.bookmarks, sb.bookmarks);

    // A second run has nothing to move.
    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    assert_eq!(ra.unwrap().items_transferred, 0);
    assert_eq!(rb.unwrap().items_transferred, 0);
}

#[tokio::test(start_paused = true)]
async fn explicit_exchange_then_perform() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());

    let (ca, cb) = connect_pair(&a, &b).await;
    assert_eq!(ca.role, Role::Server);
    assert_eq!(cb.role, Role::Client);
    assert_eq!(ca.device_name, "Tablet");

    let (ma, mb) = tokio::join!(
        a.coordinator.exchange_manifests(&ca),
        b.coordinator.exchange_manifests(&cb)
    );
    let (la, ra) = ma.unwrap();
    let (lb, rb) = mb.unwrap();
    assert_eq!(la, rb);
    assert_eq!(lb, ra);
    assert_eq!(ra.len(), 0);

    let (pa, pb) = tokio::join!(
        a.coordinator.perform_sync(&ca, &la, &ra),
        b.coordinator.perform_sync(&cb, &lb, &rb)
    );
    assert_eq!(pa.unwrap().items_sent, 1);
    assert_eq!(pb.unwrap().items_received, 1);
    assert_eq!(b.coordinator.get_books_to_sync().await.unwrap(), vec![book("b1", "Dune", 1)]);
}

#[tokio::test(start_paused = true)]
async fn connecting_twice_reuses_the_connection() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());

    let (ca, _cb) = connect_pair(&a, &b).await;
    let again = a.coordinator.connect_to_device(&b.info).await.unwrap();
    assert_eq!(again, ca);
    assert_eq!(a.coordinator.connections().len(), 1);
    assert_eq!(a.coordinator.current_connection(), Some(ca));
    assert_eq!(network.roles_of(&a.id()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_returns_to_idle() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());

    let (ca, _cb) = connect_pair(&a, &b).await;
    a.coordinator.disconnect_from_device(&ca).await.unwrap();

    assert!(a.coordinator.current_connection().is_none());
    assert_eq!(a.coordinator.current_status(), SyncStatus::Idle);
    let local = SyncManifest::empty(a.id(), Timestamp::now());
    let remote = SyncManifest::empty(b.id(), Timestamp::now());
    assert!(matches!(
        a.coordinator.perform_sync(&ca, &local, &remote).await,
        Err(SyncError::ConnectionFailed(_))
    ));
}

// ── Conflicts ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn newer_edit_wins_on_both_sides() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default().with_books([book("b1", "Old Title", 100)]));
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default().with_books([book("b1", "New Title", 200)]));

    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    assert_eq!(ra.unwrap().conflicts, 1);
    assert_eq!(rb.unwrap().conflicts, 1);

    assert_eq!(a.store.snapshot().await.books["b1"].title, "New Title");
    assert_eq!(b.store.snapshot().await.books["b1"].title, "New Title");
}

#[tokio::test(start_paused = true)]
async fn merge_keeps_furthest_progress_on_both_sides() {
    let network = MockNetwork::new();
    let merge = |c: CoordinatorConfig| c.with_conflict_strategy(ConflictResolutionStrategy::Merge);
    let a = peer_with(
        &network,
        info(A, "Laptop", "1.4.0"),
        LibrarySnapshot::default().with_progress([progress("b1", 9, 0, 100)]),
        merge,
    );
    let b = peer_with(
        &network,
        info(B, "Tablet", "1.4.0"),
        LibrarySnapshot::default().with_progress([progress("b1", 2, 50, 900)]),
        merge,
    );

    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    ra.unwrap();
    rb.unwrap();

    let pa = a.store.snapshot().await.reading_progress["b1"].clone();
    let pb = b.store.snapshot().await.reading_progress["b1"].clone();
    assert_eq!(pa, pb);
    assert_eq!(pa.position(), (9, 0));
    assert_eq!(pa.last_read_at, Timestamp::from_millis(900));
}

#[tokio::test(start_paused = true)]
async fn manual_conflicts_fail_before_transfer() {
    let network = MockNetwork::new();
    let a = peer_with(
        &network,
        info(A, "Laptop", "1.4.0"),
        LibrarySnapshot::default().with_books([book("b1", "Mine", 1), book("b2", "Only A", 1)]),
        |c| c.with_conflict_strategy(ConflictResolutionStrategy::Manual),
    );
    let b = peer(
        &network,
        B,
        "Tablet",
        LibrarySnapshot::default().with_books([book("b1", "Theirs", 2)]),
    );
    let before_a = a.store.snapshot().await;
    let before_b = b.store.snapshot().await;

    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    match ra {
        Err(SyncError::ConflictResolutionFailed(msg)) => assert!(msg.contains("book:b1")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(rb, Err(SyncError::ConflictResolutionFailed(_))));

    assert_eq!(a.store.snapshot().await.books, before_a.books);
    assert_eq!(b.store.snapshot().await.books, before_b.books);
    assert!(a.coordinator.current_connection().is_none());
}

#[tokio::test(start_paused = true)]
async fn abort_reason_is_read_after_the_peer_hangs_up() {
    let network = MockNetwork::new();
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));
    let a_info = info(A, "Laptop", "1.4.0");

    // A plays the server by hand: it aborts right after the manifests and
    // hangs up before B gets to send its data.
    let a_side = network.provider(a_info.device_id.clone()).open_channel(&b.info);
    let scripted = async {
        a_side.connect(&b.info, Role::Server).await.unwrap();
        assert!(matches!(a_side.receive().await.unwrap(), TransferMessage::Hello(_)));
        a_side
            .send(TransferMessage::HelloAck(HelloAckMessage::accept(a_info.clone())))
            .await
            .unwrap();
        assert!(matches!(a_side.receive().await.unwrap(), TransferMessage::Manifest(_)));
        a_side
            .send(TransferMessage::Manifest(SyncManifest::empty(
                a_info.device_id.clone(),
                Timestamp::now(),
            )))
            .await
            .unwrap();
        a_side
            .send(TransferMessage::Error(ErrorMessage::from_error(
                &SyncError::ConflictResolutionFailed("book:b1 needs a decision".into()),
            )))
            .await
            .unwrap();
        a_side.disconnect().await.unwrap();
    };

    let (result, ()) = tokio::join!(b.coordinator.sync_with_device(&a_info), scripted);
    match result {
        Err(SyncError::ConflictResolutionFailed(msg)) => assert!(msg.contains("book:b1")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(b.coordinator.current_connection().is_none());
    assert_eq!(b.store.snapshot().await.books.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_overrides_settle_conflicts() {
    let network = MockNetwork::new();
    let manual = |c: CoordinatorConfig| c.with_conflict_strategy(ConflictResolutionStrategy::Manual);
    let a = peer_with(
        &network,
        info(A, "Laptop", "1.4.0"),
        LibrarySnapshot::default().with_books([book("b1", "Keep This", 1)]),
        manual,
    );
    let b = peer_with(
        &network,
        info(B, "Tablet", "1.4.0"),
        LibrarySnapshot::default().with_books([book("b1", "Drop This", 2)]),
        manual,
    );

    let (ca, cb) = connect_pair(&a, &b).await;
    let (ma, mb) = tokio::join!(
        a.coordinator.exchange_manifests(&ca),
        b.coordinator.exchange_manifests(&cb)
    );
    let (la, ra) = ma.unwrap();
    let (lb, rb) = mb.unwrap();

    let keep_a = HashMap::from([(ItemId::book("b1"), Resolution::KeepLocal)]);
    let take_a = HashMap::from([(ItemId::book("b1"), Resolution::KeepRemote)]);
    let (pa, pb) = tokio::join!(
        a.coordinator.perform_sync_with_overrides(&ca, &la, &ra, &keep_a),
        b.coordinator.perform_sync_with_overrides(&cb, &lb, &rb, &take_a)
    );
    pa.unwrap();
    pb.unwrap();

    assert_eq!(a.store.snapshot().await.books["b1"].title, "Keep This");
    assert_eq!(b.store.snapshot().await.books["b1"].title, "Keep This");
}

// ── Handshake checks ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn incompatible_versions_never_open_a_channel() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer_with(&network, info(B, "Tablet", "2.0.0"), LibrarySnapshot::default(), |c| c);

    let result = a.coordinator.connect_to_device(&b.info).await;
    assert_eq!(
        result.err(),
        Some(SyncError::incompatible("1.4.0", "2.0.0"))
    );
    assert!(network.roles_of(&a.id()).is_empty());
    assert_eq!(network.sent_count(), 0);
    assert_eq!(a.coordinator.current_status(), SyncStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn untrusted_peer_is_refused() {
    let network = MockNetwork::new();
    let a = peer_with(
        &network,
        info(A, "Laptop", "1.4.0"),
        LibrarySnapshot::default(),
        |c| c.with_trusted_devices_only(true),
    );
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());

    let (ra, rb) = tokio::join!(
        a.coordinator.connect_to_device(&b.info),
        b.coordinator.connect_to_device(&a.info)
    );
    assert!(matches!(ra, Err(SyncError::AuthenticationFailed(_))));
    // B dialed but never got an answer.
    assert!(matches!(rb, Err(SyncError::ConnectionFailed(_))));
}

#[tokio::test(start_paused = true)]
async fn trusted_peer_syncs_and_is_stamped() {
    let network = MockNetwork::new();
    let a = peer_with(
        &network,
        info(A, "Laptop", "1.4.0"),
        LibrarySnapshot::default(),
        |c| c.with_trusted_devices_only(true),
    );
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));
    a.coordinator.trust_device(&b.info).await.unwrap();

    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    ra.unwrap();
    rb.unwrap();

    let trusted = a.coordinator.trusted_devices().await.unwrap();
    assert_eq!(trusted.len(), 1);
    assert!(trusted[0].last_synced.is_some());

    assert!(a.coordinator.untrust_device(&b.id()).await.unwrap());
    assert!(a.coordinator.trusted_devices().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connecting_to_self_fails() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    assert!(matches!(
        a.coordinator.connect_to_device(&a.info).await,
        Err(SyncError::ConnectionFailed(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_is_connection_failure() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let ghost = info("device-z", "Ghost", "1.4.0");

    assert!(matches!(
        a.coordinator.connect_to_device(&ghost).await,
        Err(SyncError::ConnectionFailed(_))
    ));
    assert!(matches!(
        a.coordinator.current_status(),
        SyncStatus::Idle
    ));
}

#[tokio::test(start_paused = true)]
async fn vanished_peer_is_device_not_found_while_discovering() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    a.coordinator.start_discovery().await.unwrap();
    let ghost = info("device-z", "Ghost", "1.4.0");

    assert_eq!(
        a.coordinator.connect_to_device(&ghost).await.err(),
        Some(SyncError::DeviceNotFound("device-z".into()))
    );
    assert_eq!(a.coordinator.current_status(), SyncStatus::Discovering);
}

#[tokio::test(start_paused = true)]
async fn transient_connect_failures_are_retried() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());
    network.fail_next_connects(2);

    let (ra, rb) = tokio::join!(
        a.coordinator.connect_to_device(&b.info),
        b.coordinator.connect_to_device(&a.info)
    );
    assert!(ra.is_ok());
    assert!(rb.is_ok());
}

// ── Storage failures ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn insufficient_space_aborts_both_sides() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));
    a.store.set_available_space(Some(8));

    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    assert!(matches!(ra, Err(SyncError::InsufficientStorage { available: 8, .. })));
    assert!(matches!(rb, Err(SyncError::TransferFailed(_))));
    assert!(a.store.snapshot().await.books.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_apply_leaves_library_unchanged() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default().with_books([book("b0", "Mine", 1)]));
    let b = peer(
        &network,
        B,
        "Tablet",
        LibrarySnapshot::default().with_books([book("b1", "One", 1), book("b2", "Two", 1)]),
    );
    a.store.fail_next_apply_after(1);

    let (ra, _rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    assert!(matches!(ra, Err(SyncError::Storage(_))));
    assert_eq!(titles(&a.store.snapshot().await), vec![("b0".to_string(), "Mine".to_string())]);

    let logs = a.coordinator.sync_logs(&b.id()).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncLogStatus::Failed);
    assert!(logs[0].error_message.as_deref().unwrap().contains("storage"));
}

// ── Status ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn status_walks_through_a_sync() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());
    let mut statuses = a.coordinator.observe_sync_status();

    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    ra.unwrap();
    rb.unwrap();

    let mut seen = Vec::new();
    while let Some(status) = statuses.try_next() {
        seen.push(status);
    }

    assert_eq!(seen.first(), Some(&SyncStatus::Idle));
    assert!(seen.contains(&SyncStatus::Connecting {
        device_name: "Tablet".into()
    }));

    let progress: Vec<f32> = seen.iter().filter_map(SyncStatus::progress).collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&1.0));

    let n = seen.len();
    assert!(matches!(
        &seen[n - 2],
        SyncStatus::Completed { device_name, items_synced: 1, .. } if device_name == "Tablet"
    ));
    assert_eq!(seen[n - 1], SyncStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn failure_is_published_then_settles() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer_with(&network, info(B, "Tablet", "9.0.0"), LibrarySnapshot::default(), |c| c);
    let mut statuses = a.coordinator.observe_sync_status();

    let _ = a.coordinator.sync_with_device(&b.info).await;

    let mut seen = Vec::new();
    while let Some(status) = statuses.try_next() {
        seen.push(status);
    }
    let n = seen.len();
    assert!(matches!(
        &seen[n - 2],
        SyncStatus::Failed { error: SyncError::IncompatibleVersion { .. }, .. }
    ));
    assert_eq!(seen[n - 1], SyncStatus::Idle);
}

// ── Cancellation ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancel_stops_a_stuck_sync() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());
    let (ca, _cb) = connect_pair(&a, &b).await;

    // B never takes part, so A waits on B's data.
    let local = a.coordinator.build_local_manifest().await.unwrap();
    let remote = SyncManifest::empty(b.id(), Timestamp::now());
    let runner = {
        let coordinator = a.coordinator.clone();
        tokio::spawn(async move { coordinator.perform_sync(&ca, &local, &remote).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(a.coordinator.is_syncing());

    a.coordinator.cancel_sync();
    let result = tokio::time::timeout(Duration::from_secs(1), runner)
        .await
        .expect("cancelled sync must finish promptly")
        .unwrap();

    assert_eq!(result, Err(SyncError::Cancelled));
    assert!(!a.coordinator.is_syncing());
    assert_eq!(a.coordinator.current_status(), SyncStatus::Idle);
    assert!(a.coordinator.current_connection().is_none());

    let logs = a.coordinator.sync_logs(&b.id()).await.unwrap();
    assert_eq!(logs[0].status, SyncLogStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancel_reaches_queued_syncs() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());
    let (ca, _cb) = connect_pair(&a, &b).await;
    let local = a.coordinator.build_local_manifest().await.unwrap();
    let remote = SyncManifest::empty(b.id(), Timestamp::now());

    let runners: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = a.coordinator.clone();
            let (ca, local, remote) = (ca.clone(), local.clone(), remote.clone());
            tokio::spawn(async move { coordinator.perform_sync(&ca, &local, &remote).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_secs(1)).await;
    a.coordinator.cancel_sync();

    for runner in runners {
        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(SyncError::Cancelled));
    }
    assert_eq!(a.coordinator.current_status(), SyncStatus::Idle);

    // None of the queued syncs ran its pipeline after the cancel.
    let logs = a.coordinator.sync_logs(&b.id()).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert!(logs.iter().all(|l| l.status == SyncLogStatus::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn cancel_with_nothing_running_is_a_no_op() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let mut statuses = a.coordinator.observe_sync_status();
    assert_eq!(statuses.next().await, Some(SyncStatus::Idle));

    a.coordinator.cancel_sync();
    assert_eq!(statuses.try_next(), None);

    // A later sync is unaffected by the earlier cancel.
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());
    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    assert!(ra.is_ok() && rb.is_ok());
}

// ── Concurrency ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrent_syncs_on_one_connection_queue() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default().with_books([book("b2", "Emma", 1)]));
    let (ca, cb) = connect_pair(&a, &b).await;
    let (ma, mb) = tokio::join!(
        a.coordinator.exchange_manifests(&ca),
        b.coordinator.exchange_manifests(&cb)
    );
    let (la, ra) = ma.unwrap();
    let (lb, rb) = mb.unwrap();

    let a_runs = join_all((0..5).map(|_| a.coordinator.perform_sync(&ca, &la, &ra)));
    let b_run = b.coordinator.perform_sync(&cb, &lb, &rb);
    let (a_results, b_result) = tokio::join!(a_runs, b_run);

    assert!(b_result.is_ok());
    assert!(a_results.iter().filter(|r| r.is_ok()).count() >= 1);
    assert!(!a.coordinator.is_syncing());
    assert!(matches!(
        a.coordinator.current_status(),
        SyncStatus::Idle
    ));
    assert_eq!(a.store.snapshot().await.books.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn syncs_with_different_devices_do_not_block_each_other() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());
    let c = peer(&network, "device-c", "Phone", LibrarySnapshot::default());

    let (rab, rac, rb, rc) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        a.coordinator.sync_with_device(&c.info),
        b.coordinator.sync_with_device(&a.info),
        c.coordinator.sync_with_device(&a.info)
    );
    assert!(rab.is_ok() && rac.is_ok() && rb.is_ok() && rc.is_ok());
    assert_eq!(a.coordinator.connections().len(), 2);
    assert_eq!(c.store.snapshot().await.books.len(), 1);
}

// ── Bookkeeping ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn last_sync_time_never_moves_backwards() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = DeviceId::new(B).unwrap();

    assert_eq!(a.coordinator.get_last_sync_time(&b).await.unwrap(), None);
    a.coordinator
        .update_last_sync_time(&b, Timestamp::from_millis(200))
        .await
        .unwrap();
    a.coordinator
        .update_last_sync_time(&b, Timestamp::from_millis(100))
        .await
        .unwrap();
    assert_eq!(
        a.coordinator.get_last_sync_time(&b).await.unwrap(),
        Some(Timestamp::from_millis(200))
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_last_sync_updates_keep_the_latest() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = DeviceId::new(B).unwrap();

    let updates = (1..=50).rev().map(|t| {
        a.coordinator
            .update_last_sync_time(&b, Timestamp::from_millis(t * 10))
    });
    for result in join_all(updates).await {
        result.unwrap();
    }
    assert_eq!(
        a.coordinator.get_last_sync_time(&b).await.unwrap(),
        Some(Timestamp::from_millis(500))
    );
}

#[tokio::test(start_paused = true)]
async fn successful_sync_is_logged_and_timestamped() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]));

    let (ra, rb) = tokio::join!(
        a.coordinator.sync_with_device(&b.info),
        b.coordinator.sync_with_device(&a.info)
    );
    ra.unwrap();
    rb.unwrap();

    assert!(a.coordinator.get_last_sync_time(&b.id()).await.unwrap().is_some());
    let logs = a.coordinator.sync_logs(&b.id()).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncLogStatus::Completed);
    assert_eq!(logs[0].items_synced, 1);
    assert!(logs[0].error_message.is_none());
}

#[tokio::test(start_paused = true)]
async fn reading_progress_writes_are_debounced() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());

    for offset in 0..10 {
        a.coordinator
            .update_reading_progress(progress("b1", 3, offset * 100, 1_000 + offset as i64));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(a.store.progress_write_count(), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(a.store.progress_write_count(), 1);
    let saved = a.coordinator.get_reading_progress().await.unwrap();
    assert_eq!(saved, vec![progress("b1", 3, 900, 1_009)]);
}

#[tokio::test(start_paused = true)]
async fn apply_sync_rejects_tampered_data() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let mut data = SyncData::from_payloads(
        DeviceId::new(B).unwrap(),
        Timestamp::now(),
        vec![SyncPayload::Book(book("b1", "Dune", 1))],
    );
    assert_eq!(a.coordinator.apply_sync(&data).await.unwrap(), 1);

    data.books[0].title = "Forged".into();
    assert!(matches!(
        a.coordinator.apply_sync(&data).await,
        Err(SyncError::TransferFailed(_))
    ));
    assert_eq!(a.coordinator.get_books_to_sync().await.unwrap()[0].title, "Dune");
}

#[tokio::test(start_paused = true)]
async fn local_manifest_lists_every_item() {
    let network = MockNetwork::new();
    let a = peer(
        &network,
        A,
        "Laptop",
        LibrarySnapshot::default()
            .with_books([book("b1", "Dune", 1)])
            .with_progress([progress("b1", 1, 0, 1)])
            .with_bookmarks([bookmark("m1", "b1")]),
    );

    let manifest = a.coordinator.build_local_manifest().await.unwrap();
    let ids: Vec<_> = manifest.item_ids().cloned().collect();
    assert_eq!(
        ids,
        vec![ItemId::book("b1"), ItemId::bookmark("m1"), ItemId::progress("b1")]
    );
    assert_eq!(manifest.device_id, a.id());
    assert_eq!(a.coordinator.get_bookmarks().await.unwrap().len(), 1);
}

// ── Discovery ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn discovery_tracks_announced_devices() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = info(B, "Tablet", "1.4.0");

    let mut devices = a.coordinator.observe_discovered_devices();
    assert_eq!(devices.next().await, Some(vec![]));

    a.coordinator.start_discovery().await.unwrap();
    assert_eq!(a.coordinator.current_status(), SyncStatus::Discovering);
    assert_eq!(a.discovery.broadcasting().map(|d| d.device_id), Some(a.id()));

    assert!(a.discovery.announce(b.clone()));
    let seen = devices.next().await.unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].device_info.device_name, "Tablet");

    assert!(a.discovery.lose(b.device_id.clone()));
    assert_eq!(devices.next().await, Some(vec![]));

    a.coordinator.stop_discovery().await.unwrap();
    assert_eq!(a.coordinator.current_status(), SyncStatus::Idle);
    assert!(a.discovery.broadcasting().is_none());
    assert!(!a.discovery.is_listening());
}

#[tokio::test(start_paused = true)]
async fn starting_discovery_twice_is_a_no_op() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());

    a.coordinator.start_discovery().await.unwrap();
    a.coordinator.start_discovery().await.unwrap();
    assert_eq!(a.discovery.start_count(), 1);

    a.coordinator.stop_discovery().await.unwrap();
    a.coordinator.stop_discovery().await.unwrap();
    assert!(!a.coordinator.is_discovering());
}

#[tokio::test(start_paused = true)]
async fn failed_discovery_start_is_reported() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    a.discovery.fail_next_start(SyncError::NetworkUnavailable);

    assert_eq!(
        a.coordinator.start_discovery().await,
        Err(SyncError::NetworkUnavailable)
    );
    assert!(!a.coordinator.is_discovering());
    assert!(a.discovery.broadcasting().is_none());
}

#[tokio::test(start_paused = true)]
async fn discovery_ending_on_its_own_returns_to_idle() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let mut devices = a.coordinator.observe_discovered_devices();
    assert_eq!(devices.next().await, Some(vec![]));

    a.coordinator.start_discovery().await.unwrap();
    assert!(a.coordinator.is_discovering());
    a.discovery.announce(info(B, "Tablet", "1.4.0"));
    assert_eq!(devices.next().await.map(|d| d.len()), Some(1));

    // The transport drops its event stream without being asked to.
    a.discovery.stop_discovery().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!a.coordinator.is_discovering());
    assert_eq!(a.coordinator.current_status(), SyncStatus::Idle);
    assert!(a.coordinator.discovered_devices().is_empty());

    // Discovery can be started again afterwards.
    a.coordinator.start_discovery().await.unwrap();
    assert_eq!(a.discovery.start_count(), 2);
    assert_eq!(a.coordinator.current_status(), SyncStatus::Discovering);
}

#[tokio::test(start_paused = true)]
async fn silent_devices_expire_from_the_set() {
    let network = MockNetwork::new();
    let a = peer_with(
        &network,
        info(A, "Laptop", "1.4.0"),
        LibrarySnapshot::default(),
        |c| c.with_discovery_timing(Duration::from_secs(3), Duration::from_secs(1)),
    );
    a.coordinator.start_discovery().await.unwrap();
    a.discovery.announce(info(B, "Tablet", "1.4.0"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.coordinator.discovered_devices().len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(a.coordinator.discovered_devices().is_empty());
}

// ── Auto-sync ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn auto_sync_converges_discovered_peers() {
    let network = MockNetwork::new();
    let fast = |c: CoordinatorConfig| {
        c.with_auto_sync_interval(Duration::from_secs(10))
            .with_discovery_timing(Duration::from_secs(600), Duration::from_secs(5))
    };
    let a = peer_with(
        &network,
        info(A, "Laptop", "1.4.0"),
        LibrarySnapshot::default().with_books([book("b1", "Dune", 1)]),
        fast,
    );
    let b = peer_with(
        &network,
        info(B, "Tablet", "1.4.0"),
        LibrarySnapshot::default().with_books([book("b2", "Emma", 1)]),
        fast,
    );

    a.coordinator.start_discovery().await.unwrap();
    b.coordinator.start_discovery().await.unwrap();
    a.discovery.announce(b.info.clone());
    b.discovery.announce(a.info.clone());

    let auto_a = a.coordinator.start_auto_sync();
    let auto_b = b.coordinator.start_auto_sync();
    assert!(auto_a.is_running());

    let mut converged = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if a.store.snapshot().await.books.len() == 2 && b.store.snapshot().await.books.len() == 2 {
            converged = true;
            break;
        }
    }
    assert!(converged, "auto-sync never converged");

    auto_a.stop();
    drop(auto_b);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!auto_a.is_running());
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_everything() {
    let network = MockNetwork::new();
    let a = peer(&network, A, "Laptop", LibrarySnapshot::default());
    let b = peer(&network, B, "Tablet", LibrarySnapshot::default());
    a.coordinator.start_discovery().await.unwrap();
    let auto = a.coordinator.start_auto_sync();
    connect_pair(&a, &b).await;

    a.coordinator.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!auto.is_running());
    assert!(!a.coordinator.is_discovering());
    assert!(a.coordinator.connections().is_empty());
    assert_eq!(a.coordinator.current_status(), SyncStatus::Idle);
}
