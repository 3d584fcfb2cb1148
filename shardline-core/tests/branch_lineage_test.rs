//! Branch lineage, catch-up and failover tests

mod common;

use common::{TestRegion, test_config};
use shardline_core::testing::kv::{KvProtocol, KvRead, KvWrite, MemoryStore};
use shardline_core::{
    AckPolicy, Broadcaster, BranchHistoryStore, BranchId, DirectoryEntry, Error,
    InMemoryBranchHistory, OrderToken, Region, Version,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn write_n(region: &TestRegion, n: usize) {
    let never = CancellationToken::new();
    for i in 0..n {
        region
            .broadcaster
            .write(
                KvWrite::single(format!("k{}", i), i.to_string()),
                OrderToken::ignore(),
                &AckPolicy::AtLeast(1),
                None,
                &never,
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_unrelated_history_is_rejected() {
    let region = TestRegion::start(test_config());
    let store = Arc::new(MemoryStore::with_contents(
        Region::universe(),
        BTreeMap::new(),
        Version::new(BranchId::new(), 3),
    ));
    let err = region.join_with(store).await.unwrap_err();
    assert!(matches!(err, Error::BranchLineageRejected(_)), "got {:?}", err);
    assert!(region.broadcaster.listeners().is_empty());
}

#[tokio::test]
async fn test_replica_ahead_of_branch_is_rejected() {
    let region = TestRegion::start(test_config());
    write_n(&region, 2).await;
    let store = Arc::new(MemoryStore::with_contents(
        Region::universe(),
        BTreeMap::new(),
        Version::new(region.broadcaster.branch_id(), 9),
    ));
    let err = region.join_with(store).await.unwrap_err();
    assert!(matches!(err, Error::BranchLineageRejected(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_region_mismatch_is_rejected() {
    let region = TestRegion::start(test_config());
    let store = Arc::new(MemoryStore::new(Region::range("a", "m")));
    let err = region.join_with(store).await.unwrap_err();
    assert!(matches!(err, Error::BranchLineageRejected(_)));
}

#[tokio::test]
async fn test_absent_broadcaster() {
    let region = TestRegion::start(test_config());
    region.broadcaster_entry.retract();
    let store = Arc::new(MemoryStore::new(Region::universe()));
    let err = region.join_with(store).await.unwrap_err();
    assert!(matches!(err, Error::CannotPerformQuery(_)));
}

#[tokio::test]
async fn test_catch_up_from_write_log() {
    let region = TestRegion::start(test_config());
    write_n(&region, 5).await;

    let (listener, store) = region.add_listener().await;
    listener
        .wait_for_version(5, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.get("k4").as_deref(), Some("4"));
    assert_eq!(store.applied_versions().len(), 5);
    assert!(!listener.stats().backfilled);
    assert_eq!(region.broadcaster.stats().snapshot_transfers, 0);
}

#[tokio::test]
async fn test_catch_up_from_snapshot() {
    let region = TestRegion::start(test_config().with_max_log_size(2));
    write_n(&region, 5).await;

    let (listener, store) = region.add_listener().await;
    assert_eq!(listener.applied_version().timestamp, 5);
    assert_eq!(store.get("k0").as_deref(), Some("0"));
    assert!(store.applied_versions().is_empty());
    assert!(listener.stats().backfilled);
    assert_eq!(region.broadcaster.stats().snapshot_transfers, 1);

    // Streaming continues after the backfill
    write_n(&region, 1).await;
    listener
        .wait_for_version(6, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(store.applied_versions().len(), 1);
}

#[tokio::test]
async fn test_snapshot_failure_is_not_a_lineage_rejection() {
    let region = TestRegion::start(test_config().with_max_log_size(2));
    write_n(&region, 5).await;
    region.store.set_fail_snapshots(true);

    let store = Arc::new(MemoryStore::new(Region::universe()));
    let err = region.join_with(store.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)), "got {:?}", err);
    assert!(region.broadcaster.listeners().is_empty());
    assert_eq!(store.get("k0"), None);
}

#[tokio::test]
async fn test_failover_to_promoted_replica() {
    let region = TestRegion::start(test_config());
    let (master, master_entry) = region.add_master(AckPolicy::AtLeast(1));
    let access = region.client(&master_entry);
    let never = CancellationToken::new();

    let (listener, promoted_store) = region.add_listener().await;
    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
        let token = access.new_write_token();
        access.write(KvWrite::single(key, value), token, &never).await.unwrap();
    }
    listener.wait_for_version(3, &never).await.unwrap();
    let old_branch = region.broadcaster.branch_id();
    listener.shutdown();

    // Promote the replica: a new branch forks from its store
    let promoted = Arc::new(
        Broadcaster::<KvProtocol>::new(
            region.cluster.join(),
            region.history.clone(),
            promoted_store.clone(),
            region.config.clone(),
        )
        .unwrap(),
    );
    let new_branch = promoted.branch_id();
    let metadata = region.history.get(new_branch).unwrap();
    assert_eq!(metadata.parent, Some(old_branch));
    assert_eq!(metadata.origin, Version::new(old_branch, 3));
    master.set_broadcaster(promoted.clone()).unwrap();

    let token = access.new_write_token();
    access.write(KvWrite::single("d", "4"), token, &never).await.unwrap();
    assert_eq!(promoted.latest_version(), Version::new(new_branch, 4));

    let token = access.new_read_token();
    let response = access.read(KvRead::keys(["a", "d"]), token, &never).await.unwrap();
    assert_eq!(response.get("a"), Some("1"));
    assert_eq!(response.get("d"), Some("4"));

    // The old broadcaster's store is a prefix of the new branch and can follow it
    let promoted_entry = DirectoryEntry::new(promoted.get_business_card());
    let follower = shardline_core::Listener::join(
        region.cluster.join(),
        promoted_entry.view(),
        region.history.clone(),
        region.store.clone(),
        &region.config,
        &never,
    )
    .await
    .unwrap();
    follower.wait_for_version(4, &never).await.unwrap();
    assert_eq!(region.store.get("d").as_deref(), Some("4"));

    // A replica that kept writing on the old branch after the fork has diverged
    let diverged = Arc::new(MemoryStore::with_contents(
        Region::universe(),
        BTreeMap::new(),
        Version::new(old_branch, 5),
    ));
    let err = shardline_core::Listener::join(
        region.cluster.join(),
        promoted_entry.view(),
        region.history.clone(),
        diverged,
        &region.config,
        &never,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, Error::BranchLineageRejected(_)));
}

#[tokio::test]
async fn test_history_survives_export() {
    let region = TestRegion::start(test_config());
    let (listener, store) = region.add_listener().await;
    write_n(&region, 2).await;
    listener
        .wait_for_version(2, &CancellationToken::new())
        .await
        .unwrap();
    listener.shutdown();

    let promoted = Broadcaster::<KvProtocol>::new(
        region.cluster.join(),
        region.history.clone(),
        store,
        region.config.clone(),
    )
    .unwrap();

    let json = region.history.to_json().unwrap();
    let restored = InMemoryBranchHistory::from_json(&json).unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored.is_ancestor(region.broadcaster.branch_id(), promoted.branch_id()));
    assert!(restored.version_is_ancestor(
        Version::new(region.broadcaster.branch_id(), 2),
        promoted.branch_id()
    ));
}
