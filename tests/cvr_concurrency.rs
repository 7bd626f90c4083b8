//! Multi-process arbitration: optimistic version compare, ownership lease,
//! and catch-up patch streams.

mod common;

use common::{contents, desired_ast, ref_counts, row_id, test_db};
use serde_json::json;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;

use viewsyncd::cvr::{ConfigUpdater, ExecutedQuery, QueryUpdater, RowUpdate};
use viewsyncd::error::CvrError;
use vsync_proto::{CvrVersion, Patch};

#[tokio::test]
async fn test_external_version_bump_causes_concurrent_modification() {
    let db = test_db().await;

    // Process A loads.
    let store_a = Arc::new(db.cvr_as("g", "task-a"));
    let cvr_a = store_a.load(100).await.unwrap();

    // Process B loads and flushes a change first.
    let store_b = Arc::new(db.cvr_as("g", "task-b"));
    let cvr_b = store_b.load(200).await.unwrap();
    let mut updater_b = ConfigUpdater::new(Arc::clone(&store_b), cvr_b);
    updater_b.ensure_client("bee");
    updater_b.flush(200, 500, 500).await.unwrap();

    // A's flush must fail: its base version is stale.
    let mut updater_a = ConfigUpdater::new(Arc::clone(&store_a), cvr_a);
    updater_a.ensure_client("aye");
    let err = updater_a.flush(100, 999, 999).await.unwrap_err();
    assert!(matches!(err, CvrError::ConcurrentModification { .. }));
    assert!(err.round_restartable());

    // The failed flush left storage untouched: B's activity clocks stand.
    let row = sqlx::query(
        "SELECT last_active, ttl_clock FROM cvr_instances WHERE client_group_id = 'g'",
    )
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(row.get::<i64, _>("last_active"), 500);
    assert_eq!(row.get::<i64, _>("ttl_clock"), 500);
    // And A's client was never inserted.
    let clients = sqlx::query("SELECT client_id FROM cvr_clients WHERE client_group_id = 'g'")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].get::<String, _>("client_id"), "bee");
}

#[tokio::test]
async fn test_superseding_lease_causes_ownership_error() {
    let db = test_db().await;

    // A connects at t=100 and loads; let its homing signal land.
    let store_a = Arc::new(db.cvr_as("g", "task-a"));
    let cvr_a = store_a.load(100).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // B connects at t=200 and loads; its lease supersedes A's.
    let store_b = Arc::new(db.cvr_as("g", "task-b"));
    let _cvr_b = store_b.load(200).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // B never flushed, so the version still matches; A fails on the lease.
    let mut updater_a = ConfigUpdater::new(Arc::clone(&store_a), cvr_a);
    updater_a.ensure_client("aye");
    let err = updater_a.flush(100, 999, 999).await.unwrap_err();
    match err {
        CvrError::Ownership { owner, granted_at } => {
            assert_eq!(owner, "task-b");
            assert_eq!(granted_at, 200);
        }
        other => panic!("expected ownership error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retaking_ownership_after_older_lease() {
    let db = test_db().await;

    // B held the group, granted as of t=100.
    let store_b = Arc::new(db.cvr_as("g", "task-b"));
    let _ = store_b.load(100).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A connects later (t=200): B's older lease does not block it.
    let store_a = Arc::new(db.cvr_as("g", "task-a"));
    let cvr_a = store_a.load(200).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut updater_a = ConfigUpdater::new(Arc::clone(&store_a), cvr_a);
    updater_a.ensure_client("aye");
    let outcome = updater_a.flush(200, 300, 300).await.unwrap();
    assert!(outcome.flushed.is_some());
}

#[tokio::test]
async fn test_catchup_patches_from_older_cookie() {
    let db = test_db().await;
    let store = Arc::new(db.cvr_as("g", "task-a"));

    // Round 1 (00.01): foo desires h1.
    let cvr = store.load(0).await.unwrap();
    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 0)]);
    let cvr = updater.flush(0, 10, 10).await.unwrap().cvr;
    let cookie = cvr.version.clone();

    // Round 2 (07): h1 executes; one row arrives.
    let mut updater = QueryUpdater::new(
        Arc::clone(&store),
        cvr,
        "r1",
        "07",
    );
    updater.track_queries(
        &[ExecutedQuery {
            id: "h1".to_string(),
            transformation_hash: "t1".to_string(),
        }],
        &[],
    );
    let row = row_id("issues", &[("id", json!(1))]);
    updater
        .received(vec![(
            row.clone(),
            RowUpdate {
                version: Some("v1".to_string()),
                contents: Some(contents(&[("id", json!(1))])),
                ref_counts: ref_counts(&[("h1", 1)]),
            },
        )])
        .await
        .unwrap();
    updater.delete_unreferenced_rows().await.unwrap();
    updater.flush(0, 20, 20).await.unwrap();

    // A client reconnecting from the round-1 cookie needs the "got" patch
    // and the row that arrived since.
    let config = store.catchup_config_patches(&cookie).await.unwrap();
    assert_eq!(config.len(), 1);
    assert_eq!(config[0].patch, Patch::put_query("h1", None));
    assert_eq!(config[0].to_version, CvrVersion::new("07"));

    let rows = store.catchup_row_records(&cookie).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, row);
    assert!(rows[0].ref_counts.is_some());

    // From the latest cookie there is nothing to catch up.
    let latest = CvrVersion::new("07");
    assert!(store.catchup_config_patches(&latest).await.unwrap().is_empty());
    assert!(store.catchup_row_records(&latest).await.unwrap().is_empty());

    // From before round 1, the desired-query patch is included too, in
    // version order.
    let config = store
        .catchup_config_patches(&CvrVersion::new("00"))
        .await
        .unwrap();
    assert_eq!(config.len(), 2);
    assert_eq!(
        config[0].patch,
        Patch::put_query("h1", Some("foo".to_string()))
    );
    assert_eq!(config[0].to_version.minor_version, Some(1));
    assert_eq!(config[1].patch, Patch::put_query("h1", None));
}

#[tokio::test]
async fn test_catchup_includes_removal_tombstones() {
    let db = test_db().await;
    let store = Arc::new(db.cvr_as("g", "task-a"));

    let cvr = store.load(0).await.unwrap();
    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 0)]);
    let cvr = updater.flush(0, 10, 10).await.unwrap().cvr;

    let mut updater = QueryUpdater::new(Arc::clone(&store), cvr, "r1", "07");
    updater.track_queries(
        &[ExecutedQuery {
            id: "h1".to_string(),
            transformation_hash: "t1".to_string(),
        }],
        &[],
    );
    let cvr = updater.flush(0, 20, 20).await.unwrap().cvr;
    let cookie = cvr.version.clone();

    // h1 is torn down at 08.
    let mut updater = QueryUpdater::new(Arc::clone(&store), cvr, "r1", "08");
    updater.track_queries(&[], &["h1".to_string()]);
    updater.delete_unreferenced_rows().await.unwrap();
    updater.flush(0, 30, 30).await.unwrap();

    let config = store.catchup_config_patches(&cookie).await.unwrap();
    assert_eq!(config.len(), 1);
    assert_eq!(config[0].patch, Patch::del_query("h1", None));
    assert_eq!(config[0].to_version, CvrVersion::new("08"));
}
