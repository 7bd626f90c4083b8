//! Config-driven sync rounds: desired-query sets, client lifecycle,
//! schema pinning, and TTL eviction eligibility.

mod common;

use common::{desired_ast, test_db};
use serde_json::json;
use std::sync::Arc;

use viewsyncd::cvr::eviction::{get_inactive_queries, next_eviction_time};
use viewsyncd::cvr::ConfigUpdater;
use viewsyncd::error::CvrError;
use vsync_proto::{CvrVersion, Patch, PatchOp};

#[tokio::test]
async fn test_first_load_of_unseen_group() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("abc123"));

    let cvr = store.load(100).await.unwrap();
    assert_eq!(cvr.id, "abc123");
    assert_eq!(cvr.version, CvrVersion::new("00"));
    assert!(cvr.clients.is_empty());
    assert!(cvr.queries.is_empty());
}

#[tokio::test]
async fn test_desired_query_round_bumps_once_and_persists() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("abc123"));
    let cvr = store.load(100).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    let patches = updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 5_000)]);

    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0].patch,
        Patch::put_query("h1", Some("foo".to_string()))
    );
    assert_eq!(patches[0].to_version.minor_version, Some(1));

    let outcome = updater.flush(100, 1_000, 1_000).await.unwrap();
    assert!(outcome.flushed.is_some());
    let flushed = outcome.cvr;

    assert_eq!(flushed.version.minor_version, Some(1));
    let foo = &flushed.clients["foo"];
    assert_eq!(
        foo.desired_query_ids
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>(),
        vec!["h1"]
    );
    for id in ["h1", "lmids", "mutationResults"] {
        assert!(flushed.queries.contains_key(id), "missing query {id}");
    }

    // Round trip: a fresh store instance loads a deep-equal snapshot.
    let fresh = Arc::new(db.cvr("abc123"));
    let reloaded = fresh.load(200).await.unwrap();
    assert_eq!(reloaded, flushed);
}

#[tokio::test]
async fn test_delete_of_undesired_query_is_silent_noop() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("abc123"));
    let cvr = store.load(100).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 0)]);
    updater.flush(100, 1_000, 1_000).await.unwrap();

    let cvr = store.load(100).await.unwrap();
    let old_version = cvr.version.clone();
    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    let patches = updater.delete_desired_queries("foo", &["nonexistent".to_string()]);
    assert!(patches.is_empty());

    let outcome = updater.flush(100, 2_000, 2_000).await.unwrap();
    assert!(outcome.flushed.is_none());
    assert_eq!(outcome.cvr.version, old_version);
}

#[tokio::test]
async fn test_version_monotonic_iff_flushed() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("g"));
    let cvr = store.load(0).await.unwrap();
    let old_version = cvr.version.clone();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("c1");
    let outcome = updater.flush(0, 10, 10).await.unwrap();
    assert!(outcome.flushed.is_some());
    assert!(outcome.cvr.version > old_version);

    // A second no-op round neither flushes nor advances.
    let cvr = store.load(0).await.unwrap();
    let version = cvr.version.clone();
    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("c1");
    let outcome = updater.flush(0, 20, 20).await.unwrap();
    assert!(outcome.flushed.is_none());
    assert_eq!(outcome.cvr.version, version);
}

#[tokio::test]
async fn test_ttl_only_ratchets_upward() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("g"));
    let cvr = store.load(0).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 5_000)]);
    let outcome = updater.flush(0, 10, 10).await.unwrap();

    // Shorter TTL: silent no-op, no bump, no patches.
    let mut updater = ConfigUpdater::new(Arc::clone(&store), outcome.cvr);
    assert!(
        updater
            .put_desired_queries("foo", &[desired_ast("h1", "issues", 1_000)])
            .is_empty()
    );
    let outcome = updater.flush(0, 20, 20).await.unwrap();
    assert!(outcome.flushed.is_none());

    // Longer TTL: needed again.
    let mut updater = ConfigUpdater::new(Arc::clone(&store), outcome.cvr);
    let patches = updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 10_000)]);
    assert_eq!(patches.len(), 1);
    let outcome = updater.flush(0, 30, 30).await.unwrap();
    assert!(outcome.flushed.is_some());

    let state = &outcome.cvr.queries["h1"].client_state()["foo"];
    assert_eq!(state.ttl, 10_000);
}

#[tokio::test]
async fn test_client_schema_is_immutable_once_set() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("g"));
    let cvr = store.load(0).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    updater
        .set_client_schema(&json!({"tables": {"issues": {"columns": ["id"]}}}))
        .unwrap();
    // Same schema again is fine.
    updater
        .set_client_schema(&json!({"tables": {"issues": {"columns": ["id"]}}}))
        .unwrap();
    let outcome = updater.flush(0, 10, 10).await.unwrap();
    assert!(outcome.flushed.is_some());

    let mut updater = ConfigUpdater::new(Arc::clone(&store), outcome.cvr);
    let err = updater
        .set_client_schema(&json!({"tables": {"comments": {"columns": ["id"]}}}))
        .unwrap_err();
    assert!(matches!(err, CvrError::InvalidConnectionRequest(_)));
}

#[tokio::test]
async fn test_reactivation_after_inactivation_is_needed() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("g"));
    let cvr = store.load(0).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 5_000)]);
    let outcome = updater.flush(0, 10, 10).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), outcome.cvr);
    let patches =
        updater.mark_desired_queries_inactive("foo", &["h1".to_string()], 100);
    assert_eq!(patches.len(), 1);
    assert!(matches!(
        patches[0].patch,
        Patch::Query {
            op: PatchOp::Del,
            ..
        }
    ));
    let outcome = updater.flush(0, 20, 20).await.unwrap();
    let cvr = outcome.cvr;
    assert!(!cvr.clients["foo"].desired_query_ids.contains("h1"));
    let state = &cvr.queries["h1"].client_state()["foo"];
    assert_eq!(state.inactivated_at, Some(100));
    // TTL is preserved through inactivation.
    assert_eq!(state.ttl, 5_000);

    // Re-requesting the inactivated query is needed, even at the same TTL.
    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    let patches = updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 5_000)]);
    assert_eq!(patches.len(), 1);
    let outcome = updater.flush(0, 30, 30).await.unwrap();
    let state = &outcome.cvr.queries["h1"].client_state()["foo"];
    assert_eq!(state.inactivated_at, None);
}

#[tokio::test]
async fn test_eviction_waits_for_all_clients() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("g"));
    let cvr = store.load(0).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("a");
    updater.ensure_client("b");
    updater.put_desired_queries("a", &[desired_ast("h1", "issues", 5_000)]);
    updater.put_desired_queries("b", &[desired_ast("h1", "issues", 10_000)]);
    let cvr = updater.flush(0, 10, 10).await.unwrap().cvr;

    // A inactivates at t=100; B still desires, so nothing is eligible.
    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.mark_desired_queries_inactive("a", &["h1".to_string()], 100);
    let cvr = updater.flush(0, 20, 20).await.unwrap().cvr;
    assert!(get_inactive_queries(&cvr).is_empty());

    // B inactivates at t=200: expiry is the max of the two grace periods.
    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.mark_desired_queries_inactive("b", &["h1".to_string()], 200);
    let cvr = updater.flush(0, 30, 30).await.unwrap().cvr;

    let inactive = get_inactive_queries(&cvr);
    assert_eq!(inactive.len(), 1);
    assert_eq!(inactive[0].id, "h1");
    assert_eq!(inactive[0].expiry(), 200 + 10_000);
    assert_eq!(next_eviction_time(&cvr), Some(10_200));
}

#[tokio::test]
async fn test_delete_client_inactivates_and_drops_record() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("g"));
    let cvr = store.load(0).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 5_000)]);
    let cvr = updater.flush(0, 10, 10).await.unwrap().cvr;

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    let patches = updater.delete_client("foo", 150);
    assert_eq!(patches.len(), 1);
    let cvr = updater.flush(0, 20, 20).await.unwrap().cvr;

    assert!(!cvr.clients.contains_key("foo"));
    // Query teardown is TTL-deferred, not immediate.
    let state = &cvr.queries["h1"].client_state()["foo"];
    assert_eq!(state.inactivated_at, Some(150));

    // The inactivation state survives a reload, so eviction still fires
    // for the departed client's queries.
    let reloaded = store.load(0).await.unwrap();
    assert!(!reloaded.clients.contains_key("foo"));
    let state = &reloaded.queries["h1"].client_state()["foo"];
    assert_eq!(state.inactivated_at, Some(150));
    assert_eq!(state.ttl, 5_000);

    // Deleting an unknown client still purges storage without flushing
    // anything else.
    let fresh = Arc::new(db.cvr("g"));
    let cvr = fresh.load(0).await.unwrap();
    let mut updater = ConfigUpdater::new(Arc::clone(&fresh), cvr);
    let patches = updater.delete_client("ghost", 160);
    assert!(patches.is_empty());
}

#[tokio::test]
async fn test_delete_client_group_erases_storage() {
    let db = test_db().await;
    let store = Arc::new(db.cvr("g"));
    let cvr = store.load(0).await.unwrap();

    let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.ensure_client("foo");
    updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 0)]);
    updater.flush(0, 10, 10).await.unwrap();

    let cvr = store.load(0).await.unwrap();
    let updater = ConfigUpdater::new(Arc::clone(&store), cvr);
    updater.delete_client_group().await.unwrap();

    let fresh = Arc::new(db.cvr("g"));
    let reloaded = fresh.load(0).await.unwrap();
    assert!(reloaded.clients.is_empty());
    assert!(reloaded.queries.is_empty());
    assert_eq!(reloaded.version, CvrVersion::new("00"));
}

#[tokio::test]
async fn test_file_backed_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cvr.db");
    let path = path.to_str().unwrap();

    {
        let db = viewsyncd::db::Database::new(path).await.unwrap();
        let store = Arc::new(db.cvr("g"));
        let cvr = store.load(0).await.unwrap();
        let mut updater = ConfigUpdater::new(Arc::clone(&store), cvr);
        updater.ensure_client("foo");
        updater.put_desired_queries("foo", &[desired_ast("h1", "issues", 5_000)]);
        updater.flush(0, 10, 10).await.unwrap();
    }

    // A whole new process: fresh pool, fresh lease identity.
    let db = viewsyncd::db::Database::new(path).await.unwrap();
    let store = Arc::new(db.cvr("g"));
    let cvr = store.load(100).await.unwrap();
    assert_eq!(cvr.version.minor_version, Some(1));
    assert!(cvr.clients["foo"].desired_query_ids.contains("h1"));
    assert!(cvr.queries.contains_key("lmids"));
}
