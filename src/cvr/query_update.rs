//! Query-driven CVR updates: reconciling execution results.
//!
//! One updater instance handles one sync round against upstream data at a
//! fixed `stateVersion`:
//!
//! ```text
//! track_queries(executed, removed)
//!   -> received(row batch)*          (zero or more)
//!   -> delete_unreferenced_rows()
//!   -> flush()
//! ```
//!
//! Calling out of order is a programmer error and asserts. The instance is
//! mutated sequentially; its row-accumulation state is not safe for
//! concurrent `received` calls.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::task::JoinHandle;

use vsync_proto::refcount::RefCounts;
use vsync_proto::{merge_ref_counts, CvrVersion, Patch, PatchToVersion, RowContents, RowId};

use crate::cvr::key_columns::KeyColumns;
use crate::cvr::records::{Cvr, FlushOutcome, RowRecord};
use crate::cvr::updater::CvrUpdater;
use crate::db::CvrStore;
use crate::error::CvrResult;

/// An executed query reported by the upstream pipeline.
#[derive(Debug, Clone)]
pub struct ExecutedQuery {
    /// Query hash.
    pub id: String,
    /// Hash of the transformed form the query was executed as.
    pub transformation_hash: String,
}

/// One row's update from executing the gotten query set.
#[derive(Debug, Clone)]
pub struct RowUpdate {
    /// Upstream version of the row's contents. Required when `contents` is
    /// present; absent for pure refcount decrements of unknown versions.
    pub version: Option<String>,
    /// Fresh column values, when the row is (still) visible.
    pub contents: Option<RowContents>,
    /// Reference-count deltas contributed by this update.
    pub ref_counts: RefCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundPhase {
    Created,
    Tracked,
    Deleted,
}

/// Per-row accumulation for the round.
struct ReceivedRow {
    merged: Option<RefCounts>,
    /// `toVersion` of the last patch emitted for this row this round.
    last_patch: Option<CvrVersion>,
    /// Fingerprints of updates already applied; identical repeats are
    /// absorbed without re-merging or re-patching.
    applied: HashSet<u64>,
}

/// Updater for server-pipeline-initiated reconciliation.
pub struct QueryUpdater {
    base: CvrUpdater,
    phase: RoundPhase,
    /// Ids removed or (re-)executed this round; their prior refcount
    /// contributions are stripped before merging fresh ones.
    removed_or_executed: BTreeSet<String>,
    received_rows: HashMap<String, ReceivedRow>,
    /// Canonical keys of rows replaced via key change this round.
    replaced: BTreeSet<String>,
    prefetch: Option<JoinHandle<CvrResult<HashMap<String, RowRecord>>>>,
    candidates: Option<HashMap<String, RowRecord>>,
    existing: Option<Arc<HashMap<String, RowRecord>>>,
    key_columns: Option<KeyColumns>,
}

impl QueryUpdater {
    /// Start a query-driven round at `state_version` against a replica at
    /// `replica_version`.
    ///
    /// Asserts that neither moves backward relative to the CVR. A strictly
    /// newer `state_version` resets the CVR version to `{state_version}`
    /// (minor version cleared); that reset *is* the round's version bump.
    pub fn new(
        store: Arc<CvrStore>,
        cvr: Cvr,
        replica_version: &str,
        state_version: &str,
    ) -> Self {
        if let Some(current) = &cvr.replica_version {
            assert!(
                replica_version >= current.as_str(),
                "replica version moved backward: {replica_version} < {current}"
            );
        }
        assert!(
            state_version >= cvr.version.state_version.as_str(),
            "state version moved backward: {state_version} < {}",
            cvr.version.state_version
        );
        let advanced = state_version > cvr.version.state_version.as_str();

        let mut base = CvrUpdater::new(store, cvr);
        if advanced {
            base.cvr_mut().version = CvrVersion::new(state_version);
        }
        base.cvr_mut().replica_version = Some(replica_version.to_string());

        Self {
            base,
            phase: RoundPhase::Created,
            removed_or_executed: BTreeSet::new(),
            received_rows: HashMap::new(),
            replaced: BTreeSet::new(),
            prefetch: None,
            candidates: None,
            existing: None,
            key_columns: None,
        }
    }

    pub fn cvr(&self) -> &Cvr {
        self.base.cvr()
    }

    /// The round's final cookie. Callers declare it to clients before
    /// sending any patch whose `toVersion` could equal it.
    pub fn updated_version(&self) -> &CvrVersion {
        self.base.updated_version()
    }

    /// Record which queries were executed (with their transformation
    /// hashes) and which were removed.
    ///
    /// Executed queries with a changed transformation get their hash and
    /// transformation version updated; a client/custom query executed for
    /// the first time transitions to "got" and yields a group-scoped `put`
    /// patch. Removed queries are deleted outright and yield `del` patches.
    /// Also eagerly starts fetching the row records referencing any touched
    /// query id, overlapping the caller's own I/O until `received`.
    pub fn track_queries(
        &mut self,
        executed: &[ExecutedQuery],
        removed: &[String],
    ) -> Vec<PatchToVersion> {
        assert!(
            self.phase == RoundPhase::Created,
            "trackQueries must start the round"
        );
        self.phase = RoundPhase::Tracked;

        let mut patches = Vec::new();

        for exec in executed {
            let hash_differs = match self.base.cvr().queries.get(&exec.id) {
                Some(query) => {
                    query.transformation_hash() != Some(exec.transformation_hash.as_str())
                }
                None => {
                    tracing::debug!(query = %exec.id, "Executed query is no longer tracked; ignoring");
                    continue;
                }
            };
            if !hash_differs {
                // Not re-transformed, so not re-executed: its prior row
                // contributions stay as they are.
                continue;
            }

            self.removed_or_executed.insert(exec.id.clone());
            let version = self.base.ensure_new_version();
            let query = self
                .base
                .cvr_mut()
                .queries
                .get_mut(&exec.id)
                .expect("checked above");
            query.set_transformation(exec.transformation_hash.clone(), version.clone());
            if !query.is_internal() && query.patch_version().is_none() {
                query.set_patch_version(version.clone());
                patches.push(PatchToVersion {
                    patch: Patch::put_query(exec.id.clone(), None),
                    to_version: version.clone(),
                });
            }
            let query = query.clone();
            self.base.store().update_query(query);
        }

        for query_id in removed {
            if self.base.cvr_mut().queries.remove(query_id).is_none() {
                tracing::debug!(query = %query_id, "Removed query already gone");
                continue;
            }
            let version = self.base.ensure_new_version();
            self.base
                .store()
                .mark_query_deleted(query_id.clone(), version.clone());
            patches.push(PatchToVersion {
                patch: Patch::del_query(query_id.clone(), None),
                to_version: version,
            });
            self.removed_or_executed.insert(query_id.clone());
        }

        if self.removed_or_executed.is_empty() {
            self.candidates = Some(HashMap::new());
        } else {
            let store = Arc::clone(self.base.store());
            let ids = self.removed_or_executed.clone();
            self.prefetch = Some(tokio::spawn(async move {
                store.row_records_referencing(&ids).await
            }));
        }

        patches
    }

    /// Reconcile a batch of row updates from query execution.
    ///
    /// Emits at most one patch per row per round: a `del` when the merged
    /// refcounts collapse to none (for a row that existed or was seen), a
    /// `put` when fresh contents arrive at a version strictly above the
    /// last patch emitted for that row this round. Repeated identical
    /// updates are absorbed.
    pub async fn received(
        &mut self,
        rows: Vec<(RowId, RowUpdate)>,
    ) -> CvrResult<Vec<PatchToVersion>> {
        assert!(
            self.phase == RoundPhase::Tracked,
            "received must follow trackQueries"
        );

        let existing = self.existing_rows().await?;
        if self.key_columns.is_none() {
            self.key_columns = Some(KeyColumns::new(existing.values()));
        }

        let mut patches = Vec::new();
        for (id, update) in rows {
            self.receive_row(&existing, id, update, &mut patches);
        }
        Ok(patches)
    }

    async fn existing_rows(&mut self) -> CvrResult<Arc<HashMap<String, RowRecord>>> {
        if let Some(map) = &self.existing {
            return Ok(Arc::clone(map));
        }
        let map = self.base.store().get_row_records().await?;
        self.existing = Some(Arc::clone(&map));
        Ok(map)
    }

    fn receive_row(
        &mut self,
        existing: &HashMap<String, RowRecord>,
        id: RowId,
        update: RowUpdate,
        patches: &mut Vec<PatchToVersion>,
    ) {
        assert!(
            update.contents.is_none() || update.version.is_some(),
            "row update with contents must carry a version"
        );

        let key = id.canonical_key();
        let existing_record = existing.get(&key);

        // Row-key change: the same logical row arriving under a new
        // primary key. The old id's state is forcibly cancelled so the
        // client's per-row index stays consistent, even when the writes
        // would otherwise look like no-ops.
        let mut force = false;
        if existing_record.is_none()
            && !self.received_rows.contains_key(&key)
            && let Some(contents) = &update.contents
            && let Some(key_columns) = &self.key_columns
            && let Some(old_key) =
                key_columns.replaced_row(&id, contents, existing, &self.replaced)
        {
            let old = existing.get(&old_key).expect("replaced row is tracked");
            let version = self.base.ensure_new_version();
            self.base.store().force_put_row_record(RowRecord {
                id: old.id.clone(),
                row_version: old.row_version.clone(),
                patch_version: version.clone(),
                ref_counts: None,
            });
            patches.push(PatchToVersion {
                patch: Patch::del_row(old.id.clone()),
                to_version: version.clone(),
            });
            self.received_rows.insert(
                old_key.clone(),
                ReceivedRow {
                    merged: None,
                    last_patch: Some(version),
                    applied: HashSet::new(),
                },
            );
            self.replaced.insert(old_key);
            force = true;
        }

        // Merge this update's refcount contribution, idempotently.
        let fingerprint = update_fingerprint(&update);
        let was_seen = self.received_rows.contains_key(&key);
        let state = match self.received_rows.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let state = entry.into_mut();
                if !state.applied.insert(fingerprint) {
                    return;
                }
                state.merged =
                    merge_ref_counts(state.merged.as_ref(), &update.ref_counts, &BTreeSet::new());
                state
            }
            Entry::Vacant(entry) => {
                let base_counts = existing_record.and_then(|r| r.ref_counts.as_ref());
                let merged = merge_ref_counts(
                    base_counts,
                    &update.ref_counts,
                    &self.removed_or_executed,
                );
                entry.insert(ReceivedRow {
                    merged,
                    last_patch: None,
                    applied: HashSet::from([fingerprint]),
                })
            }
        };

        // Decide the row version to persist: the update's if given,
        // otherwise the last known one so the store still records the
        // row's disappearance at the correct version.
        let row_version = match update
            .version
            .clone()
            .or_else(|| existing_record.map(|r| r.row_version.clone()))
        {
            Some(version) => version,
            // A deletion for a row never known: absorb as a no-op.
            None => return,
        };

        let version_changed = force
            || match existing_record {
                Some(record) => record.row_version != row_version,
                None => true,
            };
        let patch_version = if version_changed {
            self.base.ensure_new_version()
        } else {
            existing_record
                .expect("unchanged row version implies a tracked row")
                .patch_version
                .clone()
        };

        // Persist the row's bookkeeping. A never-known row that ended up
        // unreferenced leaves no record behind.
        if !(state.merged.is_none() && existing_record.is_none() && !force) {
            let record = RowRecord {
                id: id.clone(),
                row_version,
                patch_version: patch_version.clone(),
                ref_counts: state.merged.clone(),
            };
            if force {
                self.base.store().force_put_row_record(record);
            } else {
                self.base.store().put_row_record(record);
            }
        }

        // At most one patch per row per round; toVersion never regresses.
        let monotonic = state
            .last_patch
            .as_ref()
            .is_none_or(|last| patch_version > *last);
        if !monotonic {
            return;
        }
        if state.merged.is_none() {
            if existing_record.is_some() || was_seen || force {
                patches.push(PatchToVersion {
                    patch: Patch::del_row(id),
                    to_version: patch_version.clone(),
                });
                state.last_patch = Some(patch_version);
            }
        } else if let Some(contents) = update.contents {
            patches.push(PatchToVersion {
                patch: Patch::put_row(id, contents),
                to_version: patch_version.clone(),
            });
            state.last_patch = Some(patch_version);
        }
    }

    /// Sweep the rows referencing removed or executed queries that were not
    /// confirmed (or replaced) during this round. Rows whose stripped
    /// refcounts collapse become `del` patches at a bumped version; rows
    /// that remain referenced persist their reduced refcounts at their
    /// **existing** patch version, since nothing visible changed.
    pub async fn delete_unreferenced_rows(&mut self) -> CvrResult<Vec<PatchToVersion>> {
        assert!(
            self.phase == RoundPhase::Tracked,
            "deleteUnreferencedRows must follow trackQueries (once)"
        );
        self.phase = RoundPhase::Deleted;

        let candidates = match self.candidates.take() {
            Some(candidates) => candidates,
            None => match self.prefetch.take() {
                Some(handle) => handle.await??,
                None => HashMap::new(),
            },
        };

        let mut patches = Vec::new();
        let no_contributions = RefCounts::new();
        for (key, record) in candidates {
            if self.received_rows.contains_key(&key) {
                // Confirmed referenced or replaced this round.
                continue;
            }
            let stripped = merge_ref_counts(
                record.ref_counts.as_ref(),
                &no_contributions,
                &self.removed_or_executed,
            );
            if stripped.is_none() {
                let version = self.base.ensure_new_version();
                self.base.store().put_row_record(RowRecord {
                    id: record.id.clone(),
                    row_version: record.row_version,
                    patch_version: version.clone(),
                    ref_counts: None,
                });
                patches.push(PatchToVersion {
                    patch: Patch::del_row(record.id),
                    to_version: version,
                });
            } else if stripped != record.ref_counts {
                self.base.store().put_row_record(RowRecord {
                    id: record.id,
                    row_version: record.row_version,
                    patch_version: record.patch_version,
                    ref_counts: stripped,
                });
            }
        }
        Ok(patches)
    }

    /// See [`CvrUpdater::flush`].
    pub async fn flush(
        self,
        last_connect_time: i64,
        last_active: i64,
        ttl_clock: i64,
    ) -> CvrResult<FlushOutcome> {
        self.base.flush(last_connect_time, last_active, ttl_clock).await
    }
}

fn update_fingerprint(update: &RowUpdate) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    update.version.hash(&mut hasher);
    match &update.contents {
        Some(contents) => {
            1u8.hash(&mut hasher);
            serde_json::to_string(contents)
                .expect("row contents serialization")
                .hash(&mut hasher);
        }
        None => 0u8.hash(&mut hasher),
    }
    for (id, count) in &update.ref_counts {
        id.hash(&mut hasher);
        count.hash(&mut hasher);
    }
    hasher.finish()
}
