//! CVR repository: transactional load/flush, ownership lease, catch-up.
//!
//! One `CvrStore` is scoped to one client group. Updater calls stage typed
//! write records in memory; `flush` applies the staged changeset in a single
//! transaction guarded by an optimistic version compare plus a time-bounded
//! ownership lease. No lock is held between `load` and `flush`; contention
//! between server processes is arbitrated entirely at flush time.

use parking_lot::Mutex;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use vsync_proto::refcount::RefCounts;
use vsync_proto::{CvrVersion, Patch, PatchToVersion, RowId, RowKey};

use crate::cvr::records::{
    ClientQuery, ClientQueryState, Cvr, CvrFlushStats, CustomQuery, InternalQuery, QueryRecord,
    RowRecord,
};
use crate::error::{CvrError, CvrResult};

/// Snapshot returned by [`CvrStore::load`].
pub type CvrSnapshot = Cvr;

/// A typed mutation staged by an updater, applied transactionally on flush.
#[derive(Debug, Clone)]
enum StagedWrite {
    PutQuery(QueryRecord),
    UpdateQuery(QueryRecord),
    MarkQueryDeleted {
        query_id: String,
        patch_version: CvrVersion,
    },
    InsertClient {
        client_id: String,
    },
    DeleteClient {
        client_id: String,
    },
    PutDesiredQuery {
        client_id: String,
        query_id: String,
        state: ClientQueryState,
    },
    DelDesiredQuery {
        client_id: String,
        query_id: String,
        version: CvrVersion,
    },
    PutRow {
        record: RowRecord,
        force: bool,
    },
    DelRow {
        id: RowId,
    },
}

/// Storage collaborator for one client group's CVR.
pub struct CvrStore {
    pool: SqlitePool,
    client_group_id: String,
    /// Identity of this server process for the ownership lease.
    task_id: String,
    pending: Mutex<Vec<StagedWrite>>,
    row_cache: Mutex<Option<Arc<HashMap<String, RowRecord>>>>,
}

impl CvrStore {
    pub fn new(pool: SqlitePool, client_group_id: &str, task_id: &str) -> Self {
        Self {
            pool,
            client_group_id: client_group_id.to_string(),
            task_id: task_id.to_string(),
            pending: Mutex::new(Vec::new()),
            row_cache: Mutex::new(None),
        }
    }

    pub fn client_group_id(&self) -> &str {
        &self.client_group_id
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Load the group's CVR snapshot, creating it implicitly (in memory, at
    /// version `00`) for an unseen id.
    ///
    /// As a side effect, asynchronously asserts this process's ownership
    /// lease ("homing signal"). The refresh is fire-and-forget and never
    /// blocks the returned snapshot.
    pub async fn load(self: &Arc<Self>, last_connect_time: i64) -> CvrResult<CvrSnapshot> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.ensure_ownership(last_connect_time).await {
                tracing::warn!(
                    client_group = %this.client_group_id,
                    error = %e,
                    "Failed to refresh ownership lease"
                );
            }
        });

        let mut cvr = Cvr::new(&self.client_group_id);

        let instance = sqlx::query(
            r#"
            SELECT version_state, version_minor, last_active, ttl_clock,
                   replica_version, client_schema
            FROM cvr_instances
            WHERE client_group_id = ?
            "#,
        )
        .bind(&self.client_group_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = instance {
            cvr.version = version_from_row(&row, "version_state", "version_minor")?;
            cvr.last_active = row.get("last_active");
            cvr.ttl_clock = row.get("ttl_clock");
            cvr.replica_version = row.get("replica_version");
            cvr.client_schema = row
                .get::<Option<String>, _>("client_schema")
                .map(|s| decode_json("client schema", &s))
                .transpose()?;
        }

        let clients = sqlx::query(
            "SELECT client_id FROM cvr_clients WHERE client_group_id = ?",
        )
        .bind(&self.client_group_id)
        .fetch_all(&self.pool)
        .await?;
        for row in clients {
            let id: String = row.get("client_id");
            cvr.clients
                .insert(id.clone(), crate::cvr::records::ClientRecord::new(id));
        }

        let queries = sqlx::query(
            r#"
            SELECT query_id, query_type, ast, query_name, query_args,
                   patch_state, patch_minor,
                   transformation_hash, transformation_state, transformation_minor
            FROM cvr_queries
            WHERE client_group_id = ? AND deleted = 0
            "#,
        )
        .bind(&self.client_group_id)
        .fetch_all(&self.pool)
        .await?;
        for row in queries {
            let record = query_record_from_row(&row)?;
            cvr.queries.insert(record.id().to_string(), record);
        }

        let desires = sqlx::query(
            r#"
            SELECT client_id, query_id, version_state, version_minor, ttl, inactivated_at
            FROM cvr_desires
            WHERE client_group_id = ? AND deleted = 0
            "#,
        )
        .bind(&self.client_group_id)
        .fetch_all(&self.pool)
        .await?;
        for row in desires {
            let client_id: String = row.get("client_id");
            let query_id: String = row.get("query_id");
            let state = ClientQueryState {
                version: version_from_row(&row, "version_state", "version_minor")?,
                ttl: row.get("ttl"),
                inactivated_at: row.get("inactivated_at"),
            };
            let Some(query) = cvr.queries.get_mut(&query_id) else {
                // Normal after a query removal: the tombstoned query is
                // gone but per-client desire rows are retained.
                tracing::debug!(
                    client_group = %self.client_group_id,
                    query = %query_id,
                    "Desire row references unknown query; skipping"
                );
                continue;
            };
            if state.inactivated_at.is_none()
                && let Some(client) = cvr.clients.get_mut(&client_id)
            {
                client.desired_query_ids.insert(query_id.clone());
            }
            query.client_state_mut().insert(client_id, state);
        }

        if let Some(c) = crate::metrics::CVR_LOADS.get() {
            c.inc();
        }
        Ok(cvr)
    }

    /// Upsert this process's ownership claim for the group, granted as of
    /// the connection that triggered it.
    async fn ensure_ownership(&self, last_connect_time: i64) -> CvrResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cvr_instances (client_group_id, version_state, owner, granted_at)
            VALUES (?, '00', ?, ?)
            ON CONFLICT(client_group_id)
            DO UPDATE SET owner = excluded.owner, granted_at = excluded.granted_at
            "#,
        )
        .bind(&self.client_group_id)
        .bind(&self.task_id)
        .bind(last_connect_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Staged writes
    // ========================================================================

    fn stage(&self, write: StagedWrite) {
        self.pending.lock().push(write);
    }

    /// Whether any writes are staged for the next flush.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub fn put_query(&self, query: QueryRecord) {
        self.stage(StagedWrite::PutQuery(query));
    }

    pub fn update_query(&self, query: QueryRecord) {
        self.stage(StagedWrite::UpdateQuery(query));
    }

    /// Tombstone a removed query at `patch_version` so reconnecting clients
    /// receive its `del` patch.
    pub fn mark_query_deleted(&self, query_id: String, patch_version: CvrVersion) {
        self.stage(StagedWrite::MarkQueryDeleted {
            query_id,
            patch_version,
        });
    }

    pub fn insert_client(&self, client_id: String) {
        self.stage(StagedWrite::InsertClient { client_id });
    }

    /// Purge a client's persisted, client-scoped rows. Staged regardless of
    /// whether the client belongs to the in-memory CVR, so a stale client id
    /// can never resurrect state.
    pub fn delete_client(&self, client_id: String) {
        self.stage(StagedWrite::DeleteClient { client_id });
    }

    pub fn put_desired_query(
        &self,
        client_id: String,
        query_id: String,
        state: ClientQueryState,
    ) {
        self.stage(StagedWrite::PutDesiredQuery {
            client_id,
            query_id,
            state,
        });
    }

    pub fn del_desired_query(&self, client_id: String, query_id: String, version: CvrVersion) {
        self.stage(StagedWrite::DelDesiredQuery {
            client_id,
            query_id,
            version,
        });
    }

    pub fn put_row_record(&self, record: RowRecord) {
        self.stage(StagedWrite::PutRow {
            record,
            force: false,
        });
    }

    /// Stage a row write that must be applied even when it looks like a
    /// no-op against the cached row index (row-key replacement).
    pub fn force_put_row_record(&self, record: RowRecord) {
        self.stage(StagedWrite::PutRow {
            record,
            force: true,
        });
    }

    pub fn del_row_record(&self, id: RowId) {
        self.stage(StagedWrite::DelRow { id });
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Apply the staged changeset atomically.
    ///
    /// `orig_version` is the concurrency token: if the persisted version no
    /// longer matches, nothing is written and
    /// [`CvrError::ConcurrentModification`] is returned. If another
    /// process's lease was granted after `last_connect_time`,
    /// [`CvrError::Ownership`] is returned instead. Returns `Ok(None)` when
    /// nothing was staged and the version is unchanged.
    pub async fn flush(
        &self,
        orig_version: &CvrVersion,
        cvr: &Cvr,
        last_connect_time: i64,
    ) -> CvrResult<Option<CvrFlushStats>> {
        let writes = std::mem::take(&mut *self.pending.lock());
        if writes.is_empty() && cvr.version == *orig_version {
            return Ok(None);
        }

        let result = self
            .flush_writes(orig_version, cvr, last_connect_time, &writes)
            .await;
        match &result {
            Ok(stats) => crate::metrics::record_flush(stats),
            Err(e) => crate::metrics::record_flush_error(e.error_code()),
        }
        result.map(Some)
    }

    async fn flush_writes(
        &self,
        orig_version: &CvrVersion,
        cvr: &Cvr,
        last_connect_time: i64,
        writes: &[StagedWrite],
    ) -> CvrResult<CvrFlushStats> {
        let mut tx = self.pool.begin().await?;
        let mut stats = CvrFlushStats::default();

        // Optimistic version compare plus lease check, inside the txn.
        let guard = sqlx::query(
            r#"
            SELECT version_state, version_minor, owner, granted_at
            FROM cvr_instances
            WHERE client_group_id = ?
            "#,
        )
        .bind(&self.client_group_id)
        .fetch_optional(&mut *tx)
        .await?;

        match guard {
            Some(row) => {
                let stored = version_from_row(&row, "version_state", "version_minor")?;
                if stored != *orig_version {
                    return Err(CvrError::ConcurrentModification {
                        expected: orig_version.to_string(),
                        actual: stored.to_string(),
                    });
                }
                let owner: Option<String> = row.get("owner");
                let granted_at: Option<i64> = row.get("granted_at");
                if let (Some(owner), Some(granted_at)) = (owner, granted_at)
                    && owner != self.task_id
                    && granted_at > last_connect_time
                {
                    return Err(CvrError::Ownership { owner, granted_at });
                }
            }
            None => {
                if *orig_version != CvrVersion::initial() {
                    return Err(CvrError::ConcurrentModification {
                        expected: orig_version.to_string(),
                        actual: "<missing>".to_string(),
                    });
                }
            }
        }
        stats.statements += 1;

        let existing_rows = self.row_cache.lock().clone();
        let mut row_updates: Vec<(String, Option<RowRecord>)> = Vec::new();

        for write in writes {
            match write {
                StagedWrite::PutQuery(query) | StagedWrite::UpdateQuery(query) => {
                    upsert_query(&mut tx, &self.client_group_id, query).await?;
                    stats.queries += 1;
                    stats.statements += 1;
                }
                StagedWrite::MarkQueryDeleted {
                    query_id,
                    patch_version,
                } => {
                    let (state, minor) = version_cols(patch_version);
                    sqlx::query(
                        r#"
                        INSERT INTO cvr_queries
                            (client_group_id, query_id, query_type, deleted, patch_state, patch_minor)
                        VALUES (?, ?, 'client', 1, ?, ?)
                        ON CONFLICT(client_group_id, query_id) DO UPDATE SET
                            deleted = 1,
                            patch_state = excluded.patch_state,
                            patch_minor = excluded.patch_minor,
                            transformation_hash = NULL,
                            transformation_state = NULL,
                            transformation_minor = NULL
                        "#,
                    )
                    .bind(&self.client_group_id)
                    .bind(query_id)
                    .bind(state)
                    .bind(minor)
                    .execute(&mut *tx)
                    .await?;
                    stats.queries += 1;
                    stats.statements += 1;
                }
                StagedWrite::InsertClient { client_id } => {
                    sqlx::query(
                        "INSERT OR IGNORE INTO cvr_clients (client_group_id, client_id) VALUES (?, ?)",
                    )
                    .bind(&self.client_group_id)
                    .bind(client_id)
                    .execute(&mut *tx)
                    .await?;
                    stats.clients += 1;
                    stats.statements += 1;
                }
                StagedWrite::DeleteClient { client_id } => {
                    // The client row goes; its desire rows stay, carrying
                    // the inactivation state that drives TTL-deferred query
                    // teardown.
                    sqlx::query(
                        "DELETE FROM cvr_clients WHERE client_group_id = ? AND client_id = ?",
                    )
                    .bind(&self.client_group_id)
                    .bind(client_id)
                    .execute(&mut *tx)
                    .await?;
                    stats.clients += 1;
                    stats.statements += 1;
                }
                StagedWrite::PutDesiredQuery {
                    client_id,
                    query_id,
                    state,
                } => {
                    let (vs, vm) = version_cols(&state.version);
                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO cvr_desires
                            (client_group_id, client_id, query_id,
                             version_state, version_minor, ttl, inactivated_at, deleted)
                        VALUES (?, ?, ?, ?, ?, ?, ?, 0)
                        "#,
                    )
                    .bind(&self.client_group_id)
                    .bind(client_id)
                    .bind(query_id)
                    .bind(vs)
                    .bind(vm)
                    .bind(state.ttl)
                    .bind(state.inactivated_at)
                    .execute(&mut *tx)
                    .await?;
                    stats.desires += 1;
                    stats.statements += 1;
                }
                StagedWrite::DelDesiredQuery {
                    client_id,
                    query_id,
                    version,
                } => {
                    let (vs, vm) = version_cols(version);
                    sqlx::query(
                        r#"
                        INSERT INTO cvr_desires
                            (client_group_id, client_id, query_id,
                             version_state, version_minor, ttl, deleted)
                        VALUES (?, ?, ?, ?, ?, 0, 1)
                        ON CONFLICT(client_group_id, client_id, query_id) DO UPDATE SET
                            version_state = excluded.version_state,
                            version_minor = excluded.version_minor,
                            inactivated_at = NULL,
                            deleted = 1
                        "#,
                    )
                    .bind(&self.client_group_id)
                    .bind(client_id)
                    .bind(query_id)
                    .bind(vs)
                    .bind(vm)
                    .execute(&mut *tx)
                    .await?;
                    stats.desires += 1;
                    stats.statements += 1;
                }
                StagedWrite::PutRow { record, force } => {
                    let key = record.id.canonical_key();
                    if !force
                        && let Some(rows) = &existing_rows
                        && rows.get(&key) == Some(record)
                    {
                        continue;
                    }
                    upsert_row(&mut tx, &self.client_group_id, &key, record).await?;
                    row_updates.push((key, Some(record.clone())));
                    stats.rows += 1;
                    stats.statements += 1;
                }
                StagedWrite::DelRow { id } => {
                    let key = id.canonical_key();
                    sqlx::query(
                        "DELETE FROM cvr_rows WHERE client_group_id = ? AND row_key = ?",
                    )
                    .bind(&self.client_group_id)
                    .bind(&key)
                    .execute(&mut *tx)
                    .await?;
                    row_updates.push((key, None));
                    stats.rows += 1;
                    stats.statements += 1;
                }
            }
        }

        // The instance row is written last so version/activity clocks and the
        // refreshed lease land together with the changeset.
        let (vs, vm) = version_cols(&cvr.version);
        let client_schema = cvr
            .client_schema
            .as_ref()
            .map(|s| serde_json::to_string(s).expect("client schema serialization"));
        sqlx::query(
            r#"
            INSERT INTO cvr_instances
                (client_group_id, version_state, version_minor, last_active, ttl_clock,
                 replica_version, client_schema, owner, granted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(client_group_id) DO UPDATE SET
                version_state = excluded.version_state,
                version_minor = excluded.version_minor,
                last_active = excluded.last_active,
                ttl_clock = excluded.ttl_clock,
                replica_version = excluded.replica_version,
                client_schema = excluded.client_schema,
                owner = excluded.owner,
                granted_at = excluded.granted_at
            "#,
        )
        .bind(&self.client_group_id)
        .bind(vs)
        .bind(vm)
        .bind(cvr.last_active)
        .bind(cvr.ttl_clock)
        .bind(&cvr.replica_version)
        .bind(&client_schema)
        .bind(&self.task_id)
        .bind(last_connect_time)
        .execute(&mut *tx)
        .await?;
        stats.instances += 1;
        stats.statements += 1;

        tx.commit().await?;

        // Keep the cached row index coherent with what was just committed.
        let mut cache = self.row_cache.lock();
        if let Some(rows) = cache.as_ref() {
            let mut rows = HashMap::clone(rows);
            for (key, update) in row_updates {
                match update {
                    Some(record) => {
                        rows.insert(key, record);
                    }
                    None => {
                        rows.remove(&key);
                    }
                }
            }
            *cache = Some(Arc::new(rows));
        }

        Ok(stats)
    }

    // ========================================================================
    // Row index
    // ========================================================================

    /// The group's full row index, keyed by canonical row key. Loaded lazily
    /// and cached; flush keeps the cache coherent.
    pub async fn get_row_records(&self) -> CvrResult<Arc<HashMap<String, RowRecord>>> {
        if let Some(cached) = self.row_cache.lock().clone() {
            return Ok(cached);
        }

        let rows = sqlx::query(
            r#"
            SELECT row_key, schema_name, table_name, key_json, row_version,
                   patch_state, patch_minor, ref_counts
            FROM cvr_rows
            WHERE client_group_id = ?
            "#,
        )
        .bind(&self.client_group_id)
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("row_key");
            map.insert(key, row_record_from_row(&row)?);
        }

        let map = Arc::new(map);
        *self.row_cache.lock() = Some(Arc::clone(&map));
        Ok(map)
    }

    /// The subset of existing row records referencing any of `query_ids`.
    /// Used to overlap the caller's own I/O after `track_queries`.
    pub async fn row_records_referencing(
        &self,
        query_ids: &BTreeSet<String>,
    ) -> CvrResult<HashMap<String, RowRecord>> {
        let all = self.get_row_records().await?;
        Ok(all
            .iter()
            .filter(|(_, record)| {
                record
                    .ref_counts
                    .as_ref()
                    .is_some_and(|counts| counts.keys().any(|id| query_ids.contains(id)))
            })
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    // ========================================================================
    // Catch-up
    // ========================================================================

    /// Query and desired-query patches needed by a client reconnecting from
    /// cookie `after`, ordered by ascending `toVersion`.
    pub async fn catchup_config_patches(
        &self,
        after: &CvrVersion,
    ) -> CvrResult<Vec<PatchToVersion>> {
        let (state, minor) = version_cols(after);
        let mut patches = Vec::new();

        let queries = sqlx::query(
            r#"
            SELECT query_id, patch_state, patch_minor, deleted
            FROM cvr_queries
            WHERE client_group_id = ?
              AND query_type != 'internal'
              AND patch_state IS NOT NULL
              AND (patch_state > ?2 OR (patch_state = ?2 AND COALESCE(patch_minor, 0) > ?3))
            ORDER BY patch_state, COALESCE(patch_minor, 0)
            "#,
        )
        .bind(&self.client_group_id)
        .bind(state)
        .bind(minor.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;
        for row in queries {
            let id: String = row.get("query_id");
            let deleted: bool = row.get("deleted");
            let to_version = version_from_row(&row, "patch_state", "patch_minor")?;
            let patch = if deleted {
                Patch::del_query(id, None)
            } else {
                Patch::put_query(id, None)
            };
            patches.push(PatchToVersion { patch, to_version });
        }

        let desires = sqlx::query(
            r#"
            SELECT client_id, query_id, version_state, version_minor, deleted
            FROM cvr_desires
            WHERE client_group_id = ?
              AND (version_state > ?2
                   OR (version_state = ?2 AND COALESCE(version_minor, 0) > ?3))
            ORDER BY version_state, COALESCE(version_minor, 0)
            "#,
        )
        .bind(&self.client_group_id)
        .bind(state)
        .bind(minor.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;
        for row in desires {
            let client_id: String = row.get("client_id");
            let query_id: String = row.get("query_id");
            let deleted: bool = row.get("deleted");
            let to_version = version_from_row(&row, "version_state", "version_minor")?;
            let patch = if deleted {
                Patch::del_query(query_id, Some(client_id))
            } else {
                Patch::put_query(query_id, Some(client_id))
            };
            patches.push(PatchToVersion { patch, to_version });
        }

        patches.sort_by(|a, b| a.to_version.cmp(&b.to_version));
        Ok(patches)
    }

    /// Row records whose visible state changed after cookie `after`,
    /// ordered by ascending patch version. Records with `ref_counts: None`
    /// translate to `del` patches; the caller re-fetches contents for the
    /// rest.
    pub async fn catchup_row_records(&self, after: &CvrVersion) -> CvrResult<Vec<RowRecord>> {
        let (state, minor) = version_cols(after);
        let rows = sqlx::query(
            r#"
            SELECT row_key, schema_name, table_name, key_json, row_version,
                   patch_state, patch_minor, ref_counts
            FROM cvr_rows
            WHERE client_group_id = ?
              AND (patch_state > ?2 OR (patch_state = ?2 AND COALESCE(patch_minor, 0) > ?3))
            ORDER BY patch_state, COALESCE(patch_minor, 0)
            "#,
        )
        .bind(&self.client_group_id)
        .bind(state)
        .bind(minor.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_record_from_row).collect()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Delete every persisted trace of this client group. Immediate, not
    /// staged: the CVR itself is being discarded.
    pub async fn delete_client_group(&self) -> CvrResult<()> {
        Self::purge_client_group(&self.pool, &self.client_group_id).await?;
        self.pending.lock().clear();
        *self.row_cache.lock() = None;
        Ok(())
    }

    /// Delete all rows of `client_group_id` across the CVR tables.
    pub async fn purge_client_group(pool: &SqlitePool, client_group_id: &str) -> CvrResult<()> {
        let mut tx = pool.begin().await?;
        for table in [
            "cvr_rows",
            "cvr_desires",
            "cvr_queries",
            "cvr_clients",
            "cvr_instances",
        ] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE client_group_id = ?"
            ))
            .bind(client_group_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Client group ids whose `last_active` is older than `older_than_ms`.
    pub async fn inactive_client_groups(
        pool: &SqlitePool,
        older_than_ms: i64,
    ) -> CvrResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT client_group_id FROM cvr_instances WHERE last_active < ?",
        )
        .bind(older_than_ms)
        .fetch_all(pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get("client_group_id"))
            .collect())
    }
}

// ============================================================================
// Row/record codecs
// ============================================================================

fn version_cols(v: &CvrVersion) -> (&str, Option<i64>) {
    (
        v.state_version.as_str(),
        v.minor_version.map(|minor| minor as i64),
    )
}

fn version_from_row(row: &SqliteRow, state: &str, minor: &str) -> CvrResult<CvrVersion> {
    let state: String = row.get(state);
    let minor: Option<i64> = row.get(minor);
    Ok(CvrVersion {
        state_version: state,
        minor_version: minor.map(|m| m as u64),
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(what: &str, raw: &str) -> CvrResult<T> {
    serde_json::from_str(raw).map_err(|e| CvrError::Corrupt(format!("{what}: {e}")))
}

fn parse_required_ast(id: &str, raw: Option<String>) -> CvrResult<vsync_proto::Ast> {
    let raw = raw.ok_or_else(|| CvrError::Corrupt(format!("query {id} missing ast")))?;
    decode_json("query ast", &raw)
}

fn query_record_from_row(row: &SqliteRow) -> CvrResult<QueryRecord> {
    let id: String = row.get("query_id");
    let query_type: String = row.get("query_type");
    let client_state = crate::cvr::records::ClientStates::new();
    let ast_raw: Option<String> = row.get("ast");
    let patch_state: Option<String> = row.get("patch_state");
    let patch_version = patch_state.map(|state| {
        let minor: Option<i64> = row.get("patch_minor");
        CvrVersion {
            state_version: state,
            minor_version: minor.map(|m| m as u64),
        }
    });
    let transformation_hash: Option<String> = row.get("transformation_hash");
    let transformation_version = row
        .get::<Option<String>, _>("transformation_state")
        .map(|state| {
            let minor: Option<i64> = row.get("transformation_minor");
            CvrVersion {
                state_version: state,
                minor_version: minor.map(|m| m as u64),
            }
        });

    match query_type.as_str() {
        "internal" => Ok(QueryRecord::Internal(InternalQuery {
            ast: parse_required_ast(&id, ast_raw)?,
            id,
            client_state,
            transformation_hash,
            transformation_version,
        })),
        "client" => Ok(QueryRecord::Client(ClientQuery {
            ast: parse_required_ast(&id, ast_raw)?,
            id,
            client_state,
            patch_version,
            transformation_hash,
            transformation_version,
        })),
        "custom" => {
            let name: Option<String> = row.get("query_name");
            let args: Option<String> = row.get("query_args");
            Ok(QueryRecord::Custom(CustomQuery {
                name: name
                    .ok_or_else(|| CvrError::Corrupt(format!("query {id} missing name")))?,
                args: args
                    .map(|raw| decode_json::<Vec<Value>>("query args", &raw))
                    .transpose()?
                    .unwrap_or_default(),
                id,
                client_state,
                patch_version,
                transformation_hash,
                transformation_version,
            }))
        }
        other => Err(CvrError::Corrupt(format!(
            "query {id} has unknown type {other:?}"
        ))),
    }
}

async fn upsert_query(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    client_group_id: &str,
    query: &QueryRecord,
) -> CvrResult<()> {
    let (query_type, ast, name, args) = match query {
        QueryRecord::Internal(q) => (
            "internal",
            Some(serde_json::to_string(&q.ast).expect("ast serialization")),
            None,
            None,
        ),
        QueryRecord::Client(q) => (
            "client",
            Some(serde_json::to_string(&q.ast).expect("ast serialization")),
            None,
            None,
        ),
        QueryRecord::Custom(q) => (
            "custom",
            None,
            Some(q.name.clone()),
            Some(serde_json::to_string(&q.args).expect("args serialization")),
        ),
    };
    let (patch_state, patch_minor) = match query.patch_version() {
        Some(v) => {
            let (s, m) = version_cols(v);
            (Some(s.to_string()), m)
        }
        None => (None, None),
    };
    let transformation_version = match query {
        QueryRecord::Internal(q) => q.transformation_version.as_ref(),
        QueryRecord::Client(q) => q.transformation_version.as_ref(),
        QueryRecord::Custom(q) => q.transformation_version.as_ref(),
    };
    let (tf_state, tf_minor) = match transformation_version {
        Some(v) => {
            let (s, m) = version_cols(v);
            (Some(s.to_string()), m)
        }
        None => (None, None),
    };

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO cvr_queries
            (client_group_id, query_id, query_type, ast, query_name, query_args,
             patch_state, patch_minor,
             transformation_hash, transformation_state, transformation_minor, deleted)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(client_group_id)
    .bind(query.id())
    .bind(query_type)
    .bind(ast)
    .bind(name)
    .bind(args)
    .bind(patch_state)
    .bind(patch_minor)
    .bind(query.transformation_hash())
    .bind(tf_state)
    .bind(tf_minor)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    client_group_id: &str,
    key: &str,
    record: &RowRecord,
) -> CvrResult<()> {
    let (patch_state, patch_minor) = version_cols(&record.patch_version);
    let ref_counts = record
        .ref_counts
        .as_ref()
        .map(|counts| serde_json::to_string(counts).expect("refcount serialization"));
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO cvr_rows
            (client_group_id, row_key, schema_name, table_name, key_json,
             row_version, patch_state, patch_minor, ref_counts)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(client_group_id)
    .bind(key)
    .bind(&record.id.schema)
    .bind(&record.id.table)
    .bind(serde_json::to_string(&record.id.row_key).expect("row key serialization"))
    .bind(&record.row_version)
    .bind(patch_state)
    .bind(patch_minor)
    .bind(ref_counts)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_record_from_row(row: &SqliteRow) -> CvrResult<RowRecord> {
    let schema: String = row.get("schema_name");
    let table: String = row.get("table_name");
    let key_json: String = row.get("key_json");
    let row_key: RowKey = decode_json("row key", &key_json)?;
    let ref_counts = row
        .get::<Option<String>, _>("ref_counts")
        .map(|raw| decode_json::<RefCounts>("row refcounts", &raw))
        .transpose()?;
    Ok(RowRecord {
        id: RowId {
            schema,
            table,
            row_key,
        },
        row_version: row.get("row_version"),
        patch_version: version_from_row(row, "patch_state", "patch_minor")?,
        ref_counts,
    })
}
