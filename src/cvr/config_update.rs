//! Config-driven CVR updates: desired-query sets and client lifecycle.
//!
//! These mutations are client-initiated and independent of query execution
//! results. A round applies any number of them to one updater instance and
//! flushes once.

use serde_json::{json, Value};
use std::sync::Arc;

use vsync_proto::{
    clamp_ttl, cmp_ttl, Ast, CvrVersion, DesiredQuery, Patch, PatchToVersion, QuerySpec,
    LMIDS_QUERY_ID, MUTATION_RESULTS_QUERY_ID,
};

use crate::cvr::records::{
    ClientQuery, ClientQueryState, ClientRecord, Cvr, CustomQuery, FlushOutcome, InternalQuery,
    QueryRecord,
};
use crate::cvr::updater::CvrUpdater;
use crate::db::CvrStore;
use crate::error::{CvrError, CvrResult};

/// Updater for client-initiated configuration changes.
pub struct ConfigUpdater {
    base: CvrUpdater,
}

impl ConfigUpdater {
    pub fn new(store: Arc<CvrStore>, cvr: Cvr) -> Self {
        Self {
            base: CvrUpdater::new(store, cvr),
        }
    }

    pub fn cvr(&self) -> &Cvr {
        self.base.cvr()
    }

    pub fn updated_version(&self) -> &CvrVersion {
        self.base.updated_version()
    }

    /// Idempotently create a client record.
    ///
    /// The group's first client registration also materializes the two
    /// internal bookkeeping queries, sharing the round's single version
    /// bump.
    pub fn ensure_client(&mut self, client_id: &str) {
        if self.base.cvr().clients.contains_key(client_id) {
            return;
        }
        self.base.ensure_new_version();
        self.base
            .cvr_mut()
            .clients
            .insert(client_id.to_string(), ClientRecord::new(client_id));
        self.base.store().insert_client(client_id.to_string());

        if !self.base.cvr().queries.contains_key(LMIDS_QUERY_ID) {
            self.init_client_group();
        }
    }

    /// Materialize the internal bookkeeping queries. Runs once per CVR:
    /// internal queries always exist once any client does.
    fn init_client_group(&mut self) {
        let group_id = self.base.cvr().id.clone();
        let lmids = QueryRecord::Internal(InternalQuery {
            id: LMIDS_QUERY_ID.to_string(),
            ast: Ast::filtered("clients", json!({"clientGroupID": group_id})),
            client_state: Default::default(),
            transformation_hash: None,
            transformation_version: None,
        });
        let mutation_results = QueryRecord::Internal(InternalQuery {
            id: MUTATION_RESULTS_QUERY_ID.to_string(),
            ast: Ast::filtered("mutations", json!({"clientGroupID": group_id})),
            client_state: Default::default(),
            transformation_hash: None,
            transformation_version: None,
        });
        for query in [lmids, mutation_results] {
            self.base.store().put_query(query.clone());
            self.base
                .cvr_mut()
                .queries
                .insert(query.id().to_string(), query);
        }
    }

    /// Set the group's client schema fingerprint.
    ///
    /// The schema is immutable for the life of the CVR: a structurally
    /// different schema from another client is a protocol error, never a
    /// silent overwrite.
    pub fn set_client_schema(&mut self, schema: &Value) -> CvrResult<()> {
        match &self.base.cvr().client_schema {
            Some(existing) if existing == schema => Ok(()),
            Some(_) => Err(CvrError::InvalidConnectionRequest(
                "clientSchema conflicts with the established schema for this client group"
                    .to_string(),
            )),
            None => {
                self.base.ensure_new_version();
                self.base.cvr_mut().client_schema = Some(schema.clone());
                Ok(())
            }
        }
    }

    /// Add or extend a client's desired queries.
    ///
    /// A request is *needed* if the query is absent entirely, the client's
    /// state is currently inactivated (reactivation), or the requested TTL
    /// strictly exceeds the existing one (TTL only ratchets upward; a
    /// shorter request is a silent no-op). Returns one `put` patch per
    /// needed hash, addressed to `client_id`; an all-no-op request bumps
    /// nothing and returns nothing.
    pub fn put_desired_queries(
        &mut self,
        client_id: &str,
        queries: &[DesiredQuery],
    ) -> Vec<PatchToVersion> {
        assert!(
            self.base.cvr().clients.contains_key(client_id),
            "putDesiredQueries for unknown client {client_id}"
        );

        let needed: Vec<&DesiredQuery> = queries
            .iter()
            .inspect(|q| {
                assert!(
                    q.id != LMIDS_QUERY_ID && q.id != MUTATION_RESULTS_QUERY_ID,
                    "reserved query id {:?} requested by client {client_id}",
                    q.id
                );
            })
            .filter(|q| self.desired_query_needed(client_id, q))
            .collect();
        if needed.is_empty() {
            return Vec::new();
        }

        let version = self.base.ensure_new_version();
        let mut patches = Vec::with_capacity(needed.len());
        for desired in needed {
            let state = ClientQueryState {
                version: version.clone(),
                ttl: clamp_ttl(desired.ttl),
                inactivated_at: None,
            };

            if !self.base.cvr().queries.contains_key(&desired.id) {
                let record = new_query_record(desired);
                self.base.store().put_query(record.clone());
                self.base
                    .cvr_mut()
                    .queries
                    .insert(desired.id.clone(), record);
            }
            let query = self
                .base
                .cvr_mut()
                .queries
                .get_mut(&desired.id)
                .expect("query record just ensured");
            query
                .client_state_mut()
                .insert(client_id.to_string(), state.clone());

            let client = self
                .base
                .cvr_mut()
                .clients
                .get_mut(client_id)
                .expect("client checked above");
            client.desired_query_ids.insert(desired.id.clone());

            self.base.store().put_desired_query(
                client_id.to_string(),
                desired.id.clone(),
                state,
            );
            patches.push(PatchToVersion {
                patch: Patch::put_query(desired.id.clone(), Some(client_id.to_string())),
                to_version: version.clone(),
            });
        }
        patches
    }

    fn desired_query_needed(&self, client_id: &str, desired: &DesiredQuery) -> bool {
        match self.base.cvr().queries.get(&desired.id) {
            None => true,
            Some(query) => match query.client_state().get(client_id) {
                None => true,
                Some(state) => {
                    state.inactivated_at.is_some()
                        || cmp_ttl(clamp_ttl(desired.ttl), state.ttl) == std::cmp::Ordering::Greater
                }
            },
        }
    }

    /// Immediately remove queries from a client's desired set.
    pub fn delete_desired_queries(
        &mut self,
        client_id: &str,
        query_ids: &[String],
    ) -> Vec<PatchToVersion> {
        self.remove_desired_queries(client_id, query_ids, None)
    }

    /// Remove queries from a client's desired set with TTL-deferred
    /// teardown: the client state is kept with `inactivated_at` set to the
    /// current ttl clock, preserving the granted TTL.
    pub fn mark_desired_queries_inactive(
        &mut self,
        client_id: &str,
        query_ids: &[String],
        ttl_clock: i64,
    ) -> Vec<PatchToVersion> {
        self.remove_desired_queries(client_id, query_ids, Some(ttl_clock))
    }

    /// Immediately remove a client's entire desired set.
    pub fn clear_desired_queries(&mut self, client_id: &str) -> Vec<PatchToVersion> {
        let all: Vec<String> = self
            .base
            .cvr()
            .clients
            .get(client_id)
            .map(|client| client.desired_query_ids.iter().cloned().collect())
            .unwrap_or_default();
        self.remove_desired_queries(client_id, &all, None)
    }

    /// One routine for both removal flavors. Only queries currently in the
    /// client's desired set are affected; a hash not currently desired is a
    /// silent no-op.
    fn remove_desired_queries(
        &mut self,
        client_id: &str,
        query_ids: &[String],
        inactivate_at: Option<i64>,
    ) -> Vec<PatchToVersion> {
        let affected: Vec<String> = match self.base.cvr().clients.get(client_id) {
            None => return Vec::new(),
            Some(client) => query_ids
                .iter()
                .filter(|id| client.desired_query_ids.contains(*id))
                .cloned()
                .collect(),
        };
        if affected.is_empty() {
            return Vec::new();
        }

        let version = self.base.ensure_new_version();
        let mut patches = Vec::with_capacity(affected.len());
        for query_id in affected {
            let client = self
                .base
                .cvr_mut()
                .clients
                .get_mut(client_id)
                .expect("client checked above");
            client.desired_query_ids.remove(&query_id);

            if let Some(query) = self.base.cvr_mut().queries.get_mut(&query_id) {
                match inactivate_at {
                    Some(ttl_clock) => {
                        if let Some(state) =
                            query.client_state_mut().get_mut(client_id)
                        {
                            state.inactivated_at = Some(ttl_clock);
                            state.version = version.clone();
                            let state = state.clone();
                            self.base.store().put_desired_query(
                                client_id.to_string(),
                                query_id.clone(),
                                state,
                            );
                        }
                    }
                    None => {
                        query.client_state_mut().remove(client_id);
                        self.base.store().del_desired_query(
                            client_id.to_string(),
                            query_id.clone(),
                            version.clone(),
                        );
                    }
                }
            }

            patches.push(PatchToVersion {
                patch: Patch::del_query(query_id, Some(client_id.to_string())),
                to_version: version.clone(),
            });
        }
        patches
    }

    /// Remove a client from the group.
    ///
    /// Its desired queries are marked inactive (TTL-deferred teardown, not
    /// immediate deletion) and the client record dropped. The storage purge
    /// of client-scoped rows is staged unconditionally, membership or not:
    /// a stale client id must never resurrect state.
    pub fn delete_client(&mut self, client_id: &str, ttl_clock: i64) -> Vec<PatchToVersion> {
        let patches = if self.base.cvr().clients.contains_key(client_id) {
            let desired: Vec<String> = self
                .base
                .cvr()
                .clients
                .get(client_id)
                .map(|client| client.desired_query_ids.iter().cloned().collect())
                .unwrap_or_default();
            let patches = self.mark_desired_queries_inactive(client_id, &desired, ttl_clock);
            self.base.ensure_new_version();
            self.base.cvr_mut().clients.remove(client_id);
            patches
        } else {
            Vec::new()
        };

        self.base.store().delete_client(client_id.to_string());
        patches
    }

    /// Tear down the whole client group in storage. No in-memory
    /// reconciliation: the CVR itself is being discarded.
    pub async fn delete_client_group(&self) -> CvrResult<()> {
        self.base.store().delete_client_group().await
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

fn new_query_record(desired: &DesiredQuery) -> QueryRecord {
    match &desired.spec {
        QuerySpec::Ast { ast } => QueryRecord::Client(ClientQuery {
            id: desired.id.clone(),
            ast: ast.clone(),
            client_state: Default::default(),
            patch_version: None,
            transformation_hash: None,
            transformation_version: None,
        }),
        QuerySpec::Custom { name, args } => QueryRecord::Custom(CustomQuery {
            id: desired.id.clone(),
            name: name.clone(),
            args: args.clone(),
            client_state: Default::default(),
            patch_version: None,
            transformation_hash: None,
            transformation_version: None,
        }),
    }
}
