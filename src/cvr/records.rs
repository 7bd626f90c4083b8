//! Client View Record state.
//!
//! A CVR summarizes what one client group's local replica currently
//! contains: which clients exist, which queries each desires, which queries
//! have been executed ("got"), and which rows are visible through them.
//! The records here are plain data; reconciliation lives in the updaters
//! and persistence in [`crate::db::CvrStore`].

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use vsync_proto::refcount::RefCounts;
use vsync_proto::{Ast, CvrVersion, RowId, TtlMs};

/// One client group's view record.
#[derive(Debug, Clone, PartialEq)]
pub struct Cvr {
    /// Client group id.
    pub id: String,
    /// Current version; strictly increases across any flush that reports
    /// changes.
    pub version: CvrVersion,
    /// Wall-clock ms of the last activity.
    pub last_active: i64,
    /// Monotonic eviction clock, may lag `last_active`.
    pub ttl_clock: i64,
    /// Replication position of the replica this CVR was last synced
    /// against.
    pub replica_version: Option<String>,
    /// Schema fingerprint shared by all clients in the group. Immutable
    /// once set.
    pub client_schema: Option<Value>,
    /// Clients of the group, keyed by client id.
    pub clients: BTreeMap<String, ClientRecord>,
    /// Queries tracked for the group, keyed by query hash.
    pub queries: HashMap<String, QueryRecord>,
}

impl Cvr {
    /// A freshly created CVR, as produced by the first `load()` of an
    /// unseen client group id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: CvrVersion::initial(),
            last_active: 0,
            ttl_clock: 0,
            replica_version: None,
            client_schema: None,
            clients: BTreeMap::new(),
            queries: HashMap::new(),
        }
    }
}

/// One client of a client group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// Client id.
    pub id: String,
    /// Hashes of the queries this client currently desires, sorted.
    pub desired_query_ids: BTreeSet<String>,
}

impl ClientRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            desired_query_ids: BTreeSet::new(),
        }
    }
}

/// Per-client desire state for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientQueryState {
    /// Version at which the desire state last changed.
    pub version: CvrVersion,
    /// TTL granted to this client's desire, clamped, in ms.
    pub ttl: TtlMs,
    /// Set iff the client no longer desires the query; value is the
    /// ttl-clock reading at inactivation.
    pub inactivated_at: Option<i64>,
}

/// Desire state per client id.
pub type ClientStates = BTreeMap<String, ClientQueryState>;

/// A tracked query.
///
/// `internal` queries are server-managed bookkeeping (`lmids`,
/// `mutationResults`), created when the group's first client registers and
/// never advertised to clients. `client` queries are AST-based; `custom`
/// queries are name+args based. Consumers match exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRecord {
    Internal(InternalQuery),
    Client(ClientQuery),
    Custom(CustomQuery),
}

/// Server-managed bookkeeping query.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalQuery {
    pub id: String,
    pub ast: Ast,
    pub client_state: ClientStates,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<CvrVersion>,
}

/// AST-based query desired by clients.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientQuery {
    pub id: String,
    pub ast: Ast,
    pub client_state: ClientStates,
    /// Set once the query transitions from merely-desired to "got".
    pub patch_version: Option<CvrVersion>,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<CvrVersion>,
}

/// Named query with opaque arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomQuery {
    pub id: String,
    pub name: String,
    pub args: Vec<Value>,
    pub client_state: ClientStates,
    pub patch_version: Option<CvrVersion>,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<CvrVersion>,
}

impl QueryRecord {
    /// Query hash.
    pub fn id(&self) -> &str {
        match self {
            QueryRecord::Internal(q) => &q.id,
            QueryRecord::Client(q) => &q.id,
            QueryRecord::Custom(q) => &q.id,
        }
    }

    /// Whether this is a server-managed bookkeeping query.
    pub fn is_internal(&self) -> bool {
        matches!(self, QueryRecord::Internal(_))
    }

    pub fn client_state(&self) -> &ClientStates {
        match self {
            QueryRecord::Internal(q) => &q.client_state,
            QueryRecord::Client(q) => &q.client_state,
            QueryRecord::Custom(q) => &q.client_state,
        }
    }

    pub fn client_state_mut(&mut self) -> &mut ClientStates {
        match self {
            QueryRecord::Internal(q) => &mut q.client_state,
            QueryRecord::Client(q) => &mut q.client_state,
            QueryRecord::Custom(q) => &mut q.client_state,
        }
    }

    /// The version at which the query became "got", if it has.
    /// Internal queries are never "got" from a client's perspective.
    pub fn patch_version(&self) -> Option<&CvrVersion> {
        match self {
            QueryRecord::Internal(_) => None,
            QueryRecord::Client(q) => q.patch_version.as_ref(),
            QueryRecord::Custom(q) => q.patch_version.as_ref(),
        }
    }

    /// Mark a client/custom query as "got" at `version`. Returns false for
    /// internal queries, which have no patch history.
    pub fn set_patch_version(&mut self, version: CvrVersion) -> bool {
        match self {
            QueryRecord::Internal(_) => false,
            QueryRecord::Client(q) => {
                q.patch_version = Some(version);
                true
            }
            QueryRecord::Custom(q) => {
                q.patch_version = Some(version);
                true
            }
        }
    }

    pub fn transformation_hash(&self) -> Option<&str> {
        match self {
            QueryRecord::Internal(q) => q.transformation_hash.as_deref(),
            QueryRecord::Client(q) => q.transformation_hash.as_deref(),
            QueryRecord::Custom(q) => q.transformation_hash.as_deref(),
        }
    }

    pub fn set_transformation(&mut self, hash: String, version: CvrVersion) {
        match self {
            QueryRecord::Internal(q) => {
                q.transformation_hash = Some(hash);
                q.transformation_version = Some(version);
            }
            QueryRecord::Client(q) => {
                q.transformation_hash = Some(hash);
                q.transformation_version = Some(version);
            }
            QueryRecord::Custom(q) => {
                q.transformation_hash = Some(hash);
                q.transformation_version = Some(version);
            }
        }
    }
}

/// One row's bookkeeping: which queries reference it and at which versions
/// it last changed.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub id: RowId,
    /// Upstream version of the row's contents.
    pub row_version: String,
    /// CVR version at which the row's visible state last changed.
    pub patch_version: CvrVersion,
    /// Per-query reference counts; `None` means unreferenced, pending
    /// delete.
    pub ref_counts: Option<RefCounts>,
}

/// Statistics reported by a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CvrFlushStats {
    pub instances: usize,
    pub clients: usize,
    pub queries: usize,
    pub desires: usize,
    pub rows: usize,
    /// Total SQL statements executed in the flush transaction.
    pub statements: usize,
}

/// Result of flushing an updater.
#[derive(Debug)]
pub struct FlushOutcome {
    /// The flushed draft on success, or the untouched original snapshot
    /// when nothing changed.
    pub cvr: Cvr,
    /// Flush statistics, or `None` when nothing changed.
    pub flushed: Option<CvrFlushStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cvr_shape() {
        let cvr = Cvr::new("abc123");
        assert_eq!(cvr.id, "abc123");
        assert_eq!(cvr.version, CvrVersion::new("00"));
        assert!(cvr.clients.is_empty());
        assert!(cvr.queries.is_empty());
        assert!(cvr.replica_version.is_none());
        assert!(cvr.client_schema.is_none());
    }

    #[test]
    fn test_internal_queries_have_no_patch_version() {
        let mut q = QueryRecord::Internal(InternalQuery {
            id: "lmids".to_string(),
            ast: Ast::table("clients"),
            client_state: ClientStates::new(),
            transformation_hash: None,
            transformation_version: None,
        });
        assert!(q.patch_version().is_none());
        assert!(!q.set_patch_version(CvrVersion::new("01")));
        assert!(q.patch_version().is_none());
    }

    #[test]
    fn test_client_query_got_transition() {
        let mut q = QueryRecord::Client(ClientQuery {
            id: "h1".to_string(),
            ast: Ast::table("issues"),
            client_state: ClientStates::new(),
            patch_version: None,
            transformation_hash: None,
            transformation_version: None,
        });
        assert!(q.patch_version().is_none());
        assert!(q.set_patch_version(CvrVersion::new("02")));
        assert_eq!(q.patch_version(), Some(&CvrVersion::new("02")));

        q.set_transformation("t1".to_string(), CvrVersion::new("02"));
        assert_eq!(q.transformation_hash(), Some("t1"));
    }
}
