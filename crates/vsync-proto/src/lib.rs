//! # vsync-proto
//!
//! Protocol types and pure algebra for the view-sync engine:
//!
//! - CVR versions (`stateVersion` + `minorVersion`) with a total order
//! - Query and row patch wire shapes, bit-compatible with the sync protocol
//! - Composite row identity with a canonical, order-independent map key
//! - Reference-count merging (the sole authority for row visibility)
//! - TTL clamping and comparison for query eviction
//!
//! Everything in this crate is synchronous and side-effect free. The server
//! crate layers storage and reconciliation on top of these primitives.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod patch;
pub mod query;
pub mod refcount;
pub mod row;
pub mod ttl;
pub mod version;

pub use self::patch::{Patch, PatchOp, PatchToVersion};
pub use self::query::{Ast, DesiredQuery, QuerySpec, LMIDS_QUERY_ID, MUTATION_RESULTS_QUERY_ID};
pub use self::refcount::merge_ref_counts;
pub use self::row::{RowContents, RowId, RowKey};
pub use self::ttl::{clamp_ttl, cmp_ttl, effective_expiry, TtlMs, MAX_TTL_MS};
pub use self::version::{cmp_versions, max_version, one_after, CvrVersion, VersionError};
