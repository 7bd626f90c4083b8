//! The CVR engine: records, updaters, and eviction logic.

pub mod config_update;
pub mod eviction;
pub mod key_columns;
pub mod query_update;
pub mod records;
pub mod updater;

pub use config_update::ConfigUpdater;
pub use eviction::{get_inactive_queries, next_eviction_time, InactiveQuery};
pub use query_update::{ExecutedQuery, QueryUpdater, RowUpdate};
pub use records::{Cvr, CvrFlushStats, FlushOutcome, QueryRecord, RowRecord};
pub use updater::CvrUpdater;
