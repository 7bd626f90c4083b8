//! Background CVR garbage collection.
//!
//! Client groups whose clients have all gone away stop flushing and their
//! `last_active` stalls. The purger sweeps periodically and deletes every
//! group idle beyond the configured threshold.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CvrConfig;
use crate::db::{CvrStore, Database};
use crate::error::CvrResult;

/// Periodic sweeper for idle client groups.
pub struct CvrPurger {
    db: Database,
    idle_ms: i64,
    interval: Duration,
}

impl CvrPurger {
    pub fn new(db: Database, config: &CvrConfig) -> Self {
        Self {
            db,
            idle_ms: config.purge_idle_ms,
            interval: Duration::from_millis(config.purge_interval_ms),
        }
    }

    /// Delete every client group idle beyond the threshold. Returns the
    /// number of groups purged.
    pub async fn sweep(&self, now_ms: i64) -> CvrResult<usize> {
        let cutoff = now_ms - self.idle_ms;
        let groups = CvrStore::inactive_client_groups(self.db.pool(), cutoff).await?;
        for group in &groups {
            CvrStore::purge_client_group(self.db.pool(), group).await?;
            crate::metrics::record_purged_group();
            debug!(client_group = %group, "Purged idle client group");
        }
        Ok(groups.len())
    }

    /// Run sweeps forever. Spawn as a background task.
    pub async fn run(self) {
        info!(
            idle_ms = self.idle_ms,
            interval_ms = self.interval.as_millis() as u64,
            "CVR purger started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            match self.sweep(now).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Purged idle client groups"),
                Err(e) => warn!(error = %e, "CVR purge sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvr::records::Cvr;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweep_deletes_only_idle_groups() {
        let db = Database::new(":memory:").await.unwrap();

        // Two groups: one stale, one fresh.
        for (group, last_active) in [("stale", 1_000_i64), ("fresh", 900_000_i64)] {
            let store = Arc::new(db.cvr(group));
            let cvr = store.load(last_active).await.unwrap();
            let mut updater = crate::cvr::ConfigUpdater::new(Arc::clone(&store), cvr);
            updater.ensure_client("c1");
            updater
                .flush(last_active, last_active, last_active)
                .await
                .unwrap();
        }

        let purger = CvrPurger::new(
            db.clone(),
            &CvrConfig {
                purge_idle_ms: 100_000,
                purge_interval_ms: 60_000,
            },
        );
        let purged = purger.sweep(1_000_000).await.unwrap();
        assert_eq!(purged, 1);

        let stale_store = Arc::new(db.cvr("stale"));
        let reloaded = stale_store.load(1_000_000).await.unwrap();
        assert_eq!(reloaded, Cvr::new("stale"));

        let fresh_store = Arc::new(db.cvr("fresh"));
        let fresh = fresh_store.load(1_000_000).await.unwrap();
        assert!(fresh.clients.contains_key("c1"));
    }
}
