//! Base CVR updater: draft ownership, version-bump discipline, flush.
//!
//! An updater instance exclusively owns its draft CVR for the duration of
//! one sync round. It is mutated sequentially; cross-process contention is
//! arbitrated by the store at flush time, never by in-process locks.

use std::sync::Arc;

use vsync_proto::{one_after, CvrVersion};

use crate::cvr::records::{Cvr, FlushOutcome};
use crate::db::CvrStore;
use crate::error::CvrResult;

/// Shared core of the config-driven and query-driven updaters.
pub struct CvrUpdater {
    store: Arc<CvrStore>,
    /// The snapshot the draft was derived from. Its version is the
    /// concurrency token for flush.
    orig: Cvr,
    /// The working draft.
    cvr: Cvr,
}

impl CvrUpdater {
    pub fn new(store: Arc<CvrStore>, cvr: Cvr) -> Self {
        Self {
            store,
            orig: cvr.clone(),
            cvr,
        }
    }

    pub fn store(&self) -> &Arc<CvrStore> {
        &self.store
    }

    pub fn cvr(&self) -> &Cvr {
        &self.cvr
    }

    pub fn cvr_mut(&mut self) -> &mut Cvr {
        &mut self.cvr
    }

    /// Bump the draft version once per updater lifetime.
    ///
    /// The first call advances the draft via [`one_after`] (or leaves it
    /// alone if construction already advanced the state version); subsequent
    /// calls return the same version, so multiple logical edits in one round
    /// share a single bump.
    pub fn ensure_new_version(&mut self) -> CvrVersion {
        if self.cvr.version == self.orig.version {
            self.cvr.version = one_after(&self.orig.version);
        }
        self.cvr.version.clone()
    }

    /// The draft's current version: the cookie the round will declare to
    /// clients. Patches emitted by this round never exceed it.
    pub fn updated_version(&self) -> &CvrVersion {
        &self.cvr.version
    }

    /// Persist the draft.
    ///
    /// Stamps the activity clocks on the draft, then applies the staged
    /// changeset transactionally with the original version as concurrency
    /// token. Returns the draft with stats on success, or the untouched
    /// original when nothing changed. Concurrency and ownership errors
    /// propagate unretried; the caller must restart the round from a fresh
    /// `load()`.
    pub async fn flush(
        mut self,
        last_connect_time: i64,
        last_active: i64,
        ttl_clock: i64,
    ) -> CvrResult<FlushOutcome> {
        self.cvr.last_active = last_active;
        self.cvr.ttl_clock = ttl_clock;

        match self
            .store
            .flush(&self.orig.version, &self.cvr, last_connect_time)
            .await?
        {
            Some(stats) => Ok(FlushOutcome {
                cvr: self.cvr,
                flushed: Some(stats),
            }),
            None => Ok(FlushOutcome {
                cvr: self.orig,
                flushed: None,
            }),
        }
    }
}
