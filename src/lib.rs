//! viewsyncd - view-sync daemon.
//!
//! Server-side view synchronizer: tracks, per client group, exactly which
//! queries and rows each client currently holds (the Client View Record)
//! and computes the minimal, correctly-ordered set of versioned patches
//! needed to bring clients up to date as queries change and upstream data
//! mutates.
//!
//! A sync round loads a snapshot, applies updater operations (config-driven
//! and/or query-driven), then flushes once. The store arbitrates
//! multi-process contention with an optimistic version compare plus a
//! time-bounded ownership lease.

pub mod config;
pub mod cvr;
pub mod db;
pub mod error;
pub mod http;
pub mod metrics;
pub mod service;
