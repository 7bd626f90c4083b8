//! Database module for persistent CVR storage.
//!
//! Provides async SQLite database access using SQLx for:
//! - CVR instances (version, activity clocks, ownership lease)
//! - Clients and per-client desired-query state
//! - Query records and tombstones
//! - Row records (refcounts and patch versions)

mod cvr_store;

pub use cvr_store::{CvrSnapshot, CvrStore};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::error::CvrError;

static MEMDB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Database handle with connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    /// This process's identity for CVR ownership leases.
    task_id: String,
}

impl Database {
    /// Connection acquire timeout - prevents connection storms from blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Maximum time a connection can remain idle before being closed.
    const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a new database connection, running migrations if needed.
    pub async fn new(path: &str) -> Result<Self, CvrError> {
        let pool = if path == ":memory:" {
            // Use a uniquely named shared-cache memory database per call.
            // `file::memory:` is global-ish and will collide across parallel tests.
            let id = MEMDB_COUNTER.fetch_add(1, Ordering::Relaxed);
            let memdb_uri = format!(
                "file:viewsyncd-memdb-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                id
            );

            let options = SqliteConnectOptions::new()
                .filename(&memdb_uri)
                .shared_cache(true)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        } else {
            // Create parent directory if it doesn't exist
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::warn!(path = %parent.display(), error = %e, "Failed to create database directory");
            }

            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);

            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Self::ACQUIRE_TIMEOUT)
                .idle_timeout(Some(Self::IDLE_TIMEOUT))
                .test_before_acquire(true)
                .connect_with(options)
                .await?
        };

        let task_id = uuid::Uuid::new_v4().to_string();
        info!(path = %path, task_id = %task_id, "Database connected");

        // Run embedded migrations
        Self::run_migrations(&pool).await?;

        // WAL mode allows reads to happen while writes are in progress
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;

        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        // NORMAL provides good durability while being faster than FULL
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool, task_id })
    }

    /// Get reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run embedded migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), CvrError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| CvrError::Internal(format!("migration error: {e}")))?;

        info!("Database migrations checked/applied");
        Ok(())
    }

    /// Open a CVR store for one client group under this process's lease
    /// identity.
    pub fn cvr(&self, client_group_id: &str) -> CvrStore {
        CvrStore::new(self.pool.clone(), client_group_id, &self.task_id)
    }

    /// Open a CVR store under an explicit lease identity. Lets tests (and
    /// tooling) act as a different server process against the same pool.
    pub fn cvr_as(&self, client_group_id: &str, task_id: &str) -> CvrStore {
        CvrStore::new(self.pool.clone(), client_group_id, task_id)
    }
}
