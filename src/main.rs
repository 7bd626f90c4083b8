//! viewsyncd - view-sync daemon.
//!
//! Wires configuration, storage, metrics, and the background CVR purger.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use viewsyncd::config::Config;
use viewsyncd::db::Database;
use viewsyncd::service::CvrPurger;
use viewsyncd::{http, metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(server = %config.server.name, "Starting viewsyncd");

    metrics::init();

    // Initialize database
    let db_path = config
        .database
        .as_ref()
        .map(|d| d.path.as_str())
        .unwrap_or("viewsyncd.db");
    let db = Database::new(db_path).await?;

    // Serve /metrics in the background
    let metrics_addr = config.listen.metrics_address;
    tokio::spawn(http::run_http_server(metrics_addr));

    // Sweep idle client groups in the background
    let purger = CvrPurger::new(db.clone(), &config.cvr);
    let purger_handle = tokio::spawn(purger.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    purger_handle.abort();
    Ok(())
}
