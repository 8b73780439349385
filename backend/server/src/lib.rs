//! Documentation of the EcoBin GPS backup service.
//!
//! Bins report GPS fixes whenever they have signal and power. This service makes sure the
//! dashboard and the field app can always ask "where is this bin right now" and get the
//! best answer available, or an explicit "unknown".
//!
//!
//!
//! # General Infrastructure
//! - Trackers push readings through the ingestion path into Redis (`bin:{id}:live`)
//! - This service never writes live readings, it only reads them
//! - Every hour a sweep copies each valid live reading into `bin:{id}:backup`
//! - Requests for a bin's location prefer the live reading, then the backup
//! - Mobile clients can also push backups directly through `/save`
//!
//!
//!
//! # Coordinate Rules
//!
//! - Latitude in `[-90, 90]`, longitude in `[-180, 180]`, both finite
//! - `(0, 0)` is what a tracker reports with no fix, never a real location
//! - Missing fields make a reading invalid; they are not a parse error
//! - With `LIVE_FRESHNESS_SECS` set, a live reading older than the window counts as invalid
//! - Timestamps more than `MAX_CLOCK_SKEW_SECS` ahead of the server clock are refused
//!
//!
//!
//! # Backup Writes
//!
//! A backup only ever moves forward in time. The store rejects any write whose timestamp is
//! not strictly newer than what it holds, for scheduled, manual and mobile writes alike.
//! Racing writers therefore always converge on the newest coordinate.
//!
//!
//!
//! # Sweeps
//!
//! - Runs at startup and then every `BACKUP_INTERVAL_SECS`
//! - `POST /force-backup` runs one on demand, or answers 409 if one is already going
//! - Bins are processed concurrently, at most `SWEEP_CONCURRENCY` at a time
//! - A failing bin is reported in the sweep report and never stops the others
//! - `SWEEP_TIMEOUT_SECS` bounds a sweep; committed writes are kept when it fires
//!
//!
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//! Run against a local Redis.
//! ```sh
//! REDIS_URL=redis://localhost:6379 RUST_LOG=info cargo run -p ecobin
//! ```
//!
//! Run without Redis.
//! ```sh
//! STORE_BACKEND=memory RUST_LOG=debug cargo run -p ecobin
//! ```
//!
//! Feed it some readings.
//! ```sh
//! cargo run -p tester -- seed --bins 5
//! cargo run -p tester -- offline bin-2
//! ```
use std::time::Duration;

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod arbitration;
pub mod clock;
pub mod config;
pub mod coordinate;
pub mod database;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod store;
pub mod utils;

use config::Config;
use routes::{
    SharedState, all_backups_handler, bins_status_handler, display_handler,
    dynamic_fleet_handler, dynamic_status_handler, force_backup_handler, get_backup_handler,
    health_handler, mobile_backup_handler, save_handler, status_handler, trigger_backup_handler,
};
use state::State;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/display/{bin_id}", get(display_handler))
        .route(
            "/backup/{bin_id}",
            get(get_backup_handler).post(trigger_backup_handler),
        )
        .route("/bins/status", get(bins_status_handler))
        .route("/force-backup", post(force_backup_handler))
        .route("/dynamic-status", get(dynamic_fleet_handler))
        .route("/dynamic-status/{bin_id}", get(dynamic_status_handler))
        .route("/save", post(save_handler))
        .route("/all", get(all_backups_handler))
        .route("/{bin_id}", get(mobile_backup_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = State::new(config).await?;

    info!(
        interval_secs = state.config.backup_interval.as_secs(),
        "Starting backup scheduler..."
    );
    let sweeper = state.scheduler.spawn();

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    info!("Server shutting down...");

    served.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
