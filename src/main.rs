mod api;
mod clock;
mod collector;
mod config;
mod error;
mod heartbeat;
mod httpc;
mod ident;
mod peers;
mod query;
mod record;
mod sampler;
mod storage;

use std::process::ExitCode;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::collector::{Collector, LatestSample};
use crate::config::AppConfig;
use crate::httpc::HttpPool;
use crate::storage::StorageSet;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub storages: Arc<StorageSet>,
    pub latest: LatestSample,
}

// Exit codes: 0 clean shutdown, 1 invalid startup config, 2 port bind
// failure, 3 no enabled storage could be initialized.
const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_STORAGE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostbeat=info,tower_http=info".into()),
        )
        .init();

    info!("Starting hostbeat v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!(
        port = config.port,
        storage = ?config.storage,
        refresh = config.refresh_interval_seconds,
        "Configuration loaded"
    );

    // Initialize storage backends
    let storages = match StorageSet::init(&config).await {
        Ok(set) => Arc::new(set),
        Err(e) => {
            error!(error = %e, "Storage initialization failed");
            return ExitCode::from(EXIT_STORAGE);
        }
    };

    // Shared outbound HTTP pool — the only HTTP client in the process.
    let pool = match HttpPool::new(config.http) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!(error = %e, "HTTP pool construction failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Shutdown fan-out: the signal handler flips the watch, the background
    // tasks observe it.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the tick orchestrator
    let collector = Collector::new(
        Arc::new(config.clone()),
        storages.clone(),
        pool.clone(),
    );
    let latest = collector.latest();
    let collector_handle = collector.spawn(shutdown_rx.clone());

    // Retention sweeper (hourly, when enabled)
    let sweeper_handle =
        collector::spawn_sweeper(storages.clone(), config.retention_days, shutdown_rx.clone());
    if sweeper_handle.is_some() {
        info!(days = config.retention_days, "Retention sweeper active");
    }

    // Build router
    let state = Arc::new(AppState {
        config: config.clone(),
        storages: storages.clone(),
        latest,
    });
    let app = api::routes(state)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB — filters are tiny
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
        );

    // Start server
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind port");
            return ExitCode::from(EXIT_BIND);
        }
    };
    info!("Listening on {addr}");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await;

    if let Err(e) = serve_result {
        error!(error = %e, "Server error");
        return ExitCode::from(EXIT_BIND);
    }

    // The collector finishes persisting its in-flight record before it
    // exits; storage handles close last, in reverse init order.
    if let Err(e) = collector_handle.await {
        warn!(error = %e, "Collector task did not stop cleanly");
    }
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }
    storages.close_all().await;

    info!("Clean shutdown");
    ExitCode::SUCCESS
}
