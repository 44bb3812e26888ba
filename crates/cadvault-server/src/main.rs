//! HTTP/WebSocket server for the cadvault checkout engine.
//!
//! This server:
//! - Keeps a local working copy of the shared repository in sync
//! - Serves checkout, check-in, upload and admin operations over HTTP
//! - Pushes file-list, lock and message notifications to WebSocket observers

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use cadvault_git::{configure_network_timeouts, spawn_change_poller, Coordinator, EngineConfig};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod handlers;
#[cfg(test)]
mod test_support;
mod ws;

use config::Config;
use handlers::{
    activity_handler, authors_handler, cancel_handler, checkin_handler, checkout_handler,
    delete_handler, file_content_handler, health_handler, history_handler, list_files_handler,
    locks_handler, override_handler, post_message_handler, purge_handler, read_messages_handler,
    revert_handler, upload_handler, AppState,
};
use ws::ws_handler;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let engine_config = config.engine_config();

    // libgit2 options are process-wide: set them before the runtime spawns threads
    configure_network_timeouts(engine_config.network_timeout)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config, engine_config))
}

async fn run(config: Config, engine_config: EngineConfig) -> anyhow::Result<()> {

    info!("Starting cadvault-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Remote: {} ({})", engine_config.remote_url, engine_config.branch);
    info!("  Work dir: {}", engine_config.work_dir.display());
    if engine_config.admins.is_empty() {
        warn!("  Admins: none configured, admin operations are disabled");
    } else {
        info!("  Admins: {:?}", engine_config.admins);
    }

    let coordinator = Coordinator::open(engine_config)?;

    // First sync; a remote that is down now is retried by the poller
    match coordinator.poll_changes().await {
        Ok(_) => info!("Initial sync complete"),
        Err(e) => warn!("Initial sync failed: {}", e),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = spawn_change_poller(coordinator.clone(), shutdown_rx);

    let state = AppState { coordinator };

    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = usize::try_from(config.max_upload_bytes()).unwrap_or(usize::MAX);

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/files", get(list_files_handler))
        .route("/api/files/content", get(file_content_handler))
        .route("/api/history", get(history_handler))
        .route("/api/checkout", post(checkout_handler))
        .route("/api/checkin", post(checkin_handler))
        .route("/api/cancel", post(cancel_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/admin/override", post(override_handler))
        .route("/api/admin/delete", post(delete_handler))
        .route("/api/admin/revert", post(revert_handler))
        .route("/api/admin/purge", post(purge_handler))
        .route("/api/locks", get(locks_handler))
        .route("/api/authors", get(authors_handler))
        .route("/api/activity", get(activity_handler))
        .route("/api/messages", post(post_message_handler))
        .route("/api/messages/read", post(read_messages_handler))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Bind and serve
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = poller.await {
        warn!("Change poller ended abnormally: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, initiating shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
