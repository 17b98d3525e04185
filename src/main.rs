use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::{AppConfig, StorageBackend};
use services::{
    local_store::LocalObjectStore,
    metadata_store::{MetadataStore, SqliteMetadataStore},
    object_client::ObjectStore,
    reconciler::ReconcilerConfig,
    remote_store::RemoteObjectStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting ephemeral-drop with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{db_url}`"))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    SqliteMetadataStore::migrate(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Object store backend ---
    let objects: Arc<dyn ObjectStore> = match &cfg.backend {
        StorageBackend::Local => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            Arc::new(LocalObjectStore::new(&cfg.storage_dir))
        }
        StorageBackend::S3 { bucket, region } => Arc::new(RemoteObjectStore::s3(bucket, region)?),
    };

    // --- Core services ---
    let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);
    let records = Arc::new(SqliteMetadataStore::new(
        db.clone(),
        cfg.retention,
        clock.clone(),
    ));
    let metadata: Arc<dyn MetadataStore> = records.clone();

    let reconciler_config = ReconcilerConfig {
        prefix: cfg.key_prefix.clone(),
        interval: cfg.sweep_interval,
        page_size: cfg.sweep_page_size,
        concurrency: cfg.sweep_concurrency,
        store_timeout: cfg.store_timeout,
        shutdown_grace: cfg.shutdown_grace,
        min_object_age: cfg.min_object_age,
        ..ReconcilerConfig::default()
    };
    let app_state = state::AppState::new(
        objects,
        metadata,
        clock,
        cfg.retention,
        &cfg.public_base_url,
        reconciler_config,
    );

    // --- Background tasks ---
    let shutdown = CancellationToken::new();
    let reconciler_task = tokio::spawn({
        let reconciler = app_state.reconciler.clone();
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });
    let ttl_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let every = cfg.ttl_monitor_interval;
        async move { records.run_ttl_monitor(every, shutdown).await }
    });

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(app_state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The server has drained; make sure the workers see the signal too.
    shutdown.cancel();
    if let Err(err) = reconciler_task.await {
        tracing::error!("reconciler task failed: {}", err);
    }
    if let Err(err) = ttl_task.await {
        tracing::error!("ttl monitor task failed: {}", err);
    }
    db.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM and cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
