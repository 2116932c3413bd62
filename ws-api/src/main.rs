use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use ws_api::{create_app, start_provisioner_task, start_reconciler_task, AppState, Config};
use ws_orchestrator::db::{backup_database, create_pool, run_migrations};
use ws_orchestrator::{EngineConfig, WorkspaceLifecycle};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = ws_logging::init_subscriber();

    info!("Starting ws-api service...");

    // Load configuration
    let config = Config::from_env();
    let engine_config = EngineConfig::from_env().context("invalid engine configuration")?;
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, host={}, ports={}",
        config.bind_addr,
        config.db_path.display(),
        engine_config.host,
        engine_config.port_range
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if let Some(backup_path) = backup_database(db_path)? {
        info!("Database backed up to: {}", backup_path.display());
    }

    // Create pool and run migrations
    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let lifecycle = Arc::new(
        WorkspaceLifecycle::from_config(pool.clone(), engine_config)
            .await
            .context("failed to initialise the workspace engine")?,
    );
    info!("Loaded {} templates", lifecycle.templates().len());

    tokio::spawn(start_provisioner_task(
        Arc::clone(&lifecycle),
        config.provisioner_interval_secs,
    ));
    tokio::spawn(start_reconciler_task(
        Arc::clone(&lifecycle),
        config.reconciler_interval_secs,
    ));

    let app = create_app(AppState::new(lifecycle, pool));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
