// Poetry camera appliance: a button press captures a photograph, a
// remote language model turns it into a short poem, and a thermal
// printer delivers the result.

use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use poetry_cam::camera::{new_camera, ImageCapture};
use poetry_cam::config::{Config, DatabaseConfig};
use poetry_cam::errors::{AppError, AppResult, DatabaseError};
use poetry_cam::generator::{OpenAiGenerator, PoemGenerator};
use poetry_cam::orchestrator::{Orchestrator, RetryPolicy, StageTimeouts};
use poetry_cam::printers::{new_printer, Printer};
use poetry_cam::storage::ArtifactStore;
use poetry_cam::style::StyleDirective;
use poetry_cam::trigger::spawn_trigger_source;

// ============================================================================
// Application State
// ============================================================================

struct AppState {
    config: Config,
    db_pool: SqlitePool,
    store: ArtifactStore,
    style: Arc<StyleDirective>,
}

impl AppState {
    async fn new(config: Config) -> AppResult<Self> {
        info!("Initializing application state");

        let db_pool = Self::initialize_database(&config.database).await?;

        let store = ArtifactStore::new(
            config.storage.images_path(),
            config.storage.poems_path(),
        )
        .await?;

        let style = Arc::new(StyleDirective::load(&config.generator.prompt_path).await);

        Ok(Self {
            config,
            db_pool,
            store,
            style,
        })
    }

    async fn initialize_database(db_config: &DatabaseConfig) -> AppResult<SqlitePool> {
        info!("Initializing database at: {:?}", db_config.path);

        if let Some(parent) = db_config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Initialization(format!("Failed to create database directory: {}", e))
            })?;
        }

        let pool = SqlitePool::connect(&db_config.connection_string())
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

        info!("Database connected and migrations completed");
        Ok(pool)
    }
}

// ============================================================================
// Shutdown Handling
// ============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> AppResult<()> {
    // ========================================
    // Phase 1: Basic Initialization
    // ========================================

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting poetry camera");

    // ========================================
    // Phase 2: Configuration & State Setup
    // ========================================

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!("Configuration loaded successfully");

    let state = AppState::new(config).await.map_err(|e| {
        error!("Application initialization error: {}", e);
        e
    })?;

    // ========================================
    // Phase 3: Collaborator Initialization
    // ========================================

    // Camera is a required collaborator: no camera, no appliance.
    let camera = new_camera(&state.config.camera).await.map_err(|e| {
        error!("Camera initialization failed: {}", e);
        AppError::Initialization(format!("Camera is required for operation: {}", e))
    })?;

    let generator = Arc::new(OpenAiGenerator::new(&state.config.generator));

    let printer = new_printer(&state.config.printer).await.map_err(|e| {
        error!("Printer initialization failed: {}", e);
        AppError::Initialization(format!("Printer is required for operation: {}", e))
    })?;

    info!(
        camera = camera.type_name(),
        generator = generator.type_name(),
        printer = printer.type_name(),
        "Collaborators initialized"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        camera,
        generator,
        printer,
        state.store.clone(),
        state.db_pool.clone(),
        state.style.clone(),
        StageTimeouts::from(&state.config.pipeline),
        RetryPolicy::from(&state.config.pipeline),
        state.config.pipeline.apology_slip,
    ));

    // ========================================
    // Phase 4: Offline Reprocessing Command
    // ========================================

    // `poetry_cam regenerate <cycle-id>` re-runs generation and
    // printing against a persisted artifact, then exits.
    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        match command.as_str() {
            "regenerate" => {
                let raw_id = args.next().ok_or_else(|| {
                    AppError::Initialization("usage: poetry_cam regenerate <cycle-id>".to_string())
                })?;
                let cycle_id = Uuid::parse_str(&raw_id).map_err(|e| {
                    AppError::Initialization(format!("invalid cycle id {raw_id}: {e}"))
                })?;

                let cycle = orchestrator.regenerate(cycle_id).await?;
                info!(
                    cycle_id = %cycle.id,
                    outcome = ?cycle.outcome,
                    "reprocessing finished"
                );
                state.db_pool.close().await;
                return Ok(());
            }
            other => {
                return Err(AppError::Initialization(format!(
                    "unknown command: {other}"
                )));
            }
        }
    }

    // ========================================
    // Phase 5: Run Until Shutdown
    // ========================================

    let triggers = spawn_trigger_source(&state.config.trigger);

    tokio::select! {
        _ = orchestrator.run(triggers) => {
            error!("Trigger source ended unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Initiating graceful shutdown...");
        }
    }

    // ========================================
    // Phase 6: Graceful Shutdown
    // ========================================

    state.db_pool.close().await;
    info!("Database connections closed");
    info!("Graceful shutdown complete");
    Ok(())
}
