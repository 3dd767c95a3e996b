use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dagctl_operator::api::{self, ApiState};
use dagctl_operator::config::Config;
use dagctl_operator::controller::Controller;
use dagctl_operator::scheduler::CronTable;
use dagctl_operator::service::{ProjectReconciler, RunMaterializer, RunReconciler, UnitBuilder};
use dagctl_operator::store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dagctl_operator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting dagctl operator...");

    let config = load_config()?;
    tracing::info!("Configuration: {:?}", config);

    let store: Arc<dyn Store> = MemoryStore::new();
    let cron = CronTable::new();
    let materializer = Arc::new(RunMaterializer::new(store.clone()));

    let projects = Arc::new(ProjectReconciler::new(
        store.clone(),
        cron.clone(),
        materializer.clone(),
        config.schedule_retry,
    ));
    let runs = Arc::new(RunReconciler::new(
        store.clone(),
        UnitBuilder::new(config.unit_defaults.clone()),
        config.unit_missing_grace,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let project_controller = tokio::spawn(
        Controller::new(
            projects,
            store.clone(),
            config.resync_interval,
            config.max_concurrent_reconciles,
        )
        .run(shutdown_rx.clone()),
    );
    let run_controller = tokio::spawn(
        Controller::new(
            runs,
            store.clone(),
            config.resync_interval,
            config.max_concurrent_reconciles,
        )
        .run(shutdown_rx),
    );

    // Build router with all API endpoints
    let app = api::create_router(ApiState {
        store,
        materializer,
    });

    tracing::info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Timers go first so no tick races the stopping controllers.
    cron.shutdown();
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(project_controller, run_controller);

    tracing::info!("dagctl operator stopped");
    Ok(())
}

/// Loads configuration from the environment, falling back to defaults
fn load_config() -> anyhow::Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            tracing::warn!("Failed to load config from environment: {}", e);
            tracing::info!("Using default configuration");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}
