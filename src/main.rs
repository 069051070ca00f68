use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_prescreen_api::api::build_router;
use rust_prescreen_api::bureau_client::{BureauApi, HttpBureauClient};
use rust_prescreen_api::config::Config;
use rust_prescreen_api::coordinator::{BatchCoordinator, CoordinatorSettings};
use rust_prescreen_api::db::Database;
use rust_prescreen_api::db_storage::PgStore;
use rust_prescreen_api::handlers::AppState;
use rust_prescreen_api::obs::init_tracing;
use rust_prescreen_api::store::PrescreenStore;
use rust_prescreen_api::vault::PiiVault;

/// Fails batches left in `processing` by a previous process, then keeps
/// doing so on an interval.
fn spawn_reconciler(coordinator: BatchCoordinator, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match coordinator.reconcile_stale_batches(chrono::Utc::now()).await {
                Ok(batches) if !batches.is_empty() => {
                    tracing::warn!("Reconciled {} stale batch(es)", batches.len());
                }
                Ok(_) => tracing::debug!("No stale batches"),
                Err(e) => tracing::error!("❌ Stale batch reconciliation failed: {}", e),
            }
        }
    });
}

/// Main entry point for the application.
///
/// Loads configuration, refuses to start without a usable PII key, connects
/// to Postgres (running migrations), builds the bureau client and services,
/// starts the stale-batch reconciler and serves the HTTP API.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let vault = Arc::new(PiiVault::from_key_material(Some(&config.pii_encryption_key)));
    vault.ensure_configured()?;
    tracing::info!("✓ PII vault initialized");

    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");
    let store: Arc<dyn PrescreenStore> = Arc::new(PgStore::new(db.pool.clone()));

    let bureau: Arc<dyn BureauApi> = Arc::new(HttpBureauClient::from_config(&config)?);
    tracing::info!(
        "✓ Bureau client initialized: {}",
        config.bureau_base_url.as_deref().unwrap_or("<not configured>")
    );

    let settings = CoordinatorSettings::from_config(&config);
    let app_state = Arc::new(AppState::new(store, bureau, vault, settings));

    // First tick fires immediately, which covers the start-up sweep
    spawn_reconciler(
        app_state.coordinator.clone(),
        Duration::from_secs(config.reconcile_interval_secs.max(1)),
    );

    let app = build_router(app_state)?;

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
