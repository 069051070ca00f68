//! One-shot sweep that fails batches stuck in `processing`.
//!
//! The server runs the same sweep on an interval; this binary is for
//! operators who need it immediately (for example after a crash loop).

use std::sync::Arc;

use rust_prescreen_api::bureau_client::{BureauApi, HttpBureauClient};
use rust_prescreen_api::config::Config;
use rust_prescreen_api::coordinator::{BatchCoordinator, CoordinatorSettings};
use rust_prescreen_api::db::Database;
use rust_prescreen_api::db_storage::PgStore;
use rust_prescreen_api::obs::init_tracing;
use rust_prescreen_api::store::PrescreenStore;
use rust_prescreen_api::vault::PiiVault;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    let db = Database::new(&config.database_url).await?;
    let store: Arc<dyn PrescreenStore> = Arc::new(PgStore::new(db.pool.clone()));
    let bureau: Arc<dyn BureauApi> = Arc::new(HttpBureauClient::from_config(&config)?);
    let vault = Arc::new(PiiVault::from_key_material(Some(&config.pii_encryption_key)));

    let coordinator =
        BatchCoordinator::new(store, bureau, vault, CoordinatorSettings::from_config(&config));
    let reconciled = coordinator.reconcile_stale_batches(chrono::Utc::now()).await?;

    println!("Reconciled {} stale batch(es)", reconciled.len());
    for batch in &reconciled {
        println!("- {} (program {})", batch.id, batch.program_id);
    }

    Ok(())
}
