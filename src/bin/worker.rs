use std::{sync::Arc, time::Duration};

use tokio::signal;
use tracing_subscriber::EnvFilter;

use countersign::{
    auth::jwt::JwtService,
    config::AppConfig,
    db, default_handlers,
    jobs::{enqueue_job, JOB_RECONCILE_ROLE_ASSIGNMENTS},
    state::AppState,
    storage::{FsStorage, TenantStorage},
    Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = 1,
        tenant_db_prefix = %config.tenant_db_prefix,
        storage_root = %config.storage_root.display(),
        "loaded backend configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;

    // each worker boot queues one consistency sweep; the sweep is
    // idempotent so overlapping runs are harmless
    {
        let mut conn = pool.get()?;
        enqueue_job(
            &mut conn,
            JOB_RECONCILE_ROLE_ASSIGNMENTS,
            serde_json::json!({}),
            None,
        )?;
    }

    let storage: Arc<dyn TenantStorage> = Arc::new(FsStorage);
    let jwt = JwtService::from_config(&config)?;

    let state = Arc::new(AppState::new(pool, config, storage, jwt));
    let worker = Worker::new(state, default_handlers(), Duration::from_secs(2));

    tokio::select! {
        _ = worker.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
