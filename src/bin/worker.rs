//! Standalone worker fleet: consumes the ledger without serving HTTP.
//! Run as many of these as the build needs; the ledger's conditional
//! writes keep concurrent fleets from double-processing activities.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cube_builder::barrier::BarrierCoordinator;
use cube_builder::config::CubeConfig;
use cube_builder::ledger::ActivityLedger;
use cube_builder::metadata_store::MetadataStore;
use cube_builder::object_store::{FsObjectStore, ObjectStore};
use cube_builder::queue::{WorkQueue, spawn_dispatcher};
use cube_builder::workers::{WorkerContext, spawn_workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cube_builder=debug")),
        )
        .init();

    let config_path = std::env::var("CUBE_CONFIG").unwrap_or_else(|_| "./cube.toml".to_string());
    let mut config = CubeConfig::load(&config_path)?;
    if let Ok(root) = std::env::var("CUBE_BUCKET_ROOT") {
        config.store.bucket_root = root;
    }

    let meta = Arc::new(MetadataStore::open(&config.store.metadata_db)?);
    let ledger = Arc::new(ActivityLedger::open(&config.store.ledger_db)?);
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        config.store.bucket_root.clone(),
        &config.store.bucket,
    ));

    let (queue, receivers) = WorkQueue::new(
        config.workers.batch_lane_capacity,
        config.workers.stream_lane_capacity,
    );
    let barrier = Arc::new(BarrierCoordinator::new(
        meta.clone(),
        ledger.clone(),
        queue.clone(),
    ));
    let workers = Arc::new(WorkerContext {
        meta,
        ledger: ledger.clone(),
        objects,
        barrier,
        deadlines: config.deadlines.clone(),
        max_retries: config.workers.max_retries,
    });
    spawn_workers(
        workers,
        receivers,
        config.workers.merge,
        config.workers.stream,
    );
    spawn_dispatcher(ledger, queue, config.workers.dispatch_interval_secs);

    tracing::info!("cube-worker fleet started");
    tokio::signal::ctrl_c().await?;
    tracing::info!("cube-worker stopping");
    Ok(())
}
