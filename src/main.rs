use axum::{Router, routing::get, routing::post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cube_builder::AppState;
use cube_builder::barrier::BarrierCoordinator;
use cube_builder::config::CubeConfig;
use cube_builder::handlers;
use cube_builder::ledger::ActivityLedger;
use cube_builder::metadata_store::MetadataStore;
use cube_builder::object_store::{FsObjectStore, ObjectStore};
use cube_builder::orchestrator::Orchestrator;
use cube_builder::queue::{WorkQueue, spawn_dispatcher};
use cube_builder::stac::HttpStacClient;
use cube_builder::workers::{WorkerContext, spawn_workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("cube_builder=debug,tower_http=debug")
        }))
        .init();

    let config_path = std::env::var("CUBE_CONFIG").unwrap_or_else(|_| "./cube.toml".to_string());
    let mut config = CubeConfig::load(&config_path)?;
    if let Ok(url) = std::env::var("CUBE_STAC_URL") {
        config.stac.url = url;
    }
    if let Ok(root) = std::env::var("CUBE_BUCKET_ROOT") {
        config.store.bucket_root = root;
    }

    let meta = Arc::new(MetadataStore::open(&config.store.metadata_db)?);
    let ledger = Arc::new(ActivityLedger::open(&config.store.ledger_db)?);
    tracing::info!(
        "stores opened: catalog {} ledger {}",
        config.store.metadata_db,
        config.store.ledger_db
    );

    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        config.store.bucket_root.clone(),
        &config.store.bucket,
    ));
    meta.create_bucket(&config.store.bucket)?;

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
        meta: meta.clone(),
        ledger: ledger.clone(),
        objects: objects.clone(),
        barrier,
        deadlines: config.deadlines.clone(),
        max_retries: config.workers.max_retries,
    });
    spawn_workers(
        workers.clone(),
        receivers,
        config.workers.merge,
        config.workers.stream,
    );
    spawn_dispatcher(ledger.clone(), queue.clone(), config.workers.dispatch_interval_secs);

    let stac = Arc::new(HttpStacClient::new(&config.stac.url, config.stac.max_retries));
    let orchestrator = Arc::new(Orchestrator::new(
        meta.clone(),
        ledger.clone(),
        objects.clone(),
        stac,
        queue,
        config.stac.url.clone(),
        config.store.bucket.clone(),
    ));

    let state = AppState {
        meta,
        ledger,
        objects,
        orchestrator,
        workers,
    };

    let app = Router::new()
        // Cube catalog and build pipeline
        .route(
            "/api/v1/cubes",
            get(handlers::cubes::list_cubes).post(handlers::cubes::create_cube),
        )
        .route("/api/v1/cubes/start", post(handlers::cubes::start_build))
        .route("/api/v1/cubes/cancel", post(handlers::cubes::cancel_build))
        .route("/api/v1/cubes/status", get(handlers::cubes::cube_status))
        .route("/api/v1/cubes/{cube_id}", get(handlers::cubes::get_cube))
        .route(
            "/api/v1/cubes/{cube_id}/tiles",
            get(handlers::cubes::list_cube_tiles),
        )
        .route(
            "/api/v1/cubes/{cube_id}/items",
            get(handlers::cubes::list_cube_items),
        )
        .route(
            "/api/v1/cubes/{cube_id}/meta",
            get(handlers::cubes::get_cube_meta),
        )
        .route(
            "/api/v1/cubes/{cube_id}/merges",
            get(handlers::cubes::list_merges),
        )
        // Grid schemas
        .route(
            "/api/v1/grids",
            get(handlers::grids::list_grs).post(handlers::grids::create_grs),
        )
        .route("/api/v1/grids/{grs_id}", get(handlers::grids::get_grs))
        .route(
            "/api/v1/raster-size",
            get(handlers::grids::list_raster_size).post(handlers::grids::create_raster_size),
        )
        // Temporal composition, composite functions, timeline
        .route(
            "/api/v1/temporal-schemas",
            get(handlers::schemas::list_temporal_schemas)
                .post(handlers::schemas::create_temporal_schema),
        )
        .route(
            "/api/v1/composite-functions",
            get(handlers::schemas::list_composite_functions),
        )
        .route("/api/v1/timeline", get(handlers::schemas::list_timeline))
        // Buckets and cost estimation
        .route(
            "/api/v1/buckets",
            get(handlers::schemas::list_buckets).post(handlers::schemas::create_bucket),
        )
        .route("/api/v1/estimate", get(handlers::grids::estimate_cost))
        // Stream callback from an external queue
        .route("/api/v1/dispatch", post(handlers::dispatch::dispatch))
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port: u16 = std::env::var("CUBE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("cube-builder listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
