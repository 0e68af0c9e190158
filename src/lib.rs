pub mod barrier;
pub mod config;
pub mod cube_id;
pub mod error;
pub mod grid;
pub mod handlers;
pub mod ledger;
pub mod metadata_store;
pub mod models;
pub mod object_store;
pub mod orchestrator;
pub mod queue;
pub mod raster;
pub mod stac;
pub mod timeline;
pub mod workers;

use std::sync::Arc;

use ledger::ActivityLedger;
use metadata_store::MetadataStore;
use object_store::ObjectStore;
use orchestrator::Orchestrator;
use workers::WorkerContext;

#[derive(Clone)]
pub struct AppState {
    pub meta: Arc<MetadataStore>,
    pub ledger: Arc<ActivityLedger>,
    pub objects: Arc<dyn ObjectStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub workers: Arc<WorkerContext>,
}
