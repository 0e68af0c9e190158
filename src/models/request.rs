use serde::{Deserialize, Serialize};

/// `POST /api/v1/cubes/start`.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildRequest {
    pub datacube: String,
    pub tiles: Vec<String>,
    /// Comma-separated source collection ids.
    pub collections: String,
    pub satellite: String,
    pub start_date: String,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub datacube: String,
}

/// `POST /api/v1/cubes`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCubeRequest {
    pub datacube: String,
    pub grs: String,
    pub resolution: u32,
    /// Required unless the composite function is IDENTITY.
    #[serde(default)]
    pub temporal_schema: Option<String>,
    pub composite_function: String,
    pub bands: Vec<String>,
    pub bands_quicklook: Vec<String>,
    pub license: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGrsRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `longlat`, `aea` or `sinu`.
    pub projection: String,
    pub meridian: f64,
    pub degreesx: f64,
    pub degreesy: f64,
    /// `w,n,e,s` in degrees.
    pub bbox: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRasterSizeRequest {
    pub grs_schema: String,
    pub resolution: u32,
    pub chunk_size_x: u32,
    pub chunk_size_y: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTemporalSchemaRequest {
    pub temporal_schema: String,
    #[serde(default)]
    pub temporal_composite_t: String,
    #[serde(default)]
    pub temporal_composite_unit: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBucketRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EstimateRequest {
    pub satellite: String,
    pub resolution: u32,
    pub grid: String,
    pub start_date: String,
    pub last_date: String,
    pub quantity_bands: u32,
    pub quantity_tiles: u32,
    pub t_schema: String,
    pub t_step: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineQuery {
    pub schema: String,
    pub step: u32,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    pub datacube: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemsQuery {
    #[serde(default)]
    pub bbox: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub tiles: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergesQuery {
    pub tile: String,
    pub start: String,
    pub end: String,
}

/// `GET /api/v1/cubes/status` response. Either a progress report or a
/// final summary once every activity is terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusResponse {
    Running {
        finished: bool,
        done: usize,
        not_done: usize,
        error: usize,
    },
    Finished {
        finished: bool,
        start_date: String,
        last_date: String,
        done: usize,
        duration: String,
        collection_item: usize,
    },
}

/// Stream callback payload (`POST /api/v1/dispatch`): a single activity or
/// a `solo` batch carrying its own payload list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DispatchPayload {
    Batch(Vec<super::activity::Activity>),
    One(super::activity::Activity),
}
