use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `cube.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CubeConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub stac: StacConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub deadlines: DeadlineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding all buckets.
    #[serde(default = "default_bucket_root")]
    pub bucket_root: String,
    /// Bucket receiving merges, cubes and quicklooks.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_metadata_db")]
    pub metadata_db: String,
    #[serde(default = "default_ledger_db")]
    pub ledger_db: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket_root: default_bucket_root(),
            bucket: default_bucket(),
            metadata_db: default_metadata_db(),
            ledger_db: default_ledger_db(),
        }
    }
}

fn default_bucket_root() -> String {
    "./data".to_string()
}

fn default_bucket() -> String {
    "bdc-cubes".to_string()
}

fn default_metadata_db() -> String {
    "./cube_meta.db".to_string()
}

fn default_ledger_db() -> String {
    "./cube_ledger.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacConfig {
    #[serde(default = "default_stac_url")]
    pub url: String,
    #[serde(default = "default_3")]
    pub max_retries: u32,
}

impl Default for StacConfig {
    fn default() -> Self {
        Self {
            url: default_stac_url(),
            max_retries: default_3(),
        }
    }
}

fn default_stac_url() -> String {
    "http://localhost:8081/stac".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent merge workers on the batch lane.
    #[serde(default = "default_merge_workers")]
    pub merge: usize,
    /// Concurrent blend/publish workers on the stream lane.
    #[serde(default = "default_stream_workers")]
    pub stream: usize,
    /// Bounded in-flight budget per lane.
    #[serde(default = "default_batch_capacity")]
    pub batch_lane_capacity: usize,
    #[serde(default = "default_stream_capacity")]
    pub stream_lane_capacity: usize,
    #[serde(default = "default_scan_secs")]
    pub dispatch_interval_secs: u64,
    /// Transient failures re-enqueued up to this many times.
    #[serde(default = "default_3")]
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            merge: default_merge_workers(),
            stream: default_stream_workers(),
            batch_lane_capacity: default_batch_capacity(),
            stream_lane_capacity: default_stream_capacity(),
            dispatch_interval_secs: default_scan_secs(),
            max_retries: default_3(),
        }
    }
}

fn default_merge_workers() -> usize {
    4
}

fn default_stream_workers() -> usize {
    2
}

fn default_batch_capacity() -> usize {
    64
}

fn default_stream_capacity() -> usize {
    32
}

fn default_scan_secs() -> u64 {
    2
}

fn default_3() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadlineConfig {
    #[serde(default = "default_merge_deadline")]
    pub merge_secs: u64,
    #[serde(default = "default_blend_deadline")]
    pub blend_secs: u64,
    #[serde(default = "default_publish_deadline")]
    pub publish_secs: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            merge_secs: default_merge_deadline(),
            blend_secs: default_blend_deadline(),
            publish_secs: default_publish_deadline(),
        }
    }
}

fn default_merge_deadline() -> u64 {
    90
}

fn default_blend_deadline() -> u64 {
    240
}

fn default_publish_deadline() -> u64 {
    60
}

impl CubeConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: CubeConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
