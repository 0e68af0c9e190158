use serde::{Deserialize, Serialize};

/// Kind of a band, driving dtype defaults, resampling and compositing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandKind {
    /// Acquired surface-reflectance band (int16, bilinear resampling).
    Reflectance,
    /// Quality / cloud-mask band (uint8, nearest resampling).
    Quality,
    /// Derived spectral index (NDVI, EVI), computed at publish time.
    Index,
    /// Derived observation band (CLEAROB, TOTALOB, PROVENANCE).
    Observation,
}

impl BandKind {
    pub fn is_derived(self) -> bool {
        matches!(self, BandKind::Index | BandKind::Observation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Band {
    pub name: String,
    pub collection_id: String,
    pub kind: BandKind,
    pub data_type: String,
    pub min: i64,
    pub max: i64,
    pub fill: i32,
    pub scale: f64,
    pub resolution_x: f64,
    pub resolution_y: f64,
    pub common_name: String,
}

impl Band {
    /// Catalog defaults by kind, matching the builder constants.
    pub fn with_defaults(name: &str, collection_id: &str, kind: BandKind, resolution: f64) -> Self {
        let (data_type, min, max, fill, scale) = match (kind, name) {
            (BandKind::Observation, "PROVENANCE") => ("int16", 1, 366, -1, 1.0),
            (BandKind::Observation, _) => ("uint8", 0, 255, 0, 1.0),
            (BandKind::Quality, _) => ("uint8", 0, 255, 255, 1.0),
            (BandKind::Index, _) => ("int16", -10000, 10000, -9999, 0.0001),
            (BandKind::Reflectance, _) => ("int16", 0, 10000, -9999, 0.0001),
        };
        Band {
            name: name.to_string(),
            collection_id: collection_id.to_string(),
            kind,
            data_type: data_type.to_string(),
            min,
            max,
            fill,
            scale,
            resolution_x: resolution,
            resolution_y: resolution,
            common_name: name.to_lowercase(),
        }
    }
}

pub const CLEAR_OBSERVATION_NAME: &str = "CLEAROB";
pub const TOTAL_OBSERVATION_NAME: &str = "TOTALOB";
pub const PROVENANCE_NAME: &str = "PROVENANCE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub is_cube: bool,
    pub grs_schema_id: String,
    pub raster_size_schema_id: String,
    pub temporal_composition_schema_id: String,
    pub composite_function_id: String,
    /// Red, green, blue band names for the quicklook.
    pub bands_quicklook: Vec<String>,
    pub license: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrsSchema {
    pub id: String,
    pub description: String,
    pub crs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterSizeSchema {
    pub id: String,
    pub raster_size_x: u32,
    pub raster_size_y: u32,
    pub chunk_size_x: u32,
    pub chunk_size_y: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalCompositionSchema {
    pub id: String,
    pub temporal_schema: String,
    pub temporal_composite_t: String,
    pub temporal_composite_unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeFunction {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tile {
    /// `HHHVVV` horizontal/vertical grid index.
    pub id: String,
    pub grs_schema_id: String,
    /// WKT polygon in WGS-84.
    pub geom_wgs84: String,
    /// WKT polygon in the grid's projected CRS.
    pub geom: String,
    pub min_x: f64,
    pub max_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionItem {
    pub id: String,
    pub collection_id: String,
    pub tile_id: String,
    pub item_date: String,
    pub composite_start: String,
    pub composite_end: String,
    pub quicklook: String,
    /// Band name -> object-store key of the published asset.
    pub assets: serde_json::Value,
}
