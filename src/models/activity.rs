use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::cube::BandKind;

/// Fixed status vocabulary of the activity ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityStatus {
    #[serde(rename = "NOTDONE")]
    NotDone,
    #[serde(rename = "DOING")]
    Doing,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "ERROR")]
    Error,
}

impl ActivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityStatus::NotDone => "NOTDONE",
            ActivityStatus::Doing => "DOING",
            ActivityStatus::Done => "DONE",
            ActivityStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NOTDONE" => Some(ActivityStatus::NotDone),
            "DOING" => Some(ActivityStatus::Doing),
            "DONE" => Some(ActivityStatus::Done),
            "ERROR" => Some(ActivityStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ActivityStatus::Done | ActivityStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityAction {
    Merge,
    Blend,
    Publish,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::Merge => "merge",
            ActivityAction::Blend => "blend",
            ActivityAction::Publish => "publish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "merge" => Some(ActivityAction::Merge),
            "blend" => Some(ActivityAction::Blend),
            "publish" => Some(ActivityAction::Publish),
            _ => None,
        }
    }
}

/// One unit of work in the ledger, wire form per the stream callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub activity_id: String,
    pub action: ActivityAction,
    pub datacube_id: String,
    pub tile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band: Option<String>,
    /// Period label, or the scene id for IDENTITY processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    pub mystatus: ActivityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mylaunch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub myend: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Action-specific payload.
    pub activity: serde_json::Value,
}

/// Deterministic activity id: re-submission with the same key is idempotent.
pub fn activity_id(
    datacube_id: &str,
    action: ActivityAction,
    tile_id: &str,
    band: Option<&str>,
    period: Option<&str>,
    scene_key: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        datacube_id,
        action.as_str(),
        tile_id,
        band.unwrap_or(""),
        period.unwrap_or(""),
        scene_key.unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in &digest[..16] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Payload of a MERGE activity: everything the worker needs to warp one
/// band of one scene onto one tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePayload {
    pub scene_id: String,
    /// Acquisition date, `YYYY-MM-DD`.
    pub acquired: String,
    pub asset_href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_href: Option<String>,
    pub band: String,
    pub kind: BandKind,
    pub data_type: String,
    pub fill: i32,
    pub resampling: String,
    /// Object-store key of the merge artifact.
    pub dest_key: String,
    /// Target grid: CRS, origin, pixel size, dimensions.
    pub crs: String,
    pub origin_x: f64,
    pub origin_y: f64,
    pub res_x: f64,
    pub res_y: f64,
    pub width: u32,
    pub height: u32,
    /// Fraction of non-fill pixels, recorded after the merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficacy: Option<f64>,
    /// Fraction of cloud/shadow pixels from the paired quality band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_ratio: Option<f64>,
    /// Composite cube whose blend skeletons this merge feeds.
    pub target_cube: String,
    /// Build metadata kept for `GET /cubes/{id}/meta`.
    pub url_stac: String,
    pub datasets: Vec<String>,
    pub satellite: String,
    pub bucket_name: String,
}

/// Payload of a BLEND activity for one `(tile, band, period)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendPayload {
    pub band: String,
    pub kind: BandKind,
    pub data_type: String,
    pub fill: i32,
    /// Composite function id (`MED`, `STK`).
    pub function: String,
    /// Irregular cube whose merges feed this composite.
    pub irregular_cube: String,
    pub dest_key: String,
}

/// Payload of a PUBLISH activity for one `(tile, period)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishPayload {
    pub function: String,
    pub bands_quicklook: Vec<String>,
    /// Reflectance band names expected as composites.
    pub bands: Vec<String>,
    /// Index band names to derive (NDVI, EVI).
    pub indices: Vec<String>,
    pub period_start: String,
    pub period_end: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_id_is_deterministic() {
        let a = activity_id("c_10", ActivityAction::Merge, "003003", Some("B04"), Some("p"), Some("s1"));
        let b = activity_id("c_10", ActivityAction::Merge, "003003", Some("B04"), Some("p"), Some("s1"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn activity_id_separates_fields() {
        // "B04" + "p" must not collide with "B0" + "4p".
        let a = activity_id("c_10", ActivityAction::Merge, "t", Some("B04"), Some("p"), None);
        let b = activity_id("c_10", ActivityAction::Merge, "t", Some("B0"), Some("4p"), None);
        assert_ne!(a, b);
    }

    #[test]
    fn status_round_trips() {
        for s in [
            ActivityStatus::NotDone,
            ActivityStatus::Doing,
            ActivityStatus::Done,
            ActivityStatus::Error,
        ] {
            assert_eq!(ActivityStatus::parse(s.as_str()), Some(s));
        }
    }
}
