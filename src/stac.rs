//! Scene discovery against a STAC provider.

use async_trait::async_trait;
use chrono::NaiveDate;
use rand::Rng;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::error::{CubeError, Result};

/// One source scene: its acquisition date and per-band asset hrefs.
#[derive(Debug, Clone)]
pub struct SceneRef {
    pub scene_id: String,
    pub acquired: NaiveDate,
    /// Band name -> asset href.
    pub assets: BTreeMap<String, String>,
    pub cloud_cover: Option<f64>,
}

/// Source of scenes for `(collection, tile bbox, date window)`.
#[async_trait]
pub trait StacSource: Send + Sync {
    /// Scenes intersecting the bbox whose acquisition date falls in
    /// `[start, end]`, deduplicated by scene id, ascending by date.
    async fn resolve(
        &self,
        collection: &str,
        bbox: (f64, f64, f64, f64),
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SceneRef>>;
}

pub struct HttpStacClient {
    base_url: String,
    client: reqwest::Client,
    max_retries: u32,
    page_limit: u32,
}

impl HttpStacClient {
    pub fn new(base_url: &str, max_retries: u32) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            max_retries,
            page_limit: 200,
        }
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    async fn search_page(
        &self,
        collection: &str,
        bbox: (f64, f64, f64, f64),
        start: NaiveDate,
        end: NaiveDate,
        page: u32,
    ) -> Result<SearchResponse> {
        let body = serde_json::json!({
            "collections": [collection],
            "bbox": [bbox.0, bbox.1, bbox.2, bbox.3],
            "datetime": format!("{start}T00:00:00Z/{end}T23:59:59Z"),
            "limit": self.page_limit,
            "page": page,
        });

        let mut attempt = 0;
        loop {
            let result = self
                .client
                .post(format!("{}/search", self.base_url))
                .json(&body)
                .timeout(Duration::from_secs(30))
                .send()
                .await;

            let transient = match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json::<SearchResponse>().await.map_err(|e| {
                        CubeError::DataError(format!("stac schema mismatch for '{collection}': {e}"))
                    });
                }
                Ok(resp) if resp.status().is_server_error() => {
                    format!("stac returned {}", resp.status())
                }
                Ok(resp) => {
                    return Err(CubeError::DataError(format!(
                        "stac rejected search for '{collection}': {}",
                        resp.status()
                    )));
                }
                Err(e) => format!("stac unreachable: {e}"),
            };

            attempt += 1;
            if attempt > self.max_retries {
                return Err(CubeError::Transient(transient));
            }
            let jitter_ms = rand::rng().random_range(0..250);
            let backoff = Duration::from_millis(500 * (1 << attempt.min(6)) + jitter_ms);
            tracing::warn!("stac search attempt {attempt} failed ({transient}), retrying in {backoff:?}");
            tokio::time::sleep(backoff).await;
        }
    }
}

#[async_trait]
impl StacSource for HttpStacClient {
    async fn resolve(
        &self,
        collection: &str,
        bbox: (f64, f64, f64, f64),
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SceneRef>> {
        let mut seen = HashSet::new();
        let mut scenes = Vec::new();

        for page in 1u32.. {
            let response = self.search_page(collection, bbox, start, end, page).await?;
            let count = response.features.len();
            for feature in response.features {
                let Some(date_str) = feature.properties.datetime else {
                    continue;
                };
                let Ok(acquired) =
                    NaiveDate::parse_from_str(&date_str[..10.min(date_str.len())], "%Y-%m-%d")
                else {
                    return Err(CubeError::DataError(format!(
                        "stac schema mismatch for '{collection}': bad datetime '{date_str}'"
                    )));
                };
                if !seen.insert(feature.id.clone()) {
                    continue;
                }
                let assets = feature
                    .assets
                    .into_iter()
                    .filter_map(|(name, asset)| asset.href.map(|href| (name, href)))
                    .collect();
                scenes.push(SceneRef {
                    scene_id: feature.id,
                    acquired,
                    assets,
                    cloud_cover: feature.properties.cloud_cover,
                });
            }
            if count < self.page_limit as usize {
                break;
            }
        }

        // Stable ascending ordering: date, then scene id.
        scenes.sort_by(|a, b| a.acquired.cmp(&b.acquired).then_with(|| a.scene_id.cmp(&b.scene_id)));
        Ok(scenes)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    id: String,
    #[serde(default)]
    properties: FeatureProperties,
    #[serde(default)]
    assets: BTreeMap<String, Asset>,
}

#[derive(Debug, Default, Deserialize)]
struct FeatureProperties {
    datetime: Option<String>,
    #[serde(rename = "eo:cloud_cover")]
    cloud_cover: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    href: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_parses_stac_features() {
        let body = serde_json::json!({
            "type": "FeatureCollection",
            "features": [{
                "id": "S2A_003003_20190105",
                "properties": {"datetime": "2019-01-05T13:42:00Z", "eo:cloud_cover": 12.5},
                "assets": {
                    "B04": {"href": "https://cdn/scenes/S2A/B04.tif"},
                    "quality": {"href": "https://cdn/scenes/S2A/Fmask.tif"},
                    "thumbnail": {}
                }
            }]
        });
        let parsed: SearchResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.features.len(), 1);
        let f = &parsed.features[0];
        assert_eq!(f.properties.cloud_cover, Some(12.5));
        assert_eq!(f.assets.len(), 3);
        assert!(f.assets["thumbnail"].href.is_none());
    }
}
