//! PUBLISH: derive index bands, render the quicklook and register the
//! collection item for one `(tile, period)`.

use image::{ImageFormat, RgbImage};
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::error::{CubeError, Result};
use crate::models::activity::{Activity, ActivityStatus, PublishPayload};
use crate::models::cube::{
    CLEAR_OBSERVATION_NAME, CollectionItem, PROVENANCE_NAME, TOTAL_OBSERVATION_NAME,
};
use crate::object_store::{composite_key, quicklook_key};
use crate::raster::{DataType, Raster};
use crate::workers::WorkerContext;

pub const INDEX_FILL: i32 = -9999;
const INDEX_SCALE: f64 = 10000.0;

/// Common names of the composite bands each index derives from.
pub fn index_inputs(index: &str) -> Option<&'static [&'static str]> {
    match index {
        "NDVI" => Some(&["nir", "red"]),
        "EVI" => Some(&["nir", "red", "blue"]),
        _ => None,
    }
}

/// Runs on the blocking pool.
pub fn run(ctx: &WorkerContext, activity: &Activity) -> Result<()> {
    let payload: PublishPayload = serde_json::from_value(activity.activity.clone())
        .map_err(|e| CubeError::Fatal(format!("bad publish payload: {e}")))?;
    let period = activity
        .period
        .as_deref()
        .ok_or_else(|| CubeError::Fatal("publish activity without period".into()))?;
    let cube = activity.datacube_id.as_str();
    let tile = activity.tile_id.as_str();

    let bands_meta = ctx.meta.bands_of(cube).map_err(CubeError::from)?;
    let common_of: BTreeMap<&str, &str> = bands_meta
        .iter()
        .map(|b| (b.name.as_str(), b.common_name.as_str()))
        .collect();

    // Load the composite bands that were actually blended.
    let mut composites: BTreeMap<String, Raster> = BTreeMap::new();
    let mut assets: BTreeMap<String, String> = BTreeMap::new();
    for band in &payload.bands {
        let key = composite_key(cube, tile, period, band);
        if !ctx.objects.exists(&key)? {
            continue;
        }
        let raster = Raster::from_geotiff(&ctx.objects.get(&key)?, INDEX_FILL)?;
        composites.insert(band.clone(), raster);
        assets.insert(band.clone(), key);
    }
    if composites.is_empty() {
        return Err(CubeError::DataError("no composite bands to publish".into()));
    }
    for observation in [CLEAR_OBSERVATION_NAME, TOTAL_OBSERVATION_NAME, PROVENANCE_NAME] {
        let key = composite_key(cube, tile, period, observation);
        if ctx.objects.exists(&key)? {
            assets.insert(observation.to_string(), key);
        }
    }

    // Composite samples indexed by common name, for index math.
    let by_common: BTreeMap<&str, &Raster> = composites
        .iter()
        .filter_map(|(name, raster)| {
            common_of.get(name.as_str()).map(|common| (*common, raster))
        })
        .collect();

    let mut index_rasters: Vec<(String, Raster)> = Vec::new();
    for index in &payload.indices {
        let skip = payload.function == "IDENTITY"
            && matches!(index.as_str(), CLEAR_OBSERVATION_NAME | TOTAL_OBSERVATION_NAME);
        if skip {
            continue;
        }
        match derive_index(index, &by_common)? {
            Some(raster) => index_rasters.push((index.clone(), raster)),
            None => {
                return Err(CubeError::DataError(format!(
                    "index {index} inputs missing from composites"
                )));
            }
        }
    }

    let quicklook = render_quicklook(&payload.bands_quicklook, &composites)?;

    if ctx.ledger.status(&activity.activity_id)? != Some(ActivityStatus::Doing) {
        tracing::info!("publish {} cancelled, skipping artifact write", activity.activity_id);
        return Ok(());
    }

    for (index, raster) in &index_rasters {
        let key = composite_key(cube, tile, period, index);
        ctx.objects.put(&key, &raster.to_geotiff(true)?)?;
        assets.insert(index.clone(), key);
    }

    let ql_key = quicklook_key(cube, tile, period);
    ctx.objects.put(&ql_key, &quicklook)?;

    let item = CollectionItem {
        id: format!("{cube}_{tile}_{}", payload.period_start),
        collection_id: cube.to_string(),
        tile_id: tile.to_string(),
        item_date: payload.period_start.clone(),
        composite_start: payload.period_start.clone(),
        composite_end: payload.period_end.clone(),
        quicklook: ql_key,
        assets: serde_json::to_value(&assets).map_err(|e| CubeError::Fatal(e.to_string()))?,
    };
    ctx.meta.upsert_item(&item).map_err(CubeError::from)?;

    tracing::info!(
        "published {cube} {tile} {period}: {} bands, {} indices",
        composites.len(),
        index_rasters.len()
    );
    Ok(())
}

/// NDVI/EVI over scaled int16 reflectance, written back as int16 with a
/// 0.0001 scale.
fn derive_index(index: &str, by_common: &BTreeMap<&str, &Raster>) -> Result<Option<Raster>> {
    let Some(inputs) = index_inputs(index) else {
        tracing::warn!("unknown index '{index}' skipped");
        return Ok(None);
    };
    let mut rasters = Vec::with_capacity(inputs.len());
    for common in inputs {
        match by_common.get(common) {
            Some(raster) => rasters.push(*raster),
            None => return Ok(None),
        }
    }

    let template = rasters[0];
    let mut out = Raster::filled(
        template.width,
        template.height,
        template.transform,
        DataType::Int16,
        INDEX_FILL,
    );

    for p in 0..out.len() {
        if rasters.iter().any(|r| r.pixels[p] == r.fill) {
            continue;
        }
        let value = match index {
            "NDVI" => {
                let nir = f64::from(rasters[0].pixels[p]);
                let red = f64::from(rasters[1].pixels[p]);
                let denom = nir + red;
                if denom.abs() < f64::EPSILON {
                    continue;
                }
                (nir - red) / denom
            }
            "EVI" => {
                let nir = f64::from(rasters[0].pixels[p]);
                let red = f64::from(rasters[1].pixels[p]);
                let blue = f64::from(rasters[2].pixels[p]);
                // Reflectance is scaled by 1e4, so L=1 becomes 10000.
                let denom = nir + 6.0 * red - 7.5 * blue + 10000.0;
                if denom.abs() < f64::EPSILON {
                    continue;
                }
                2.5 * (nir - red) / denom
            }
            _ => continue,
        };
        out.pixels[p] = (value * INDEX_SCALE)
            .round()
            .clamp(-INDEX_SCALE, INDEX_SCALE) as i32;
    }
    Ok(Some(out))
}

/// Stack the three configured quicklook bands into an RGB PNG with a
/// 2-98% percentile stretch per band.
fn render_quicklook(bands: &[String], composites: &BTreeMap<String, Raster>) -> Result<Vec<u8>> {
    let mut channels: Vec<&Raster> = Vec::with_capacity(3);
    for band in bands.iter().take(3) {
        let raster = composites
            .get(band)
            .ok_or_else(|| CubeError::DataError(format!("quicklook band {band} missing")))?;
        channels.push(raster);
    }
    if channels.is_empty() {
        return Err(CubeError::DataError("cube has no quicklook bands".into()));
    }
    while channels.len() < 3 {
        channels.push(channels[channels.len() - 1]);
    }

    let (width, height) = (channels[0].width, channels[0].height);
    let stretches: Vec<(f64, f64)> = channels.iter().map(|r| percentile_clip(r, 2.0, 98.0)).collect();

    let img = RgbImage::from_fn(width, height, |x, y| {
        let mut rgb = [0u8; 3];
        for (c, raster) in channels.iter().enumerate() {
            let v = raster.get(x, y);
            rgb[c] = if v == raster.fill {
                0
            } else {
                let (lo, hi) = stretches[c];
                let span = (hi - lo).max(1.0);
                ((f64::from(v) - lo) / span * 255.0).clamp(0.0, 255.0) as u8
            };
        }
        image::Rgb(rgb)
    });

    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageFormat::Png)
        .map_err(|e| CubeError::DataError(format!("quicklook encode: {e}")))?;
    Ok(bytes.into_inner())
}

/// Low/high cut values for a percent-clip stretch over non-fill samples.
fn percentile_clip(raster: &Raster, low: f64, high: f64) -> (f64, f64) {
    let mut samples: Vec<i32> = raster
        .pixels
        .iter()
        .copied()
        .filter(|&v| v != raster.fill)
        .collect();
    if samples.is_empty() {
        return (0.0, 255.0);
    }
    samples.sort_unstable();
    let rank = |pct: f64| -> f64 {
        let idx = ((pct / 100.0) * (samples.len() - 1) as f64).round() as usize;
        f64::from(samples[idx.min(samples.len() - 1)])
    };
    (rank(low), rank(high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::GeoTransform;

    fn raster(pixels: Vec<i32>, fill: i32) -> Raster {
        let side = (pixels.len() as f64).sqrt() as u32;
        Raster {
            width: side,
            height: side,
            transform: GeoTransform {
                origin_x: 0.0,
                origin_y: 0.0,
                res_x: 10.0,
                res_y: 10.0,
            },
            dtype: DataType::Int16,
            fill,
            pixels,
        }
    }

    #[test]
    fn ndvi_matches_hand_computation() {
        let nir = raster(vec![8000, 5000, INDEX_FILL, 0], INDEX_FILL);
        let red = raster(vec![2000, 5000, 1000, 0], INDEX_FILL);
        let mut by_common: BTreeMap<&str, &Raster> = BTreeMap::new();
        by_common.insert("nir", &nir);
        by_common.insert("red", &red);

        let out = derive_index("NDVI", &by_common).unwrap().unwrap();
        // (8000-2000)/(8000+2000) = 0.6 -> 6000.
        assert_eq!(out.pixels[0], 6000);
        assert_eq!(out.pixels[1], 0);
        // Fill input propagates fill; 0/0 stays fill.
        assert_eq!(out.pixels[2], INDEX_FILL);
        assert_eq!(out.pixels[3], INDEX_FILL);
    }

    #[test]
    fn evi_uses_blue_correction() {
        let nir = raster(vec![6000], INDEX_FILL);
        let red = raster(vec![2000], INDEX_FILL);
        let blue = raster(vec![1000], INDEX_FILL);
        let mut by_common: BTreeMap<&str, &Raster> = BTreeMap::new();
        by_common.insert("nir", &nir);
        by_common.insert("red", &red);
        by_common.insert("blue", &blue);

        let out = derive_index("EVI", &by_common).unwrap().unwrap();
        // 2.5 * 4000 / (6000 + 12000 - 7500 + 10000) = 0.48780 -> 4878.
        assert_eq!(out.pixels[0], 4878);
    }

    #[test]
    fn missing_index_input_reports_none() {
        let nir = raster(vec![1000], INDEX_FILL);
        let mut by_common: BTreeMap<&str, &Raster> = BTreeMap::new();
        by_common.insert("nir", &nir);
        assert!(derive_index("NDVI", &by_common).unwrap().is_none());
    }

    #[test]
    fn quicklook_is_a_decodable_png() {
        let mut composites = BTreeMap::new();
        composites.insert("B04".to_string(), raster(vec![100, 500, 900, 1500], -9999));
        composites.insert("B03".to_string(), raster(vec![200, 600, 1000, -9999], -9999));
        composites.insert("B02".to_string(), raster(vec![300, 700, 1100, 1900], -9999));

        let bands = vec!["B04".to_string(), "B03".to_string(), "B02".to_string()];
        let png = render_quicklook(&bands, &composites).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!(decoded.width(), 2);
        assert_eq!(decoded.height(), 2);
    }

    #[test]
    fn percentile_clip_ignores_fill() {
        let r = raster(vec![-9999, 10, 20, 30], -9999);
        let (lo, hi) = percentile_clip(&r, 2.0, 98.0);
        assert!(lo >= 10.0);
        assert!(hi <= 30.0);
    }
}
