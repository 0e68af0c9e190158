//! MERGE: warp one band of one scene onto one tile grid.

use crate::error::{CubeError, Result};
use crate::models::activity::{Activity, MergePayload};
use crate::models::cube::BandKind;
use crate::raster::{DataType, GeoTransform, Raster, Resampling};
use crate::workers::WorkerContext;

/// Quality codebook (Fmask-style).
pub const QUALITY_CLEAR_LAND: i32 = 0;
pub const QUALITY_CLEAR_WATER: i32 = 1;
pub const QUALITY_CLOUD_SHADOW: i32 = 2;
pub const QUALITY_SNOW: i32 = 3;
pub const QUALITY_CLOUD: i32 = 4;
pub const QUALITY_NODATA: i32 = 255;

/// Runs on the blocking pool; every object-store and HTTP call is sync.
pub fn run(ctx: &WorkerContext, activity: &Activity) -> Result<()> {
    let mut payload: MergePayload = serde_json::from_value(activity.activity.clone())
        .map_err(|e| CubeError::Fatal(format!("bad merge payload: {e}")))?;

    let source_bytes = fetch_asset(ctx, &payload.asset_href)?;
    let source = Raster::from_geotiff(&source_bytes, payload.fill)?;

    let transform = GeoTransform {
        origin_x: payload.origin_x,
        origin_y: payload.origin_y,
        res_x: payload.res_x,
        res_y: payload.res_y,
    };
    let resampling = match payload.resampling.as_str() {
        "nearest" => Resampling::Nearest,
        _ => Resampling::Bilinear,
    };
    let dtype = DataType::parse(&payload.data_type);

    let mut target = Raster::filled(payload.width, payload.height, transform, dtype, payload.fill);
    target.warp_from(&source, resampling);

    payload.efficacy = Some(target.efficacy());
    if payload.kind != BandKind::Quality {
        if let Some(quality_href) = payload.quality_href.clone() {
            match fetch_asset(ctx, &quality_href).and_then(|b| Raster::from_geotiff(&b, QUALITY_NODATA)) {
                Ok(quality_src) => {
                    let mut quality = Raster::filled(
                        payload.width,
                        payload.height,
                        transform,
                        DataType::UInt8,
                        QUALITY_NODATA,
                    );
                    quality.warp_from(&quality_src, Resampling::Nearest);
                    payload.cloud_ratio = Some(cloud_ratio(&quality));
                }
                Err(e) => {
                    tracing::warn!(
                        "merge {}: quality mask unreadable, skipping cloud stats: {e}",
                        activity.activity_id
                    );
                }
            }
        }
    }

    // Cancellation check: the build may have been aborted while warping.
    if ctx.ledger.status(&activity.activity_id)?
        != Some(crate::models::activity::ActivityStatus::Doing)
    {
        tracing::info!("merge {} cancelled, skipping artifact write", activity.activity_id);
        return Ok(());
    }

    let bytes = target.to_geotiff(false)?;
    ctx.objects.put(&payload.dest_key, &bytes)?;

    ctx.ledger.update_payload(
        &activity.activity_id,
        &serde_json::to_value(&payload).map_err(|e| CubeError::Fatal(e.to_string()))?,
    )?;

    tracing::debug!(
        "merged {} {} {} efficacy {:.3}",
        payload.scene_id,
        payload.band,
        activity.tile_id,
        payload.efficacy.unwrap_or(0.0)
    );
    Ok(())
}

/// Fraction of cloud/shadow/snow pixels among observed ones.
fn cloud_ratio(quality: &Raster) -> f64 {
    let mut observed = 0usize;
    let mut cloudy = 0usize;
    for &q in &quality.pixels {
        if q == QUALITY_NODATA {
            continue;
        }
        observed += 1;
        if matches!(q, QUALITY_CLOUD | QUALITY_CLOUD_SHADOW | QUALITY_SNOW) {
            cloudy += 1;
        }
    }
    if observed == 0 {
        0.0
    } else {
        cloudy as f64 / observed as f64
    }
}

/// Resolve a scene asset: remote scenes over HTTP, everything else as a
/// local path first and an object-store key second.
fn fetch_asset(ctx: &WorkerContext, href: &str) -> Result<Vec<u8>> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return fetch_http(href);
    }
    if let Some(path) = href.strip_prefix("file://") {
        return std::fs::read(path).map_err(|e| CubeError::DataError(format!("read {href}: {e}")));
    }
    if std::path::Path::new(href).exists() {
        return std::fs::read(href).map_err(|e| CubeError::Transient(format!("read {href}: {e}")));
    }
    ctx.objects.get(href)
}

fn fetch_http(href: &str) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .map_err(|e| CubeError::Fatal(e.to_string()))?;
    let response = client.get(href).send().map_err(|e| {
        if e.is_timeout() || e.is_connect() {
            CubeError::Transient(format!("fetch {href}: {e}"))
        } else {
            CubeError::DataError(format!("fetch {href}: {e}"))
        }
    })?;
    let status = response.status();
    if status.is_server_error() {
        return Err(CubeError::Transient(format!("fetch {href}: {status}")));
    }
    if !status.is_success() {
        return Err(CubeError::DataError(format!("fetch {href}: {status}")));
    }
    response
        .bytes()
        .map(|b| b.to_vec())
        .map_err(|e| CubeError::Transient(format!("fetch {href}: {e}")))
}
