//! BLEND: reduce the merges of one `(tile, band, period)` into a composite.
//!
//! All merge rasters of a period share grid, extent and dtype by
//! construction, so the kernels operate on parallel pixel buffers. A pixel
//! is valid at a scene iff the paired quality mask classifies it as clear
//! (land or water) and the band sample is not fill. Tie-break rules make
//! every composite bitwise deterministic for the same input set.

use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;

use crate::error::{CubeError, Result};
use crate::models::activity::{Activity, ActivityStatus, BlendPayload, MergePayload};
use crate::models::cube::{
    BandKind, CLEAR_OBSERVATION_NAME, PROVENANCE_NAME, TOTAL_OBSERVATION_NAME,
};
use crate::raster::{DataType, Raster};
use crate::workers::WorkerContext;
use crate::workers::merge::{QUALITY_CLEAR_LAND, QUALITY_CLEAR_WATER, QUALITY_NODATA};

pub const PROVENANCE_FILL: i32 = -1;

/// One scene's contribution to a blend: band samples, the paired quality
/// codes, and its position in the temporal order.
pub struct SceneLayer {
    pub scene_id: String,
    /// Day of year, written into PROVENANCE.
    pub doy: i32,
    /// Days since CE, total temporal order across year boundaries.
    pub date_ord: i64,
    /// Band samples; `None` for provenance/observation runs without a band.
    pub values: Option<Vec<i32>>,
    pub fill: i32,
    /// Quality codes; `None` when the cube carries no quality band.
    pub quality: Option<Vec<i32>>,
}

impl SceneLayer {
    fn clear_at(&self, p: usize) -> bool {
        match &self.quality {
            Some(q) => q[p] == QUALITY_CLEAR_LAND || q[p] == QUALITY_CLEAR_WATER,
            None => true,
        }
    }

    /// Valid = clear sky and inside the source footprint.
    pub fn valid_at(&self, p: usize) -> bool {
        self.clear_at(p)
            && match &self.values {
                Some(v) => v[p] != self.fill,
                None => true,
            }
    }

    /// Observed = the scene covers the pixel at all.
    pub fn observed_at(&self, p: usize) -> bool {
        match &self.quality {
            Some(q) => q[p] != QUALITY_NODATA,
            None => self
                .values
                .as_ref()
                .map(|v| v[p] != self.fill)
                .unwrap_or(false),
        }
    }
}

/// Ascending temporal order: date, then scene id. The stack scan relies on
/// this so that "later valid observation wins".
fn sort_layers(layers: &mut [SceneLayer]) {
    layers.sort_by(|a, b| {
        a.date_ord
            .cmp(&b.date_ord)
            .then_with(|| a.scene_id.cmp(&b.scene_id))
    });
}

/// STK (best pixel): the latest valid observation at each pixel, with the
/// contributing scene's day-of-year as provenance.
pub fn stack_composite(layers: &mut [SceneLayer], len: usize, fill: i32) -> (Vec<i32>, Vec<i32>) {
    sort_layers(layers);
    let mut values = vec![fill; len];
    let mut provenance = vec![PROVENANCE_FILL; len];
    for layer in layers.iter() {
        for p in 0..len {
            if layer.valid_at(p) {
                if let Some(v) = &layer.values {
                    values[p] = v[p];
                }
                provenance[p] = layer.doy;
            }
        }
    }
    (values, provenance)
}

/// MED: per-pixel median of valid observations. Provenance is the scene
/// whose value equals the median, latest date first; with an even count
/// the value is the mean of the two middle observations and provenance is
/// the later of those two contributors.
pub fn median_composite(layers: &mut [SceneLayer], len: usize, fill: i32) -> (Vec<i32>, Vec<i32>) {
    sort_layers(layers);
    let mut values = vec![fill; len];
    let mut provenance = vec![PROVENANCE_FILL; len];

    let mut samples: Vec<(i32, i64, usize)> = Vec::with_capacity(layers.len());
    for p in 0..len {
        samples.clear();
        for (idx, layer) in layers.iter().enumerate() {
            if let Some(v) = &layer.values {
                if layer.valid_at(p) {
                    samples.push((v[p], layer.date_ord, idx));
                }
            }
        }
        if samples.is_empty() {
            continue;
        }
        samples.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| layers[a.2].scene_id.cmp(&layers[b.2].scene_id))
        });

        let n = samples.len();
        if n % 2 == 1 {
            let mid = samples[n / 2];
            values[p] = mid.0;
            provenance[p] = layers[mid.2].doy;
        } else {
            let lo = samples[n / 2 - 1];
            let hi = samples[n / 2];
            values[p] = (lo.0 + hi.0) / 2;
            let later = if (hi.1, &layers[hi.2].scene_id) >= (lo.1, &layers[lo.2].scene_id) {
                hi
            } else {
                lo
            };
            provenance[p] = layers[later.2].doy;
        }
    }
    (values, provenance)
}

/// CLEAROB: per-pixel count of valid (clear) observations.
pub fn clear_observations(layers: &[SceneLayer], len: usize) -> Vec<i32> {
    let mut counts = vec![0; len];
    for layer in layers {
        for (p, count) in counts.iter_mut().enumerate() {
            if layer.valid_at(p) {
                *count += 1;
            }
        }
    }
    counts
}

/// TOTALOB: per-pixel count of observations that are not nodata.
pub fn total_observations(layers: &[SceneLayer], len: usize) -> Vec<i32> {
    let mut counts = vec![0; len];
    for layer in layers {
        for (p, count) in counts.iter_mut().enumerate() {
            if layer.observed_at(p) {
                *count += 1;
            }
        }
    }
    counts
}

pub fn day_of_year(date: NaiveDate) -> i32 {
    date.ordinal() as i32
}

/// Runs on the blocking pool.
pub fn run(ctx: &WorkerContext, activity: &Activity) -> Result<()> {
    let payload: BlendPayload = serde_json::from_value(activity.activity.clone())
        .map_err(|e| CubeError::Fatal(format!("bad blend payload: {e}")))?;
    let reference_band = activity
        .activity
        .get("reference_band")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let period = activity
        .period
        .as_deref()
        .ok_or_else(|| CubeError::Fatal("blend activity without period".into()))?;

    // Discover this period's finished merges from the ledger.
    let merges: Vec<MergePayload> = ctx
        .ledger
        .activities_for(&payload.irregular_cube, &activity.tile_id, period, crate::models::activity::ActivityAction::Merge)?
        .into_iter()
        .filter(|a| a.mystatus == ActivityStatus::Done)
        .filter_map(|a| serde_json::from_value(a.activity).ok())
        .collect();
    if merges.is_empty() {
        return Err(CubeError::DataError("no finished merges to blend".into()));
    }

    // The band whose samples drive this blend, if any.
    let sample_band = match payload.band.as_str() {
        CLEAR_OBSERVATION_NAME | TOTAL_OBSERVATION_NAME => None,
        PROVENANCE_NAME => {
            if payload.function == "MED" {
                reference_band
            } else {
                None
            }
        }
        band => Some(band.to_string()),
    };

    let mut layers = build_layers(ctx, &merges, sample_band.as_deref())?;
    if layers.is_empty() {
        return Err(CubeError::DataError(format!(
            "no usable merges for band {}",
            payload.band
        )));
    }

    // Grid comes from any input; all merges share it by construction.
    let grid = grid_of(ctx, &merges)?;
    let len = (grid.width as usize) * (grid.height as usize);
    for layer in &layers {
        if let Some(v) = &layer.values {
            if v.len() != len {
                return Err(CubeError::DataError("merge grids disagree".into()));
            }
        }
    }

    let dtype = DataType::parse(&payload.data_type);
    let pixels = match payload.band.as_str() {
        CLEAR_OBSERVATION_NAME => clear_observations(&layers, len),
        TOTAL_OBSERVATION_NAME => total_observations(&layers, len),
        PROVENANCE_NAME => match payload.function.as_str() {
            "MED" => median_composite(&mut layers, len, payload.fill).1,
            _ => stack_composite(&mut layers, len, payload.fill).1,
        },
        _ => match payload.function.as_str() {
            "MED" => median_composite(&mut layers, len, payload.fill).0,
            "STK" => stack_composite(&mut layers, len, payload.fill).0,
            "IDENTITY" => {
                // Degenerate: a single scene copied through unchanged.
                let layer = layers
                    .iter()
                    .find(|l| l.values.is_some())
                    .ok_or_else(|| CubeError::DataError("identity blend without samples".into()))?;
                layer.values.clone().unwrap_or_default()
            }
            other => {
                return Err(CubeError::Fatal(format!("unknown composite function '{other}'")));
            }
        },
    };

    let mut out = Raster::filled(grid.width, grid.height, grid.transform, dtype, payload.fill);
    out.pixels = pixels;

    if ctx.ledger.status(&activity.activity_id)? != Some(ActivityStatus::Doing) {
        tracing::info!("blend {} cancelled, skipping artifact write", activity.activity_id);
        return Ok(());
    }

    let bytes = out.to_geotiff(true)?;
    ctx.objects.put(&payload.dest_key, &bytes)?;
    tracing::debug!(
        "blended {} {} {} ({} scenes)",
        activity.datacube_id,
        payload.band,
        period,
        layers.len()
    );
    Ok(())
}

struct BlendGrid {
    width: u32,
    height: u32,
    transform: crate::raster::GeoTransform,
}

fn grid_of(ctx: &WorkerContext, merges: &[MergePayload]) -> Result<BlendGrid> {
    let first = &merges[0];
    let raster = Raster::from_geotiff(&ctx.objects.get(&first.dest_key)?, first.fill)?;
    Ok(BlendGrid {
        width: raster.width,
        height: raster.height,
        transform: raster.transform,
    })
}

/// Assemble one layer per scene: the requested band's samples (if any)
/// paired with the scene's quality codes.
fn build_layers(
    ctx: &WorkerContext,
    merges: &[MergePayload],
    sample_band: Option<&str>,
) -> Result<Vec<SceneLayer>> {
    #[derive(Default)]
    struct SceneParts {
        acquired: Option<NaiveDate>,
        band_key: Option<String>,
        band_fill: i32,
        quality_key: Option<String>,
    }

    let mut scenes: BTreeMap<String, SceneParts> = BTreeMap::new();
    for merge in merges {
        let parts = scenes.entry(merge.scene_id.clone()).or_default();
        let acquired = NaiveDate::parse_from_str(&merge.acquired, "%Y-%m-%d")
            .map_err(|_| CubeError::DataError(format!("bad acquisition date '{}'", merge.acquired)))?;
        parts.acquired = Some(acquired);
        if merge.kind == BandKind::Quality {
            parts.quality_key = Some(merge.dest_key.clone());
        } else if Some(merge.band.as_str()) == sample_band {
            parts.band_key = Some(merge.dest_key.clone());
            parts.band_fill = merge.fill;
        }
    }

    let mut layers = Vec::new();
    for (scene_id, parts) in scenes {
        let Some(acquired) = parts.acquired else {
            continue;
        };
        // A scene contributes only if it has what this blend needs.
        if sample_band.is_some() && parts.band_key.is_none() {
            continue;
        }
        if sample_band.is_none() && parts.quality_key.is_none() && parts.band_key.is_none() {
            continue;
        }

        let values = match &parts.band_key {
            Some(key) => Some(
                Raster::from_geotiff(&ctx.objects.get(key)?, parts.band_fill)?.pixels,
            ),
            None => None,
        };
        let quality = match &parts.quality_key {
            Some(key) => Some(
                Raster::from_geotiff(&ctx.objects.get(key)?, QUALITY_NODATA)?.pixels,
            ),
            None => None,
        };

        layers.push(SceneLayer {
            scene_id,
            doy: day_of_year(acquired),
            date_ord: i64::from(acquired.num_days_from_ce()),
            values,
            fill: parts.band_fill,
            quality,
        });
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILL: i32 = -9999;

    fn layer(scene_id: &str, date: &str, values: Vec<i32>, quality: Vec<i32>) -> SceneLayer {
        let acquired = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        SceneLayer {
            scene_id: scene_id.into(),
            doy: day_of_year(acquired),
            date_ord: i64::from(acquired.num_days_from_ce()),
            values: Some(values),
            fill: FILL,
            quality: Some(quality),
        }
    }

    // Three clear scenes on days 5, 15, 25 of January.
    fn three_clear_scenes() -> Vec<SceneLayer> {
        vec![
            layer("S05", "2019-01-05", vec![100, 100], vec![0, 0]),
            layer("S15", "2019-01-15", vec![200, 200], vec![0, 1]),
            layer("S25", "2019-01-25", vec![300, 300], vec![1, 0]),
        ]
    }

    #[test]
    fn stk_picks_latest_clear_scene() {
        let mut layers = three_clear_scenes();
        let (values, provenance) = stack_composite(&mut layers, 2, FILL);
        assert_eq!(values, vec![300, 300]);
        assert_eq!(provenance, vec![25, 25]);
        assert_eq!(clear_observations(&layers, 2), vec![3, 3]);
        assert_eq!(total_observations(&layers, 2), vec![3, 3]);
    }

    #[test]
    fn stk_falls_back_where_latest_is_cloudy() {
        // Day 15 fully cloudy; day 25 clear only at pixel 0.
        let mut layers = vec![
            layer("S05", "2019-01-05", vec![100, 100], vec![0, 0]),
            layer("S15", "2019-01-15", vec![200, 200], vec![4, 4]),
            layer("S25", "2019-01-25", vec![300, 300], vec![0, 4]),
        ];
        let (values, provenance) = stack_composite(&mut layers, 2, FILL);
        assert_eq!(values, vec![300, 100]);
        assert_eq!(provenance, vec![25, 5]);
        assert_eq!(clear_observations(&layers, 2), vec![2, 1]);
        assert_eq!(total_observations(&layers, 2), vec![3, 3]);
    }

    #[test]
    fn stk_no_valid_observation_writes_fill() {
        let mut layers = vec![
            layer("S05", "2019-01-05", vec![100], vec![4]),
            layer("S15", "2019-01-15", vec![200], vec![2]),
        ];
        let (values, provenance) = stack_composite(&mut layers, 1, FILL);
        assert_eq!(values, vec![FILL]);
        assert_eq!(provenance, vec![PROVENANCE_FILL]);
    }

    #[test]
    fn stk_single_scene_equals_merge() {
        let mut layers = vec![layer("S05", "2019-01-05", vec![42, FILL], vec![0, 255])];
        let (values, provenance) = stack_composite(&mut layers, 2, FILL);
        assert_eq!(values, vec![42, FILL]);
        assert_eq!(provenance, vec![5, PROVENANCE_FILL]);
    }

    #[test]
    fn stk_date_tie_breaks_by_scene_id() {
        let mut layers = vec![
            layer("S2B_0002", "2019-01-15", vec![222], vec![0]),
            layer("S2A_0001", "2019-01-15", vec![111], vec![0]),
        ];
        let (values, _) = stack_composite(&mut layers, 1, FILL);
        // Lexicographically greater scene id wins the exact-date tie.
        assert_eq!(values, vec![222]);
    }

    #[test]
    fn med_even_count_averages_middle_pair() {
        // Values [100, 300] -> 200, provenance of the later contributor.
        let mut layers = vec![
            layer("S05", "2019-01-05", vec![100], vec![0]),
            layer("S20", "2019-01-20", vec![300], vec![0]),
        ];
        let (values, provenance) = median_composite(&mut layers, 1, FILL);
        assert_eq!(values, vec![200]);
        assert_eq!(provenance, vec![20]);
    }

    #[test]
    fn med_odd_count_picks_middle() {
        let mut layers = three_clear_scenes();
        let (values, provenance) = median_composite(&mut layers, 2, FILL);
        assert_eq!(values, vec![200, 200]);
        assert_eq!(provenance, vec![15, 15]);
    }

    #[test]
    fn med_is_permutation_invariant() {
        let mut forward = three_clear_scenes();
        let (v1, p1) = median_composite(&mut forward, 2, FILL);

        let mut shuffled = three_clear_scenes();
        shuffled.reverse();
        let (v2, p2) = median_composite(&mut shuffled, 2, FILL);

        assert_eq!(v1, v2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn med_ignores_invalid_observations() {
        let mut layers = vec![
            layer("S05", "2019-01-05", vec![100], vec![0]),
            layer("S15", "2019-01-15", vec![9000], vec![4]),
            layer("S25", "2019-01-25", vec![300], vec![0]),
        ];
        let (values, _) = median_composite(&mut layers, 1, FILL);
        assert_eq!(values, vec![200]);
    }

    #[test]
    fn clearob_bounded_by_totalob() {
        let layers = vec![
            layer("S05", "2019-01-05", vec![100, FILL, 100], vec![0, 255, 4]),
            layer("S15", "2019-01-15", vec![200, 200, 200], vec![1, 0, 255]),
        ];
        let clear = clear_observations(&layers, 3);
        let total = total_observations(&layers, 3);
        for p in 0..3 {
            assert!(clear[p] <= total[p]);
            assert!(total[p] <= 2);
        }
        assert_eq!(clear, vec![2, 1, 0]);
        assert_eq!(total, vec![2, 1, 1]);
    }

    #[test]
    fn footprint_gap_is_not_valid_even_when_clear() {
        let layers = vec![layer("S05", "2019-01-05", vec![FILL], vec![0])];
        assert!(!layers[0].valid_at(0));
        assert_eq!(clear_observations(&layers, 1), vec![0]);
    }
}
