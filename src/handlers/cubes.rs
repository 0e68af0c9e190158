use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};

use crate::AppState;
use crate::cube_id::CubeId;
use crate::error::CubeError;
use crate::handlers::{http_err, internal_err};
use crate::ledger::union_duration;
use crate::models::activity::{ActivityStatus, MergePayload};
use crate::models::cube::{
    Band, BandKind, CLEAR_OBSERVATION_NAME, Collection, PROVENANCE_NAME, TOTAL_OBSERVATION_NAME,
};
use crate::models::request::{
    BuildRequest, CancelRequest, CreateCubeRequest, ItemsQuery, MergesQuery, StatusQuery,
    StatusResponse,
};

/// Map conventional sensor band names onto spectral common names, so the
/// publish stage can find NDVI/EVI inputs.
fn common_name_for(band: &str) -> String {
    match band {
        "B01" | "coastal" => "coastal".into(),
        "B02" | "sr_band2" => "blue".into(),
        "B03" | "sr_band3" => "green".into(),
        "B04" | "sr_band4" => "red".into(),
        "B08" | "B8A" | "sr_band5" => "nir".into(),
        "B11" | "sr_band6" => "swir16".into(),
        "B12" | "sr_band7" => "swir22".into(),
        other => other.to_lowercase(),
    }
}

fn classify_band(band: &str) -> BandKind {
    match band {
        "quality" | "Fmask" | "cnc" => BandKind::Quality,
        "NDVI" | "EVI" => BandKind::Index,
        CLEAR_OBSERVATION_NAME | TOTAL_OBSERVATION_NAME | PROVENANCE_NAME => BandKind::Observation,
        _ => BandKind::Reflectance,
    }
}

/// Create the cube definition: the composite collection, its irregular
/// (IDENTITY) sibling, and their band rows. Existing collections are left
/// untouched.
pub async fn create_cube(
    State(state): State<AppState>,
    Json(req): Json<CreateCubeRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if req.resolution == 0 {
        return Err(http_err(CubeError::Validation("resolution must be positive".into())));
    }
    if state
        .meta
        .get_grs(&req.grs)
        .map_err(internal_err)?
        .is_none()
    {
        return Err(http_err(CubeError::NotFound(format!("grid '{}'", req.grs))));
    }

    let irregular_id = format!("{}_{}", req.datacube, req.resolution);
    let raster_size_id = format!("{}-{}", req.grs, req.resolution);

    let mut created = Vec::new();

    // The irregular cube carries the acquirable bands, quality included.
    let identity = Collection {
        id: irregular_id.clone(),
        is_cube: true,
        grs_schema_id: req.grs.clone(),
        raster_size_schema_id: raster_size_id.clone(),
        temporal_composition_schema_id: "Anull".into(),
        composite_function_id: "IDENTITY".into(),
        bands_quicklook: req.bands_quicklook.clone(),
        license: req.license.clone(),
        description: req.description.clone(),
    };
    if state.meta.create_collection(&identity).map_err(internal_err)? {
        let bands: Vec<Band> = req
            .bands
            .iter()
            .map(|name| {
                let mut band = Band::with_defaults(
                    name,
                    &irregular_id,
                    classify_band(name),
                    f64::from(req.resolution),
                );
                band.common_name = common_name_for(name);
                band
            })
            .filter(|b| !b.kind.is_derived())
            .collect();
        state.meta.insert_bands(&bands).map_err(internal_err)?;
        created.push(identity.clone());
    }

    if req.composite_function != "IDENTITY" {
        let temporal_id = req.temporal_schema.clone().ok_or_else(|| {
            http_err(CubeError::Validation(
                "temporal_schema is required for composite cubes".into(),
            ))
        })?;
        let temporal = state
            .meta
            .get_temporal_schema(&temporal_id)
            .map_err(internal_err)?
            .ok_or_else(|| http_err(CubeError::NotFound(format!("temporal schema '{temporal_id}'"))))?;

        let unit_letter = temporal
            .temporal_composite_unit
            .chars()
            .next()
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or('D');
        let temporal_label = format!("{}{}", temporal.temporal_composite_t, unit_letter);
        let composite_id = CubeId::composite(
            &req.datacube,
            req.resolution,
            &temporal_label,
            &req.composite_function,
        );

        let composite = Collection {
            id: composite_id.clone(),
            is_cube: true,
            grs_schema_id: req.grs.clone(),
            raster_size_schema_id: raster_size_id,
            temporal_composition_schema_id: temporal_id,
            composite_function_id: req.composite_function.clone(),
            bands_quicklook: req.bands_quicklook.clone(),
            license: req.license,
            description: req.description,
        };
        if state.meta.create_collection(&composite).map_err(internal_err)? {
            let mut bands = Vec::new();
            for name in &req.bands {
                let kind = classify_band(name);
                // Composite cubes have no acquired quality band.
                if kind == BandKind::Quality {
                    continue;
                }
                let mut band =
                    Band::with_defaults(name, &composite_id, kind, f64::from(req.resolution));
                band.common_name = common_name_for(name);
                bands.push(band);
            }
            for name in [CLEAR_OBSERVATION_NAME, TOTAL_OBSERVATION_NAME, PROVENANCE_NAME] {
                bands.push(Band::with_defaults(
                    name,
                    &composite_id,
                    BandKind::Observation,
                    f64::from(req.resolution),
                ));
            }
            state.meta.insert_bands(&bands).map_err(internal_err)?;
            created.push(composite);
        }
    }

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_cubes(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let cubes = state.meta.list_cubes().map_err(internal_err)?;
    let mut out = Vec::with_capacity(cubes.len());
    for cube in cubes {
        let mut not_done = 0usize;
        let mut errors = 0usize;
        let mut total = 0usize;
        let Ok(cube_id) = CubeId::parse(&cube.id) else {
            continue;
        };
        let mut ids = vec![cube_id.irregular()];
        if !cube_id.is_identity() {
            ids.push(cube.id.clone());
        }
        for id in ids {
            for act in state.ledger.activities_by_datacube(&id).map_err(internal_err)? {
                total += 1;
                match act.mystatus {
                    ActivityStatus::NotDone | ActivityStatus::Doing => not_done += 1,
                    ActivityStatus::Error => errors += 1,
                    ActivityStatus::Done => {}
                }
            }
        }
        let mut value = serde_json::to_value(&cube).unwrap_or(serde_json::Value::Null);
        if total > 0 {
            value["finished"] = serde_json::json!(not_done + errors == 0);
            value["status"] = serde_json::json!(if errors > 0 {
                "Error"
            } else if not_done == 0 {
                "Finished"
            } else {
                "Pending"
            });
            out.push(value);
        }
    }
    Ok(Json(out))
}

pub async fn get_cube(
    State(state): State<AppState>,
    Path(cube_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let cube = state
        .meta
        .get_collection(&cube_id)
        .map_err(internal_err)?
        .filter(|c| c.is_cube)
        .ok_or_else(|| http_err(CubeError::NotFound(format!("cube '{cube_id}'"))))?;

    let bands = state.meta.bands_of(&cube_id).map_err(internal_err)?;
    let temporal = state.meta.item_extent(&cube_id).map_err(internal_err)?;
    let schema = state
        .meta
        .get_temporal_schema(&cube.temporal_composition_schema_id)
        .map_err(internal_err)?;

    let mut value = serde_json::to_value(&cube).unwrap_or(serde_json::Value::Null);
    value["bands"] = serde_json::to_value(&bands).unwrap_or_default();
    value["temporal"] = match temporal {
        Some((start, end)) => serde_json::json!([start, end]),
        None => serde_json::json!([]),
    };
    if let Some(schema) = schema {
        value["temporal_composition"] = serde_json::json!({
            "schema": schema.temporal_schema,
            "step": schema.temporal_composite_t,
            "unit": schema.temporal_composite_unit,
        });
    }
    Ok(Json(value))
}

pub async fn list_cube_tiles(
    State(state): State<AppState>,
    Path(cube_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let tiles = state.meta.list_item_tiles(&cube_id).map_err(internal_err)?;
    Ok(Json(tiles))
}

pub async fn list_cube_items(
    State(state): State<AppState>,
    Path(cube_id): Path<String>,
    Query(query): Query<ItemsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let cube = state
        .meta
        .get_collection(&cube_id)
        .map_err(internal_err)?
        .filter(|c| c.is_cube)
        .ok_or_else(|| http_err(CubeError::NotFound(format!("cube '{cube_id}'"))))?;

    // Tile filter: explicit list intersected with the bbox, if given.
    let mut tile_filter: Option<Vec<String>> = query
        .tiles
        .as_ref()
        .map(|t| t.split(',').map(|s| s.trim().to_string()).collect());

    if let Some(bbox_str) = &query.bbox {
        let bbox = crate::grid::BoundingBox::parse(bbox_str).map_err(http_err)?;
        let mut touched = Vec::new();
        for tile in state.meta.list_tiles(&cube.grs_schema_id).map_err(internal_err)? {
            let (w, s, e, n) = crate::grid::tile_bbox_wgs84(&tile).map_err(http_err)?;
            if w <= bbox.e && e >= bbox.w && s <= bbox.n && n >= bbox.s {
                touched.push(tile.id);
            }
        }
        tile_filter = Some(match tile_filter {
            Some(filter) => filter.into_iter().filter(|t| touched.contains(t)).collect(),
            None => touched,
        });
    }

    let (items, total) = state
        .meta
        .list_items(
            &cube_id,
            tile_filter.as_deref(),
            query.start.as_deref(),
            query.end.as_deref(),
            query.page,
            query.per_page,
        )
        .map_err(internal_err)?;

    let per_page = query.per_page.max(1);
    Ok(Json(serde_json::json!({
        "items": items,
        "page": query.page,
        "per_page": per_page,
        "total_items": total,
        "total_pages": total.div_ceil(per_page as usize),
    })))
}

/// Build metadata of the identity cube, recovered from its newest activity.
pub async fn get_cube_meta(
    State(state): State<AppState>,
    Path(cube_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let parsed = CubeId::parse(&cube_id).map_err(http_err)?;
    let activity = state
        .ledger
        .newest_activity(&parsed.irregular())
        .map_err(internal_err)?
        .ok_or_else(|| {
            http_err(CubeError::Validation(format!(
                "there is no build activity for cube '{cube_id}'"
            )))
        })?;
    let payload: MergePayload = serde_json::from_value(activity.activity)
        .map_err(|e| internal_err(anyhow::anyhow!("bad activity payload: {e}")))?;
    Ok(Json(serde_json::json!({
        "url_stac": payload.url_stac,
        "collections": payload.datasets.join(","),
        "bucket": payload.bucket_name,
        "satellite": payload.satellite,
    })))
}

/// Merge inspection for a tile and date window: per-scene efficacy and
/// cloud statistics.
pub async fn list_merges(
    State(state): State<AppState>,
    Path(cube_id): Path<String>,
    Query(query): Query<MergesQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let parsed = CubeId::parse(&cube_id).map_err(http_err)?;
    let merges = state
        .ledger
        .merges_in_window(&parsed.irregular(), &query.tile, &query.start, &query.end)
        .map_err(internal_err)?;

    let mut out = Vec::with_capacity(merges.len());
    for act in merges {
        let payload: Option<MergePayload> = serde_json::from_value(act.activity).ok();
        out.push(serde_json::json!({
            "activity_id": act.activity_id,
            "band": act.band,
            "period": act.period,
            "status": act.mystatus,
            "error": act.error_msg,
            "scene_id": payload.as_ref().map(|p| p.scene_id.clone()),
            "acquired": payload.as_ref().map(|p| p.acquired.clone()),
            "efficacy": payload.as_ref().and_then(|p| p.efficacy),
            "cloud_ratio": payload.as_ref().and_then(|p| p.cloud_ratio),
        }));
    }
    Ok(Json(out))
}

/// Accept a build request: expand, register, dispatch. 201 on acceptance.
pub async fn start_build(
    State(state): State<AppState>,
    Json(req): Json<BuildRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let summary = state.orchestrator.start_build(req).await.map_err(http_err)?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// Abort a running build: every non-terminal activity of the cube pair is
/// marked ERROR("cancelled").
pub async fn cancel_build(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let parsed = CubeId::parse(&req.datacube).map_err(http_err)?;
    let mut ids = vec![parsed.irregular()];
    if !parsed.is_identity() {
        ids.push(parsed.full());
    }
    let cancelled = state.ledger.cancel(&ids).map_err(internal_err)?;
    tracing::info!("cancelled {cancelled} activities for {}", req.datacube);
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

pub async fn cube_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let parsed = CubeId::parse(&query.datacube).map_err(http_err)?;

    let mut activities = state
        .ledger
        .activities_by_datacube(&parsed.irregular())
        .map_err(internal_err)?;
    if !parsed.is_identity() {
        activities.extend(
            state
                .ledger
                .activities_by_datacube(&parsed.full())
                .map_err(internal_err)?,
        );
    }

    let not_done = activities
        .iter()
        .filter(|a| matches!(a.mystatus, ActivityStatus::NotDone | ActivityStatus::Doing))
        .count();
    let errors = activities
        .iter()
        .filter(|a| a.mystatus == ActivityStatus::Error)
        .count();

    if not_done + errors > 0 || activities.is_empty() {
        return Ok(Json(StatusResponse::Running {
            finished: false,
            done: activities.len() - not_done - errors,
            not_done,
            error: errors,
        }));
    }

    let parse_ts = |s: &Option<String>| -> Option<DateTime<Utc>> {
        s.as_deref()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    let mut intervals = Vec::with_capacity(activities.len());
    for act in &activities {
        if let (Some(start), Some(end)) = (parse_ts(&act.mylaunch), parse_ts(&act.myend)) {
            intervals.push((start, end));
        }
    }
    let start_date = intervals.iter().map(|(s, _)| *s).min();
    let last_date = intervals.iter().map(|(_, e)| *e).max();

    let items = state.meta.count_items(&query.datacube).map_err(internal_err)?;

    Ok(Json(StatusResponse::Finished {
        finished: true,
        start_date: start_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
        last_date: last_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
        done: activities.len(),
        duration: union_duration(intervals),
        collection_item: items,
    }))
}
