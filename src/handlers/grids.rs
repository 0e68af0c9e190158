use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::AppState;
use crate::error::CubeError;
use crate::grid::{self, BoundingBox, Projection};
use crate::handlers::{http_err, internal_err};
use crate::models::request::{CreateGrsRequest, CreateRasterSizeRequest, EstimateRequest};

/// Generate a grid-reference system and its tiles.
pub async fn create_grs(
    State(state): State<AppState>,
    Json(req): Json<CreateGrsRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if state.meta.grs_exists(&req.name).map_err(internal_err)? {
        return Err(http_err(CubeError::Conflict(format!("grid '{}' already exists", req.name))));
    }

    let projection = Projection::parse(&req.projection, req.meridian).map_err(http_err)?;
    let bbox = BoundingBox::parse(&req.bbox).map_err(http_err)?;
    let (grs, tiles) = grid::create_grs(
        &req.name,
        &req.description,
        projection,
        req.meridian,
        req.degreesx,
        req.degreesy,
        bbox,
    )
    .map_err(http_err)?;

    let count = tiles.len();
    state.meta.create_grs(&grs, &tiles).map_err(internal_err)?;
    tracing::info!("grid '{}' created with {count} tiles", req.name);
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": grs.id, "tiles": count })),
    ))
}

pub async fn list_grs(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let schemas = state.meta.list_grs().map_err(internal_err)?;
    Ok(Json(schemas))
}

pub async fn get_grs(
    State(state): State<AppState>,
    Path(grs_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let grs = state
        .meta
        .get_grs(&grs_id)
        .map_err(internal_err)?
        .ok_or_else(|| http_err(CubeError::NotFound(format!("grid '{grs_id}'"))))?;
    let tiles = state.meta.list_tiles(&grs_id).map_err(internal_err)?;

    let mut value = serde_json::to_value(&grs).unwrap_or(serde_json::Value::Null);
    value["tiles"] = serde_json::Value::Array(
        tiles
            .into_iter()
            .map(|t| serde_json::json!({ "id": t.id, "geom_wgs84": t.geom_wgs84 }))
            .collect(),
    );
    Ok(Json(value))
}

/// Derive raster/chunk dimensions for a grid at a resolution and upsert
/// the `<grs>-<resolution>` schema.
pub async fn create_raster_size(
    State(state): State<AppState>,
    Json(req): Json<CreateRasterSizeRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let tiles = state.meta.list_tiles(&req.grs_schema).map_err(internal_err)?;
    let tile = tiles
        .first()
        .ok_or_else(|| http_err(CubeError::NotFound(format!("grid '{}'", req.grs_schema))))?;

    let schema = grid::derive_raster_size(
        &req.grs_schema,
        tile,
        req.resolution,
        req.chunk_size_x,
        req.chunk_size_y,
    )
    .map_err(http_err)?;
    state.meta.upsert_raster_size(&schema).map_err(internal_err)?;
    Ok((StatusCode::CREATED, Json(schema)))
}

pub async fn list_raster_size(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let schemas = state.meta.list_raster_size().map_err(internal_err)?;
    Ok(Json(schemas))
}

/// Storage and processing cost estimate for a prospective build.
pub async fn estimate_cost(
    State(state): State<AppState>,
    Query(req): Query<EstimateRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let tiles = state.meta.list_tiles(&req.grid).map_err(internal_err)?;
    let tile = tiles
        .first()
        .ok_or_else(|| http_err(CubeError::NotFound(format!("grid '{}'", req.grid))))?;

    let estimate = grid::estimate_cost(
        &req.satellite,
        req.resolution,
        tile,
        &req.start_date,
        &req.last_date,
        req.quantity_bands,
        req.quantity_tiles,
        &req.t_schema,
        req.t_step,
    )
    .map_err(http_err)?;
    Ok(Json(estimate))
}
