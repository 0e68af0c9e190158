use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::AppState;
use crate::error::CubeError;
use crate::handlers::{http_err, internal_err};
use crate::models::cube::TemporalCompositionSchema;
use crate::models::request::{CreateBucketRequest, CreateTemporalSchemaRequest, TimelineQuery};
use crate::timeline::{TemporalSchema, decode_periods, parse_date};

/// Create a `<schema><step><unit>` temporal composition schema.
pub async fn create_temporal_schema(
    State(state): State<AppState>,
    Json(req): Json<CreateTemporalSchemaRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut id = req.temporal_schema.clone();
    id.push_str(if req.temporal_composite_t.is_empty() {
        "null"
    } else {
        &req.temporal_composite_t
    });
    id.push_str(&req.temporal_composite_unit);

    let schema = TemporalCompositionSchema {
        id: id.clone(),
        temporal_schema: req.temporal_schema,
        temporal_composite_t: req.temporal_composite_t,
        temporal_composite_unit: req.temporal_composite_unit,
    };
    if !state.meta.create_temporal_schema(&schema).map_err(internal_err)? {
        return Err(http_err(CubeError::Conflict(format!(
            "temporal composition schema '{id}' already exists"
        ))));
    }
    Ok((StatusCode::CREATED, Json(schema)))
}

pub async fn list_temporal_schemas(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let schemas = state.meta.list_temporal_schemas().map_err(internal_err)?;
    Ok(Json(schemas))
}

pub async fn list_composite_functions(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let functions = state.meta.list_composite_functions().map_err(internal_err)?;
    Ok(Json(functions))
}

/// Enumerate the period start dates a temporal schema yields.
pub async fn list_timeline(
    Query(query): Query<TimelineQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let schema = match query.schema.as_str() {
        "M" => TemporalSchema::Monthly,
        _ => TemporalSchema::Cyclic {
            step_days: query.step.max(1),
        },
    };
    let start = parse_date(query.start.as_deref().unwrap_or("2016-01-01")).map_err(http_err)?;
    let end = parse_date(query.end.as_deref().unwrap_or("2019-12-31")).map_err(http_err)?;

    let periods = decode_periods(schema, start, end).map_err(http_err)?;
    let mut dates: Vec<String> = periods
        .iter()
        .map(|p| p.start.format("%Y-%m-%d").to_string())
        .collect();
    dates.sort();
    dates.dedup();
    Ok(Json(dates))
}

pub async fn create_bucket(
    State(state): State<AppState>,
    Json(req): Json<CreateBucketRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !state.meta.create_bucket(&req.name).map_err(internal_err)? {
        return Err(http_err(CubeError::Conflict(format!(
            "bucket '{}' already exists",
            req.name
        ))));
    }
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "name": req.name }))))
}

pub async fn list_buckets(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let buckets = state.meta.list_buckets().map_err(internal_err)?;
    Ok(Json(buckets))
}
