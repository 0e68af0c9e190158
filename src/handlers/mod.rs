pub mod cubes;
pub mod dispatch;
pub mod grids;
pub mod health;
pub mod schemas;

use axum::http::StatusCode;

use crate::error::CubeError;

/// Map a pipeline error onto the handler error tuple.
pub fn http_err(e: CubeError) -> (StatusCode, String) {
    (e.status_code(), e.to_string())
}

pub fn internal_err(e: anyhow::Error) -> (StatusCode, String) {
    tracing::error!("internal error: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
