use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Error taxonomy for the build pipeline and its admin surface.
///
/// Workers never panic on bad input: `Transient` is retried with backoff,
/// everything else becomes a terminal activity status with a typed reason.
#[derive(Debug, thiserror::Error)]
pub enum CubeError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Retryable: timeouts, 5xx, throttling, transient object-store failures.
    #[error("transient: {0}")]
    Transient(String),

    /// Bad source raster, bad projection, malformed scene asset. Not retried.
    #[error("data error: {0}")]
    DataError(String),

    /// Invariant violation or code bug. Surfaces as 500 with a full trace.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CubeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CubeError::Transient(_))
    }

    /// Exit code for the admin CLI helpers.
    pub fn exit_code(&self) -> i32 {
        match self {
            CubeError::Validation(_) => 2,
            CubeError::NotFound(_) => 3,
            CubeError::Conflict(_) => 4,
            _ => 1,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CubeError::Validation(_) => StatusCode::BAD_REQUEST,
            CubeError::NotFound(_) => StatusCode::NOT_FOUND,
            CubeError::Conflict(_) => StatusCode::CONFLICT,
            CubeError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            CubeError::DataError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CubeError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CubeError {
    fn into_response(self) -> Response {
        if let CubeError::Fatal(ref msg) = self {
            tracing::error!("fatal: {msg}");
        }
        (self.status_code(), self.to_string()).into_response()
    }
}

impl From<anyhow::Error> for CubeError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<CubeError>() {
            Ok(ce) => ce,
            Err(e) => CubeError::Fatal(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CubeError {
    fn from(e: rusqlite::Error) -> Self {
        CubeError::Fatal(format!("metadata store: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CubeError>;
