use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::AppState;
use crate::models::request::DispatchPayload;
use crate::workers::{process_item, run_solo_batch};

/// Stream callback invoked by an external queue: a single activity or a
/// `solo` batch carrying its own payload list. Executes inline.
pub async fn dispatch(
    State(state): State<AppState>,
    Json(payload): Json<DispatchPayload>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match payload {
        DispatchPayload::Batch(activities) => {
            run_solo_batch(&state.workers, activities).await;
        }
        DispatchPayload::One(activity) => {
            if let Err(e) = state.ledger.register(&activity) {
                tracing::error!("dispatch register {} failed: {e}", activity.activity_id);
                return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
            }
            let _ = state.ledger.mark_dispatched(&activity.activity_id);
            process_item(&state.workers, &activity.activity_id).await;
        }
    }
    Ok(Json(serde_json::json!({ "message": "Successfully" })))
}
