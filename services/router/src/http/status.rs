use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dx_protocol::error_kinds;

use crate::http::response::error_response;
use crate::state::AppState;

/// `GET /datasets/status/{request_id}` -- observation only; repeated
/// calls return consistent state up to the terminal transition.
pub async fn request_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Response {
    match state.broker.get(&request_id).await {
        Some(status) => Json(status).into_response(),
        None => error_response(
            error_kinds::UNKNOWN_REQUEST,
            "no pending request with that id",
        ),
    }
}
