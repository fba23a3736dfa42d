use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::state::AppState;

/// `GET /connectors` -- snapshot of live push-channel sessions.
pub async fn list_connectors(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sessions.list().await)
}
