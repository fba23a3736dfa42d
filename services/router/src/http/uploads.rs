//! Connector-facing upload endpoints.
//!
//! These are the producer side of the rendezvous: whole results for
//! patterns A and C on `/datasets/result`, and the chunked pipeline on
//! `/datasets/stream/*` for pattern B.  Every endpoint answers `{ack}`
//! on success and the frozen error envelope otherwise.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dx_protocol::{
    error_kinds, Ack, ResultUpload, StreamChunk, StreamComplete, StreamError, StreamInit,
};

use crate::broker::UploadError;
use crate::http::response::error_response;
use crate::state::AppState;

/// `POST /datasets/result` -- whole-payload result (A), object-store
/// URL (C), or a Connector-reported upload failure.
pub async fn post_result(
    State(state): State<AppState>,
    Json(body): Json<ResultUpload>,
) -> Response {
    let request_id = body.request_id;
    let result = if let Some(message) = body.error.as_deref() {
        state.broker.deliver_upload_error(&request_id, message).await
    } else if let Some(download_url) = body.download_url {
        state
            .broker
            .deliver_url(&request_id, download_url, body.size_bytes, body.expires_at)
            .await
    } else if let Some(data) = body.data {
        state.broker.deliver_data(&request_id, data).await
    } else {
        return error_response(
            error_kinds::PROTOCOL_VIOLATION,
            "result upload carries neither data, download_url nor error",
        );
    };
    ack_or_error(result)
}

/// `POST /datasets/stream/init`
pub async fn stream_init(
    State(state): State<AppState>,
    Json(body): Json<StreamInit>,
) -> Response {
    ack_or_error(state.broker.stream_init(&body.request_id).await)
}

/// `POST /datasets/stream/chunk` -- blocks (bounded) while the chunk
/// queue is full, propagating backpressure to the Connector.
pub async fn stream_chunk(
    State(state): State<AppState>,
    Json(body): Json<StreamChunk>,
) -> Response {
    ack_or_error(
        state
            .broker
            .stream_chunk(&body.request_id, body.seq, body.data)
            .await,
    )
}

/// `POST /datasets/stream/complete`
pub async fn stream_complete(
    State(state): State<AppState>,
    Json(body): Json<StreamComplete>,
) -> Response {
    ack_or_error(
        state
            .broker
            .stream_complete(&body.request_id, body.total_chunks)
            .await,
    )
}

/// `POST /datasets/stream/error`
pub async fn stream_error(
    State(state): State<AppState>,
    Json(body): Json<StreamError>,
) -> Response {
    ack_or_error(state.broker.stream_error(&body.request_id, &body.message).await)
}

fn ack_or_error(result: Result<(), UploadError>) -> Response {
    match result {
        Ok(()) => Json(Ack::ok()).into_response(),
        Err(UploadError::UnknownRequest) => error_response(
            error_kinds::UNKNOWN_REQUEST,
            "no pending request with that id",
        ),
        Err(UploadError::PatternMismatch) => error_response(
            error_kinds::PROTOCOL_VIOLATION,
            "upload does not match the request's transfer pattern",
        ),
        Err(UploadError::PayloadTooLarge) => error_response(
            error_kinds::PAYLOAD_TOO_LARGE,
            "payload exceeds the configured cap",
        ),
        Err(UploadError::ProtocolViolation) => {
            error_response(error_kinds::PROTOCOL_VIOLATION, "stream protocol violated")
        }
        Err(UploadError::Backpressure) => error_response(
            error_kinds::BACKPRESSURE,
            "stream queue is full, retry the same chunk",
        ),
        Err(UploadError::StreamGone) => error_response(
            error_kinds::STREAM_GONE,
            "application reader disconnected",
        ),
    }
}
