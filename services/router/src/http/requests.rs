//! Application-facing dataset request handlers.
//!
//! Each handler registers a pending record, dispatches the command
//! frame over the target node's push channel, then blocks on the
//! rendezvous waitable until the Connector's upload arrives or the
//! deadline fires.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use dx_protocol::{
    error_kinds, normalize_mac, DatasetRequest, OffloadResponse, RequestState, SyncResponse,
};
use std::io;
use std::time::Duration;
use tracing::debug;

use crate::broker::{Outcome, Pattern, StreamEvent, Waitable};
use crate::http::response::error_response;
use crate::state::AppState;

/// `POST /datasets/request-sync` -- pattern A.  The whole payload is
/// buffered in the router and returned as one JSON body.
pub async fn request_sync(
    State(state): State<AppState>,
    Json(body): Json<DatasetRequest>,
) -> Response {
    let Some((mac, dataset)) = validate(&body) else {
        return error_response(
            error_kinds::PROTOCOL_VIOLATION,
            "mac and dataset are required",
        );
    };
    let timeout = request_timeout(&state, &body);
    let (request_id, mut waitable) = state
        .broker
        .begin(&mac, &dataset, Pattern::Buffer, timeout, body.processing_delay_ms)
        .await;
    state.broker.dispatch(&request_id).await;

    match await_reply(&state, &request_id, &mut waitable).await {
        Outcome::Data(data) => {
            let timings = state.broker.finish(&request_id).await;
            let size_bytes = data.len() as u64;
            (
                StatusCode::OK,
                Json(SyncResponse {
                    status: "success".to_owned(),
                    request_id,
                    data,
                    size_bytes,
                    timings,
                }),
            )
                .into_response()
        }
        Outcome::Failed { kind, message } => {
            state.broker.finish(&request_id).await;
            error_response(kind, message)
        }
        Outcome::Url { .. } => {
            state.broker.finish(&request_id).await;
            error_response(
                error_kinds::INTERNAL_ERROR,
                "offload result for a buffered request",
            )
        }
    }
}

/// `POST /datasets/request-offload` -- pattern C.  The router relays
/// the object-store URL and never touches the payload bytes.
pub async fn request_offload(
    State(state): State<AppState>,
    Json(body): Json<DatasetRequest>,
) -> Response {
    let Some((mac, dataset)) = validate(&body) else {
        return error_response(
            error_kinds::PROTOCOL_VIOLATION,
            "mac and dataset are required",
        );
    };
    let timeout = request_timeout(&state, &body);
    let (request_id, mut waitable) = state
        .broker
        .begin(&mac, &dataset, Pattern::Offload, timeout, body.processing_delay_ms)
        .await;
    state.broker.dispatch(&request_id).await;

    match await_reply(&state, &request_id, &mut waitable).await {
        Outcome::Url {
            download_url,
            size_bytes,
            expires_at,
        } => {
            let timings = state.broker.finish(&request_id).await;
            (
                StatusCode::OK,
                Json(OffloadResponse {
                    status: "success".to_owned(),
                    request_id,
                    download_url,
                    size_bytes,
                    expires_at,
                    timings,
                }),
            )
                .into_response()
        }
        Outcome::Failed { kind, message } => {
            state.broker.finish(&request_id).await;
            error_response(kind, message)
        }
        Outcome::Data(_) => {
            state.broker.finish(&request_id).await;
            error_response(
                error_kinds::INTERNAL_ERROR,
                "buffered result for an offload request",
            )
        }
    }
}

/// `POST /datasets/request-stream` -- pattern B.  The response is a
/// chunked octet stream fed from the request's chunk pipe; the
/// `X-Request-Id` header lets the Application poll the status endpoint.
pub async fn request_stream(
    State(state): State<AppState>,
    Json(body): Json<DatasetRequest>,
) -> Response {
    let Some((mac, dataset)) = validate(&body) else {
        return error_response(
            error_kinds::PROTOCOL_VIOLATION,
            "mac and dataset are required",
        );
    };
    let timeout = request_timeout(&state, &body);
    let (request_id, mut waitable) = state
        .broker
        .begin(&mac, &dataset, Pattern::Stream, timeout, body.processing_delay_ms)
        .await;
    state.broker.dispatch(&request_id).await;

    // A dispatch failure settles the record synchronously; surface it
    // as a proper status code while the headers are still ours.
    if let Ok(Outcome::Failed { kind, message }) = waitable.reply.try_recv() {
        state.broker.finish(&request_id).await;
        return error_response(kind, message);
    }
    let Some(chunks) = waitable.chunks.take() else {
        return error_response(error_kinds::INTERNAL_ERROR, "stream pipe missing");
    };

    let consumer = StreamConsumer {
        state: state.clone(),
        request_id: request_id.clone(),
        chunks,
        reply: waitable.reply,
        deadline: waitable.deadline,
        done: false,
    };
    let body_stream = futures_util::stream::unfold(consumer, |mut consumer| async move {
        consumer.next().await.map(|item| (item, consumer))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("x-request-id", request_id)
        .body(Body::from_stream(body_stream))
        .unwrap()
}

fn validate(body: &DatasetRequest) -> Option<(String, String)> {
    let mac = normalize_mac(&body.mac);
    if mac.is_empty() || body.dataset.trim().is_empty() {
        return None;
    }
    Some((mac, body.dataset.clone()))
}

fn request_timeout(state: &AppState, body: &DatasetRequest) -> Duration {
    body.timeout_s
        .map_or(state.config.request_timeout, Duration::from_secs)
}

/// Blocks on the rendezvous waitable up to the deadline.  On expiry the
/// record is cancelled; if a result won the race instead (first writer
/// wins), that result is honored.
async fn await_reply(state: &AppState, request_id: &str, waitable: &mut Waitable) -> Outcome {
    match tokio::time::timeout_at(waitable.deadline, &mut waitable.reply).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Outcome::Failed {
            kind: error_kinds::INTERNAL_ERROR,
            message: "pending record dropped before completion".to_owned(),
        },
        Err(_) => {
            let cancelled = state
                .broker
                .cancel(
                    request_id,
                    RequestState::TimedOut,
                    error_kinds::TIMEOUT,
                    "no result before the request deadline",
                )
                .await;
            if !cancelled {
                if let Ok(outcome) = waitable.reply.try_recv() {
                    return outcome;
                }
            }
            Outcome::Failed {
                kind: error_kinds::TIMEOUT,
                message: "no result before the request deadline".to_owned(),
            }
        }
    }
}

/// Pulls stream events out of the chunk pipe and turns them into body
/// frames.  Owned by the response body: when the Application reader
/// disconnects the consumer is dropped, the pipe closes, and chunk
/// uploads start failing with `stream_gone`.
struct StreamConsumer {
    state: AppState,
    request_id: String,
    chunks: tokio::sync::mpsc::Receiver<StreamEvent>,
    reply: tokio::sync::oneshot::Receiver<Outcome>,
    deadline: tokio::time::Instant,
    done: bool,
}

enum Step {
    Event(Option<StreamEvent>),
    Settled(Result<Outcome, tokio::sync::oneshot::error::RecvError>),
}

impl StreamConsumer {
    async fn next(&mut self) -> Option<Result<Bytes, io::Error>> {
        if self.done {
            return None;
        }
        let step = async {
            // Failure settlement outranks queued chunks: on abort the
            // remaining queue content is discarded, not flushed.
            tokio::select! {
                biased;
                settled = &mut self.reply => Step::Settled(settled),
                event = self.chunks.recv() => Step::Event(event),
            }
        };
        match tokio::time::timeout_at(self.deadline, step).await {
            Ok(Step::Event(Some(StreamEvent::Chunk { seq, data }))) => {
                debug!(request_id = %self.request_id, seq, bytes = data.len(), "chunk relayed");
                Some(Ok(Bytes::from(data)))
            }
            Ok(Step::Event(Some(StreamEvent::End { total_chunks }))) => {
                debug!(request_id = %self.request_id, total_chunks, "stream complete");
                self.done = true;
                self.state.broker.finish(&self.request_id).await;
                None
            }
            Ok(Step::Event(None)) => {
                self.done = true;
                Some(Err(io::Error::other("stream pipe closed unexpectedly")))
            }
            Ok(Step::Settled(Ok(Outcome::Failed { kind, message }))) => {
                self.done = true;
                self.state.broker.finish(&self.request_id).await;
                Some(Err(io::Error::other(format!("{kind}: {message}"))))
            }
            Ok(Step::Settled(_)) => {
                self.done = true;
                Some(Err(io::Error::other("pending record dropped mid-stream")))
            }
            Err(_) => {
                self.done = true;
                self.state
                    .broker
                    .cancel(
                        &self.request_id,
                        RequestState::TimedOut,
                        error_kinds::TIMEOUT,
                        "stream stalled past the request deadline",
                    )
                    .await;
                Some(Err(io::Error::other("stream deadline expired")))
            }
        }
    }
}
