use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dx_protocol::{error_kinds, ErrorEnvelope};

/// HTTP status carried by each frozen error kind.
pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        error_kinds::NO_SUCH_CONNECTOR | error_kinds::BACKPRESSURE => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        error_kinds::CONNECTOR_DISCONNECTED | error_kinds::OFFLOAD_FAILED => {
            StatusCode::BAD_GATEWAY
        }
        error_kinds::TIMEOUT => StatusCode::GATEWAY_TIMEOUT,
        error_kinds::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
        error_kinds::PROTOCOL_VIOLATION => StatusCode::BAD_REQUEST,
        error_kinds::UNKNOWN_REQUEST => StatusCode::NOT_FOUND,
        error_kinds::STREAM_GONE => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Builds the JSON error envelope for an error kind.  Backpressure
/// responses carry `Retry-After` so well-behaved Connectors pause
/// instead of hammering the chunk endpoint.
pub fn error_response(kind: &str, message: impl Into<String>) -> Response {
    let mut response = (
        status_for_kind(kind),
        Json(ErrorEnvelope {
            status: "error".to_owned(),
            error: kind.to_owned(),
            message: message.into(),
        }),
    )
        .into_response();
    if kind == error_kinds::BACKPRESSURE {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn read_envelope(response: Response) -> (StatusCode, ErrorEnvelope) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let envelope: ErrorEnvelope =
            serde_json::from_slice(&body).expect("response body should be valid error json");
        (status, envelope)
    }

    #[tokio::test]
    async fn no_such_connector_maps_to_503() {
        let (status, envelope) =
            read_envelope(error_response(error_kinds::NO_SUCH_CONNECTOR, "no session")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(envelope.status, "error");
        assert_eq!(envelope.error, "no_such_connector");
        assert_eq!(envelope.message, "no session");
    }

    #[tokio::test]
    async fn timeout_maps_to_504() {
        let (status, envelope) =
            read_envelope(error_response(error_kinds::TIMEOUT, "deadline expired")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(envelope.error, "timeout");
    }

    #[tokio::test]
    async fn backpressure_carries_retry_after() {
        let response = error_response(error_kinds::BACKPRESSURE, "queue full");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            HeaderValue::from_static("1")
        );
    }

    #[tokio::test]
    async fn remaining_kinds_map_to_their_statuses() {
        for (kind, status) in [
            (error_kinds::CONNECTOR_DISCONNECTED, StatusCode::BAD_GATEWAY),
            (error_kinds::OFFLOAD_FAILED, StatusCode::BAD_GATEWAY),
            (error_kinds::PAYLOAD_TOO_LARGE, StatusCode::PAYLOAD_TOO_LARGE),
            (error_kinds::PROTOCOL_VIOLATION, StatusCode::BAD_REQUEST),
            (error_kinds::UNKNOWN_REQUEST, StatusCode::NOT_FOUND),
            (error_kinds::STREAM_GONE, StatusCode::GONE),
            (error_kinds::INTERNAL_ERROR, StatusCode::INTERNAL_SERVER_ERROR),
        ] {
            assert_eq!(status_for_kind(kind), status, "kind {kind}");
        }
    }
}
