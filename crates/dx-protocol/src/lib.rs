// dx-protocol: Dataset exchange wire types and serialization.
//
// Covers both surfaces of the Router: the push channel (Router ->
// Connector command frames, bidirectional control frames) and the
// frozen v1 HTTP request/response schemas.  Push frames are JSON, one
// frame per WebSocket text message or per SSE `data:` line.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Push channel: Router -> Connector command frames
// ---------------------------------------------------------------------------

/// Command verb carried in a push frame.
///
/// The verb selects the transfer pattern the Connector must use for the
/// upload: whole-body result, chunked stream, or object-store offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    GetDataset,
    GetDatasetStream,
    GetDatasetOffload,
}

/// A single command pushed to a Connector.
///
/// Frames on one session are delivered in the order the Router enqueued
/// them.  `request_id` correlates the Connector's later upload with the
/// Application request waiting inside the Router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command: CommandKind,
    pub request_id: String,
    pub dataset_name: String,
    /// Advisory pause before the Connector starts reading, for load
    /// shaping during tests.  Forwarded verbatim from the Application
    /// request; absent means start immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_delay_ms: Option<u64>,
}

/// Keep-alive control frames, discriminated by `type`.
///
/// The Router sends `ping` at the keep-alive interval; WebSocket
/// Connectors answer with `pong`.  The SSE transport is one-way, so
/// pongs only ever travel Connector -> Router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ControlFrame {
    Ping,
    Pong,
}

/// Everything a Connector can read off the push channel.
///
/// Untagged: command frames are self-describing via `command`, control
/// frames via `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushFrame {
    Command(CommandFrame),
    Control(ControlFrame),
}

// ---------------------------------------------------------------------------
// Application -> Router request bodies
// ---------------------------------------------------------------------------

/// Request body shared by `POST /datasets/request-sync`,
/// `/datasets/request-stream` and `/datasets/request-offload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRequest {
    /// Node identifier of the target Connector.  Conventionally a
    /// lowercase hyphen-separated MAC address; treated as opaque.
    pub mac: String,
    /// Dataset name as known to the Connector (e.g. a file name).
    pub dataset: String,
    /// Per-request deadline override; absent means the configured
    /// default request timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_delay_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Connector -> Router upload bodies
// ---------------------------------------------------------------------------

/// Body of `POST /datasets/result`.
///
/// Exactly one of `data` (pattern A), `download_url` (pattern C) or
/// `error` (pattern C upload failure) is expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResultUpload {
    pub request_id: String,
    /// Whole dataset payload, base64 in JSON.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes::option"
    )]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Pattern C: advisory expiry of the signed URL, passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /datasets/stream/init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInit {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Body of `POST /datasets/stream/chunk`.
///
/// `seq` starts at 0 and must be dense; a gap aborts the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: String,
    pub seq: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Body of `POST /datasets/stream/complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamComplete {
    pub request_id: String,
    pub total_chunks: u64,
}

/// Body of `POST /datasets/stream/error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub request_id: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Router -> Application / Connector response bodies (frozen schemas)
// ---------------------------------------------------------------------------

/// Rendezvous timing marks, nanoseconds on the Router's monotonic
/// clock (epoch = Router start).  Marks not yet reached are absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Timings {
    pub t1_router_recv: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_dispatch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_result_recv: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_respond: Option<u64>,
}

/// Successful `POST /datasets/request-sync` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Always `"success"`.
    pub status: String,
    pub request_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub size_bytes: u64,
    pub timings: Timings,
}

/// Successful `POST /datasets/request-offload` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadResponse {
    /// Always `"success"`.
    pub status: String,
    pub request_id: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    pub timings: Timings,
}

/// Lifecycle state of a pending request, as reported by the status
/// endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Fulfilled,
    Failed,
    TimedOut,
    Cancelled,
}

/// `GET /datasets/status/{request_id}` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: RequestState,
    pub timings: Timings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One entry in the `GET /connectors` response array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub mac: String,
    /// RFC 3339 wall-clock timestamp of the push-channel accept.
    pub connected_at: String,
}

/// Acknowledgement body for Connector-facing upload endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ack: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ack: true }
    }
}

/// Error envelope for every non-2xx JSON response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always `"error"`.
    pub status: String,
    /// One of the frozen kinds in [`error_kinds`].
    pub error: String,
    pub message: String,
}

/// Frozen v1 error kinds.
///
/// | Kind                    | HTTP status |
/// |-------------------------|-------------|
/// | no_such_connector       | 503         |
/// | connector_disconnected  | 502         |
/// | timeout                 | 504         |
/// | payload_too_large       | 413         |
/// | protocol_violation      | 400         |
/// | offload_failed          | 502         |
/// | unknown_request         | 404         |
/// | backpressure            | 503         |
/// | stream_gone             | 410         |
/// | internal_error          | 500         |
pub mod error_kinds {
    pub const NO_SUCH_CONNECTOR: &str = "no_such_connector";
    pub const CONNECTOR_DISCONNECTED: &str = "connector_disconnected";
    pub const TIMEOUT: &str = "timeout";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const PROTOCOL_VIOLATION: &str = "protocol_violation";
    pub const OFFLOAD_FAILED: &str = "offload_failed";
    pub const UNKNOWN_REQUEST: &str = "unknown_request";
    pub const BACKPRESSURE: &str = "backpressure";
    pub const STREAM_GONE: &str = "stream_gone";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// Base64 (standard alphabet, padded) encoding for binary payload
/// fields carried inside JSON bodies.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }

    /// `Option<Vec<u8>>` variant for optional payload fields.
    pub mod option {
        use base64::Engine as _;
        use base64::engine::general_purpose::STANDARD;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(encoded) => STANDARD
                    .decode(encoded.as_bytes())
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Normalizes a node identifier: trimmed, lowercased.
///
/// MAC-style identifiers arrive in mixed case from some Connector
/// stacks; the registry keys on the normalized form.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}
