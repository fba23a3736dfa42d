//! Pending-request table and rendezvous core.
//!
//! Every Application request becomes a [`PendingEntry`] keyed by a
//! router-generated request identifier.  The Application-facing handler
//! blocks on the entry's waitable; the Connector-facing upload
//! endpoints settle the entry and release the waitable exactly once.
//! The table index is guarded by a coarse `RwLock` used only for
//! insert/remove/lookup; each entry carries its own mutex so transitions
//! on unrelated requests never contend.
//!
//! Timing marks are nanoseconds on a monotonic clock whose epoch is
//! broker creation.

use dx_protocol::{error_kinds, CommandFrame, CommandKind, RequestState, StatusResponse, Timings};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::metrics::Metrics;
use crate::session::{SendError, SessionRegistry};

/// How long a terminal entry stays queryable via the status endpoint
/// before the per-request reaper drops it.
const STATUS_RETENTION: Duration = Duration::from_secs(60);

/// Bounded wait for stream-queue capacity before a chunk upload is
/// answered with backpressure instead of blocking further.
const BACKPRESSURE_WAIT: Duration = Duration::from_secs(5);

/// Transfer pattern of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// A: whole payload buffered in the router.
    Buffer,
    /// B: chunked relay through a bounded queue.
    Stream,
    /// C: object-store URL pass-through.
    Offload,
}

impl Pattern {
    fn command(self) -> CommandKind {
        match self {
            Pattern::Buffer => CommandKind::GetDataset,
            Pattern::Stream => CommandKind::GetDatasetStream,
            Pattern::Offload => CommandKind::GetDatasetOffload,
        }
    }
}

/// What the waitable resolves to for patterns A and C, and how stream
/// consumers learn about failure for pattern B.
#[derive(Debug)]
pub enum Outcome {
    Data(Vec<u8>),
    Url {
        download_url: String,
        size_bytes: Option<u64>,
        expires_at: Option<String>,
    },
    Failed {
        kind: &'static str,
        message: String,
    },
}

/// One record flowing through a pattern-B chunk pipe.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk { seq: u64, data: Vec<u8> },
    End { total_chunks: u64 },
}

/// Handle the Application-facing handler blocks on.
pub struct Waitable {
    pub reply: oneshot::Receiver<Outcome>,
    /// Consumer half of the chunk pipe; `Some` for pattern B only.
    pub chunks: Option<mpsc::Receiver<StreamEvent>>,
    pub deadline: Instant,
}

/// Typed rejection for Connector-facing uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    /// Request id absent from the table, or already terminal.
    UnknownRequest,
    /// Upload shape does not match the request's pattern.
    PatternMismatch,
    /// Payload over the configured cap; the request is failed.
    PayloadTooLarge,
    /// Chunk before `stream/init`, after `stream/complete`, or with a
    /// sequence gap; gaps fail the request.
    ProtocolViolation,
    /// Chunk queue stayed full past the bounded wait; retryable.
    Backpressure,
    /// The Application reader went away; the stream is finished.
    StreamGone,
}

/// Producer-side bookkeeping for a pattern-B pipe.  One lock serializes
/// concurrent chunk uploads for the request, keeping the sequence dense
/// and the queue ordering identical to the upload order.
struct ProducerState {
    next_seq: u64,
    completed: bool,
    reader_gone: bool,
}

struct PendingEntry {
    mac: String,
    dataset: String,
    pattern: Pattern,
    processing_delay_ms: Option<u64>,
    state: RequestState,
    error: Option<String>,
    timings: Timings,
    session_generation: Option<u64>,
    reply: Option<oneshot::Sender<Outcome>>,
    chunk_tx: Option<mpsc::Sender<StreamEvent>>,
    producer: Option<Arc<Mutex<ProducerState>>>,
    streaming_active: bool,
    /// Set once the Application reader is known gone, so later chunk
    /// uploads keep getting `stream_gone` instead of `unknown_request`.
    stream_reader_gone: bool,
}

type Entry = Arc<Mutex<PendingEntry>>;

pub struct RequestBroker {
    pending: RwLock<HashMap<String, Entry>>,
    sessions: Arc<SessionRegistry>,
    config: Arc<RouterConfig>,
    metrics: Arc<Metrics>,
    epoch: Instant,
}

impl RequestBroker {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        config: Arc<RouterConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            sessions,
            config,
            metrics,
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since broker creation.
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Inserts a pending record and returns its identifier plus the
    /// waitable the Application-facing handler blocks on.  Also arms a
    /// reaper that times the record out at its deadline and drops it
    /// after the status-retention window.
    pub async fn begin(
        self: &Arc<Self>,
        mac: &str,
        dataset: &str,
        pattern: Pattern,
        timeout: Duration,
        processing_delay_ms: Option<u64>,
    ) -> (String, Waitable) {
        let request_id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        let (reply_tx, reply_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx, producer) = if pattern == Pattern::Stream {
            let (tx, rx) = mpsc::channel(self.config.stream_queue_depth);
            let producer = ProducerState {
                next_seq: 0,
                completed: false,
                reader_gone: false,
            };
            (Some(tx), Some(rx), Some(Arc::new(Mutex::new(producer))))
        } else {
            (None, None, None)
        };

        let entry = PendingEntry {
            mac: mac.to_owned(),
            dataset: dataset.to_owned(),
            pattern,
            processing_delay_ms,
            state: RequestState::Pending,
            error: None,
            timings: Timings {
                t1_router_recv: self.now_ns(),
                ..Timings::default()
            },
            session_generation: None,
            reply: Some(reply_tx),
            chunk_tx,
            producer,
            streaming_active: false,
            stream_reader_gone: false,
        };
        self.pending
            .write()
            .await
            .insert(request_id.clone(), Arc::new(Mutex::new(entry)));

        match pattern {
            Pattern::Buffer => Metrics::incr(&self.metrics.sync_requests),
            Pattern::Stream => {
                Metrics::incr(&self.metrics.stream_requests);
                Metrics::gauge_add(&self.metrics.active_streams, 1);
            }
            Pattern::Offload => Metrics::incr(&self.metrics.offload_requests),
        }
        info!(
            request_id = %request_id,
            mac = %mac,
            dataset = %dataset,
            pattern = ?pattern,
            "request registered"
        );

        let broker = Arc::clone(self);
        let reaper_id = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            broker
                .cancel(
                    &reaper_id,
                    RequestState::TimedOut,
                    error_kinds::TIMEOUT,
                    "deadline expired",
                )
                .await;
            tokio::time::sleep(STATUS_RETENTION).await;
            broker.remove(&reaper_id).await;
        });

        (
            request_id,
            Waitable {
                reply: reply_rx,
                chunks: chunk_rx,
                deadline,
            },
        )
    }

    /// Sends the command frame for a pending record over its node's
    /// push channel.  An absent session fails the record immediately
    /// with `no_such_connector`; a dead channel with
    /// `connector_disconnected`.
    pub async fn dispatch(&self, request_id: &str) {
        let Some(entry) = self.lookup(request_id).await else {
            return;
        };
        let (mac, frame) = {
            let locked = entry.lock().await;
            if locked.state != RequestState::Pending {
                return;
            }
            (
                locked.mac.clone(),
                CommandFrame {
                    command: locked.pattern.command(),
                    request_id: request_id.to_owned(),
                    dataset_name: locked.dataset.clone(),
                    processing_delay_ms: locked.processing_delay_ms,
                },
            )
        };

        match self.sessions.send(&mac, frame).await {
            Ok(generation) => {
                let mut locked = entry.lock().await;
                locked.session_generation = Some(generation);
                locked.timings.t_dispatch = Some(self.now_ns());
                debug!(request_id = %request_id, mac = %mac, generation, "command dispatched");
            }
            Err(SendError::NoSuchConnector) => {
                self.settle(
                    request_id,
                    &entry,
                    RequestState::Failed,
                    Some(Outcome::Failed {
                        kind: error_kinds::NO_SUCH_CONNECTOR,
                        message: format!("no live session for node {mac}"),
                    }),
                )
                .await;
            }
            Err(SendError::SendFailed) => {
                self.settle(
                    request_id,
                    &entry,
                    RequestState::Failed,
                    Some(Outcome::Failed {
                        kind: error_kinds::CONNECTOR_DISCONNECTED,
                        message: format!("push channel for node {mac} is gone"),
                    }),
                )
                .await;
            }
        }
    }

    /// Pattern A: fulfills a pending record with the whole payload.
    pub async fn deliver_data(&self, request_id: &str, data: Vec<u8>) -> Result<(), UploadError> {
        let entry = self
            .lookup(request_id)
            .await
            .ok_or(UploadError::UnknownRequest)?;
        {
            let locked = entry.lock().await;
            if locked.state != RequestState::Pending {
                return Err(UploadError::UnknownRequest);
            }
            if locked.pattern != Pattern::Buffer {
                return Err(UploadError::PatternMismatch);
            }
        }
        if data.len() > self.config.max_buffered_bytes {
            self.settle(
                request_id,
                &entry,
                RequestState::Failed,
                Some(Outcome::Failed {
                    kind: error_kinds::PAYLOAD_TOO_LARGE,
                    message: format!(
                        "payload of {} bytes exceeds the {} byte buffer cap",
                        data.len(),
                        self.config.max_buffered_bytes
                    ),
                }),
            )
            .await;
            return Err(UploadError::PayloadTooLarge);
        }
        let size = data.len() as u64;
        if self
            .settle(
                request_id,
                &entry,
                RequestState::Fulfilled,
                Some(Outcome::Data(data)),
            )
            .await
        {
            Metrics::add(&self.metrics.buffered_bytes_total, size);
            Ok(())
        } else {
            Err(UploadError::UnknownRequest)
        }
    }

    /// Pattern C: fulfills a pending record with the object-store URL.
    pub async fn deliver_url(
        &self,
        request_id: &str,
        download_url: String,
        size_bytes: Option<u64>,
        expires_at: Option<String>,
    ) -> Result<(), UploadError> {
        let entry = self
            .lookup(request_id)
            .await
            .ok_or(UploadError::UnknownRequest)?;
        {
            let locked = entry.lock().await;
            if locked.state != RequestState::Pending {
                return Err(UploadError::UnknownRequest);
            }
            if locked.pattern != Pattern::Offload {
                return Err(UploadError::PatternMismatch);
            }
        }
        if self
            .settle(
                request_id,
                &entry,
                RequestState::Fulfilled,
                Some(Outcome::Url {
                    download_url,
                    size_bytes,
                    expires_at,
                }),
            )
            .await
        {
            Ok(())
        } else {
            Err(UploadError::UnknownRequest)
        }
    }

    /// A Connector reported an upload failure in place of a result
    /// (patterns A and C; pattern B uses `stream/error`).
    pub async fn deliver_upload_error(
        &self,
        request_id: &str,
        message: &str,
    ) -> Result<(), UploadError> {
        let entry = self
            .lookup(request_id)
            .await
            .ok_or(UploadError::UnknownRequest)?;
        {
            let locked = entry.lock().await;
            if locked.state != RequestState::Pending {
                return Err(UploadError::UnknownRequest);
            }
            if locked.pattern == Pattern::Stream {
                return Err(UploadError::PatternMismatch);
            }
        }
        if self
            .settle(
                request_id,
                &entry,
                RequestState::Failed,
                Some(Outcome::Failed {
                    kind: error_kinds::OFFLOAD_FAILED,
                    message: message.to_owned(),
                }),
            )
            .await
        {
            Ok(())
        } else {
            Err(UploadError::UnknownRequest)
        }
    }

    /// Pattern B: marks the record streaming-active.
    pub async fn stream_init(&self, request_id: &str) -> Result<(), UploadError> {
        let entry = self
            .lookup(request_id)
            .await
            .ok_or(UploadError::UnknownRequest)?;
        let mut locked = entry.lock().await;
        if locked.state != RequestState::Pending {
            return Err(UploadError::UnknownRequest);
        }
        if locked.pattern != Pattern::Stream {
            return Err(UploadError::PatternMismatch);
        }
        locked.streaming_active = true;
        if locked.timings.t_result_recv.is_none() {
            locked.timings.t_result_recv = Some(self.now_ns());
        }
        debug!(request_id = %request_id, "stream initialized");
        Ok(())
    }

    /// Pattern B: enqueues one chunk, blocking (bounded) on a full
    /// queue.  Sequence numbers must be dense starting at 0; a gap
    /// fails the request before anything reaches the Application.
    pub async fn stream_chunk(
        &self,
        request_id: &str,
        seq: u64,
        data: Vec<u8>,
    ) -> Result<(), UploadError> {
        let entry = self
            .lookup(request_id)
            .await
            .ok_or(UploadError::UnknownRequest)?;
        let (producer, chunk_tx, oversized) = {
            let locked = entry.lock().await;
            if locked.pattern != Pattern::Stream {
                return Err(UploadError::PatternMismatch);
            }
            if locked.state != RequestState::Pending {
                return Err(if locked.stream_reader_gone {
                    UploadError::StreamGone
                } else {
                    UploadError::UnknownRequest
                });
            }
            if !locked.streaming_active {
                return Err(UploadError::ProtocolViolation);
            }
            let Some(producer) = locked.producer.clone() else {
                return Err(UploadError::UnknownRequest);
            };
            (
                producer,
                locked.chunk_tx.clone(),
                data.len() > self.config.max_chunk_size,
            )
        };
        if oversized {
            self.settle(
                request_id,
                &entry,
                RequestState::Failed,
                Some(Outcome::Failed {
                    kind: error_kinds::PAYLOAD_TOO_LARGE,
                    message: format!(
                        "chunk {seq} of {} bytes exceeds the {} byte chunk cap",
                        data.len(),
                        self.config.max_chunk_size
                    ),
                }),
            )
            .await;
            return Err(UploadError::PayloadTooLarge);
        }
        let Some(chunk_tx) = chunk_tx else {
            return Err(UploadError::StreamGone);
        };

        // The producer lock is held across the queue send so concurrent
        // uploads for one request stay serialized and in order.
        let mut producer = producer.lock().await;
        if producer.reader_gone {
            return Err(UploadError::StreamGone);
        }
        if producer.completed {
            return Err(UploadError::ProtocolViolation);
        }
        if seq != producer.next_seq {
            let expected = producer.next_seq;
            producer.completed = true;
            drop(producer);
            self.settle(
                request_id,
                &entry,
                RequestState::Failed,
                Some(Outcome::Failed {
                    kind: error_kinds::PROTOCOL_VIOLATION,
                    message: format!("chunk sequence gap: expected {expected}, got {seq}"),
                }),
            )
            .await;
            return Err(UploadError::ProtocolViolation);
        }

        let size = data.len() as u64;
        match tokio::time::timeout(BACKPRESSURE_WAIT, chunk_tx.send(StreamEvent::Chunk { seq, data }))
            .await
        {
            Ok(Ok(())) => {
                producer.next_seq += 1;
                Metrics::incr(&self.metrics.chunks_relayed);
                Metrics::add(&self.metrics.streamed_bytes_total, size);
                Ok(())
            }
            Ok(Err(_)) => {
                producer.reader_gone = true;
                drop(producer);
                self.mark_reader_gone(&entry).await;
                self.cancel(
                    request_id,
                    RequestState::Cancelled,
                    error_kinds::STREAM_GONE,
                    "application reader disconnected",
                )
                .await;
                Err(UploadError::StreamGone)
            }
            // Queue still full after the bounded wait; the chunk was
            // not enqueued and the sequence cursor did not advance, so
            // a retry of the same seq is accepted.
            Err(_) => Err(UploadError::Backpressure),
        }
    }

    async fn mark_reader_gone(&self, entry: &Entry) {
        entry.lock().await.stream_reader_gone = true;
    }

    /// Pattern B: enqueues the terminal sentinel and fulfills the
    /// record.  `total_chunks` is cross-checked against the number of
    /// chunks actually relayed.
    pub async fn stream_complete(
        &self,
        request_id: &str,
        total_chunks: u64,
    ) -> Result<(), UploadError> {
        let entry = self
            .lookup(request_id)
            .await
            .ok_or(UploadError::UnknownRequest)?;
        let (producer, chunk_tx) = {
            let locked = entry.lock().await;
            if locked.pattern != Pattern::Stream {
                return Err(UploadError::PatternMismatch);
            }
            if locked.state != RequestState::Pending {
                return Err(if locked.stream_reader_gone {
                    UploadError::StreamGone
                } else {
                    UploadError::UnknownRequest
                });
            }
            if !locked.streaming_active {
                return Err(UploadError::ProtocolViolation);
            }
            let Some(producer) = locked.producer.clone() else {
                return Err(UploadError::UnknownRequest);
            };
            (producer, locked.chunk_tx.clone())
        };
        let Some(chunk_tx) = chunk_tx else {
            return Err(UploadError::StreamGone);
        };

        let mut producer = producer.lock().await;
        if producer.reader_gone {
            return Err(UploadError::StreamGone);
        }
        if producer.completed {
            return Err(UploadError::ProtocolViolation);
        }
        if total_chunks != producer.next_seq {
            let relayed = producer.next_seq;
            producer.completed = true;
            drop(producer);
            self.settle(
                request_id,
                &entry,
                RequestState::Failed,
                Some(Outcome::Failed {
                    kind: error_kinds::PROTOCOL_VIOLATION,
                    message: format!(
                        "stream completed claiming {total_chunks} chunks but {relayed} were relayed"
                    ),
                }),
            )
            .await;
            return Err(UploadError::ProtocolViolation);
        }

        match tokio::time::timeout(BACKPRESSURE_WAIT, chunk_tx.send(StreamEvent::End { total_chunks }))
            .await
        {
            Ok(Ok(())) => {
                producer.completed = true;
                drop(producer);
                // The End sentinel, not the reply channel, releases the
                // consumer; the reply sender stays parked so the biased
                // failure arm never fires on a healthy completion.
                self.settle(request_id, &entry, RequestState::Fulfilled, None)
                    .await;
                Ok(())
            }
            Ok(Err(_)) => {
                producer.reader_gone = true;
                drop(producer);
                self.mark_reader_gone(&entry).await;
                self.cancel(
                    request_id,
                    RequestState::Cancelled,
                    error_kinds::STREAM_GONE,
                    "application reader disconnected",
                )
                .await;
                Err(UploadError::StreamGone)
            }
            Err(_) => Err(UploadError::Backpressure),
        }
    }

    /// Pattern B: the Connector reported a mid-stream failure.
    pub async fn stream_error(&self, request_id: &str, message: &str) -> Result<(), UploadError> {
        let entry = self
            .lookup(request_id)
            .await
            .ok_or(UploadError::UnknownRequest)?;
        {
            let locked = entry.lock().await;
            if locked.pattern != Pattern::Stream {
                return Err(UploadError::PatternMismatch);
            }
            if locked.state != RequestState::Pending {
                return Err(UploadError::UnknownRequest);
            }
        }
        if self
            .settle(
                request_id,
                &entry,
                RequestState::Failed,
                Some(Outcome::Failed {
                    kind: error_kinds::OFFLOAD_FAILED,
                    message: message.to_owned(),
                }),
            )
            .await
        {
            Ok(())
        } else {
            Err(UploadError::UnknownRequest)
        }
    }

    /// Moves a non-terminal record to `timed-out`/`cancelled` and
    /// releases its waitable.  Returns false if the record is unknown
    /// or a result won the race (first writer wins).
    pub async fn cancel(
        &self,
        request_id: &str,
        state: RequestState,
        kind: &'static str,
        message: &str,
    ) -> bool {
        let Some(entry) = self.lookup(request_id).await else {
            return false;
        };
        self.settle(
            request_id,
            &entry,
            state,
            Some(Outcome::Failed {
                kind,
                message: message.to_owned(),
            }),
        )
        .await
    }

    /// Fails every pending record that was dispatched to the given
    /// session incarnation.  Requests dispatched to a replacement
    /// session for the same node are untouched.
    pub async fn fail_all_for(&self, mac: &str, generation: u64) {
        let entries: Vec<(String, Entry)> = {
            let map = self.pending.read().await;
            map.iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };
        for (request_id, entry) in entries {
            let targeted = {
                let locked = entry.lock().await;
                locked.state == RequestState::Pending
                    && locked.mac == mac
                    && locked.session_generation == Some(generation)
            };
            if targeted
                && self
                    .settle(
                        &request_id,
                        &entry,
                        RequestState::Failed,
                        Some(Outcome::Failed {
                            kind: error_kinds::CONNECTOR_DISCONNECTED,
                            message: format!("push channel for node {mac} closed mid-request"),
                        }),
                    )
                    .await
            {
                info!(request_id = %request_id, mac = %mac, "request failed: connector disconnected");
            }
        }
    }

    /// Shutdown drain: cancels every pending record.
    pub async fn cancel_all(&self, reason: &str) {
        let entries: Vec<(String, Entry)> = {
            let map = self.pending.read().await;
            map.iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };
        for (request_id, entry) in entries {
            self.settle(
                &request_id,
                &entry,
                RequestState::Cancelled,
                Some(Outcome::Failed {
                    kind: error_kinds::INTERNAL_ERROR,
                    message: reason.to_owned(),
                }),
            )
            .await;
        }
    }

    /// Observation only.
    pub async fn get(&self, request_id: &str) -> Option<StatusResponse> {
        let entry = self.lookup(request_id).await?;
        let locked = entry.lock().await;
        Some(StatusResponse {
            state: locked.state,
            timings: locked.timings,
            error: locked.error.clone(),
        })
    }

    /// Stamps the respond mark and returns the final timings for the
    /// Application response body.  The record itself stays queryable
    /// until the reaper drops it.
    pub async fn finish(&self, request_id: &str) -> Timings {
        match self.lookup(request_id).await {
            Some(entry) => {
                let mut locked = entry.lock().await;
                if locked.timings.t_respond.is_none() {
                    locked.timings.t_respond = Some(self.now_ns());
                }
                locked.timings
            }
            None => Timings::default(),
        }
    }

    async fn lookup(&self, request_id: &str) -> Option<Entry> {
        self.pending.read().await.get(request_id).cloned()
    }

    async fn remove(&self, request_id: &str) {
        if self.pending.write().await.remove(request_id).is_some() {
            debug!(request_id = %request_id, "pending record dropped");
        }
    }

    /// The single-transition primitive.  Moves a pending entry to a
    /// terminal state, records the error descriptor, releases the
    /// waitable at most once, and updates counters.  Returns false if
    /// the entry already reached a terminal state (the caller lost the
    /// race and its payload is discarded).
    async fn settle(
        &self,
        request_id: &str,
        entry: &Entry,
        state: RequestState,
        reply_outcome: Option<Outcome>,
    ) -> bool {
        let mut locked = entry.lock().await;
        if locked.state != RequestState::Pending {
            return false;
        }
        locked.state = state;
        if state == RequestState::Fulfilled && locked.timings.t_result_recv.is_none() {
            locked.timings.t_result_recv = Some(self.now_ns());
        }
        let mut kind_for_log = None;
        if let Some(outcome) = reply_outcome {
            if let Outcome::Failed { kind, ref message } = outcome {
                locked.error = Some(format!("{kind}: {message}"));
                kind_for_log = Some(kind);
            }
            if let Some(reply) = locked.reply.take() {
                // The receiver may already be gone (e.g. the handler
                // timed out and returned); the transition stands.
                let _ = reply.send(outcome);
            }
        }
        // Drop the broker's producer handle so an idle pipe closes once
        // in-flight sends settle.
        locked.chunk_tx = None;

        match state {
            RequestState::Fulfilled => Metrics::incr(&self.metrics.requests_fulfilled),
            RequestState::Failed => Metrics::incr(&self.metrics.requests_failed),
            RequestState::TimedOut => Metrics::incr(&self.metrics.requests_timed_out),
            RequestState::Cancelled => Metrics::incr(&self.metrics.requests_cancelled),
            RequestState::Pending => {}
        }
        if locked.pattern == Pattern::Stream {
            Metrics::gauge_add(&self.metrics.active_streams, -1);
        }
        match kind_for_log {
            Some(kind) => {
                warn!(request_id = %request_id, state = ?state, kind, "request settled");
            }
            None => {
                info!(request_id = %request_id, state = ?state, "request settled");
            }
        }
        true
    }
}
