//! Connector push-channel endpoint.
//!
//! `GET /connect?mac=...` serves the persistent command channel.  An
//! upgrade request becomes a WebSocket session; anything else gets a
//! server-sent-events stream.  Both transports carry one JSON frame per
//! message / `data:` line, and both register in the session registry so
//! the broker can push command frames.
//!
//! Liveness: the WebSocket loop pings every keep-alive interval and
//! evicts after two consecutive unanswered pings.  SSE is one-way, so
//! an SSE session lives until its keep-alive write fails or the
//! registry replaces it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use dx_protocol::{error_kinds, normalize_mac, CommandFrame, ControlFrame};
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::http::response::error_response;
use crate::session::SessionHandle;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    mac: Option<String>,
}

pub async fn connect_handler(
    ws: Option<WebSocketUpgrade>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    let mac = query.mac.as_deref().map(normalize_mac).unwrap_or_default();
    if mac.is_empty() {
        return error_response(
            error_kinds::PROTOCOL_VIOLATION,
            "connect requires a non-empty mac query parameter",
        );
    }
    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| run_ws_session(socket, state, mac))
            .into_response(),
        None => sse_session(state, mac).await.into_response(),
    }
}

async fn run_ws_session(mut socket: WebSocket, state: AppState, mac: String) {
    let (handle, mut frame_rx) = state.sessions.register(&mac).await;
    info!(mac = %mac, "connector connected (websocket)");

    let mut keepalive = tokio::time::interval(state.config.keepalive_interval);
    keepalive.tick().await;
    let mut unanswered_pings: u8 = 0;

    loop {
        tokio::select! {
            queued = frame_rx.recv() => {
                match queued {
                    Some(frame) => {
                        if !send_frame(&mut socket, &frame).await {
                            warn!(mac = %mac, "frame write failed, closing session");
                            break;
                        }
                    }
                    // Registry dropped our sender: replaced or shut down.
                    None => {
                        debug!(mac = %mac, "frame channel closed, session superseded");
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                if unanswered_pings >= 2 {
                    warn!(mac = %mac, "two keep-alive pings unanswered, evicting");
                    break;
                }
                let ping = match serde_json::to_string(&ControlFrame::Ping) {
                    Ok(json) => json,
                    Err(_) => break,
                };
                if socket.send(Message::Text(ping.into())).await.is_err() {
                    break;
                }
                unanswered_pings += 1;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlFrame>(&text) {
                            Ok(ControlFrame::Pong) => unanswered_pings = 0,
                            Ok(ControlFrame::Ping) => {
                                let pong = serde_json::to_string(&ControlFrame::Pong)
                                    .unwrap_or_default();
                                let _ = socket.send(Message::Text(pong.into())).await;
                            }
                            Err(_) => {
                                debug!(mac = %mac, "ignoring unrecognized frame from connector");
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => unanswered_pings = 0,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(mac = %mac, "connector disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(mac = %mac, error = %e, "websocket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    teardown(&state, &handle).await;
    info!(mac = %mac, "connector session ended");
}

async fn send_frame(socket: &mut WebSocket, frame: &CommandFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

/// SSE variant of the push channel for connectors that cannot hold a
/// WebSocket open.  The frame receiver is wrapped into the response
/// stream; dropping the response (client disconnect, keep-alive write
/// failure) drops the guard, which tears the session down.
async fn sse_session(
    state: AppState,
    mac: String,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let (handle, frame_rx) = state.sessions.register(&mac).await;
    info!(mac = %mac, "connector connected (sse)");
    let keepalive_interval = state.config.keepalive_interval;
    let guard = SessionGuard {
        state,
        handle,
    };

    let stream = ReceiverStream::new(frame_rx).filter_map(move |frame| {
        let _held = &guard;
        let event = serde_json::to_string(&frame)
            .ok()
            .map(|json| Ok(Event::default().data(json)));
        async move { event }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(keepalive_interval)
            .text("keepalive"),
    )
}

/// Unregisters the session and fails the requests that were dispatched
/// to it.  Used explicitly by the WebSocket loop and via `Drop` by the
/// SSE stream.
async fn teardown(state: &AppState, handle: &SessionHandle) {
    state.sessions.unregister(handle).await;
    state
        .broker
        .fail_all_for(&handle.mac, handle.generation)
        .await;
}

struct SessionGuard {
    state: AppState,
    handle: SessionHandle,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let handle = self.handle.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                teardown(&state, &handle).await;
                info!(mac = %handle.mac, "connector session ended");
            });
        }
    }
}
