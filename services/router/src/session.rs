//! Connector session registry.
//!
//! Tracks the single live push channel per node identifier.  The
//! registry holds the only sender half of each session's frame channel;
//! the session task (WebSocket loop or SSE stream) owns the receiver.
//! Replacing or removing an entry therefore drops the sender, and the
//! session task observes channel closure and shuts down -- that is the
//! whole eviction mechanism, there is no side channel.

use chrono::{DateTime, Utc};
use dx_protocol::{CommandFrame, ConnectorInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

/// Outbound frames queued per session before `send` backpressures.
const FRAME_QUEUE_DEPTH: usize = 32;

struct SessionRecord {
    generation: u64,
    connected_at: DateTime<Utc>,
    frame_tx: mpsc::Sender<CommandFrame>,
}

/// Identity of one registered session, held by its session task.
///
/// The generation distinguishes a session from a later one for the
/// same node, so a replaced session cannot unregister its successor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub mac: String,
    pub generation: u64,
}

/// Why a command frame could not be handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    NoSuchConnector,
    SendFailed,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    next_generation: AtomicU64,
    metrics: Arc<Metrics>,
}

impl SessionRegistry {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            metrics,
        }
    }

    /// Installs a session for `mac`, atomically replacing any prior one
    /// (last writer wins).  Returns the handle plus the receiver half
    /// of the frame channel, which the session task must drain.
    pub async fn register(&self, mac: &str) -> (SessionHandle, mpsc::Receiver<CommandFrame>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let record = SessionRecord {
            generation,
            connected_at: Utc::now(),
            frame_tx,
        };
        let replaced = self.sessions.write().await.insert(mac.to_owned(), record);
        match replaced {
            Some(old) => {
                // The old sender is dropped here; the prior session task
                // sees its frame channel close and tears itself down.
                warn!(
                    mac = %mac,
                    old_generation = old.generation,
                    new_generation = generation,
                    "replacing live session for node"
                );
            }
            None => {
                Metrics::gauge_add(&self.metrics.active_sessions, 1);
            }
        }
        info!(mac = %mac, generation, "connector session registered");
        (
            SessionHandle {
                mac: mac.to_owned(),
                generation,
            },
            frame_rx,
        )
    }

    /// Removes the session iff `handle` still names the current entry.
    /// Idempotent; a stale handle (already replaced) is a no-op.
    pub async fn unregister(&self, handle: &SessionHandle) {
        let mut map = self.sessions.write().await;
        let current = map
            .get(&handle.mac)
            .is_some_and(|record| record.generation == handle.generation);
        if current {
            map.remove(&handle.mac);
            Metrics::gauge_add(&self.metrics.active_sessions, -1);
            info!(mac = %handle.mac, generation = handle.generation, "connector session removed");
        } else {
            debug!(mac = %handle.mac, generation = handle.generation, "stale unregister ignored");
        }
    }

    /// Queues a command frame for the session serving `mac`.
    ///
    /// Frames for one session are delivered FIFO in `send` order.  On
    /// success returns the session generation the frame was routed to,
    /// so the caller can tie the in-flight request to this particular
    /// session.  A closed channel means the session task already died;
    /// the entry is evicted and `SendFailed` returned.  The registry
    /// never retries.
    pub async fn send(&self, mac: &str, frame: CommandFrame) -> Result<u64, SendError> {
        let (frame_tx, generation) = {
            let map = self.sessions.read().await;
            match map.get(mac) {
                Some(record) => (record.frame_tx.clone(), record.generation),
                None => return Err(SendError::NoSuchConnector),
            }
        };
        if frame_tx.send(frame).await.is_err() {
            warn!(mac = %mac, generation, "frame channel closed, evicting session");
            self.unregister(&SessionHandle {
                mac: mac.to_owned(),
                generation,
            })
            .await;
            return Err(SendError::SendFailed);
        }
        Ok(generation)
    }

    /// Snapshot of live sessions, ordered by connection time.
    pub async fn list(&self) -> Vec<ConnectorInfo> {
        let map = self.sessions.read().await;
        let mut entries: Vec<(&String, &SessionRecord)> = map.iter().collect();
        entries.sort_by(|a, b| a.1.connected_at.cmp(&b.1.connected_at).then(a.0.cmp(b.0)));
        entries
            .into_iter()
            .map(|(mac, record)| ConnectorInfo {
                mac: mac.clone(),
                connected_at: record.connected_at.to_rfc3339(),
            })
            .collect()
    }

    /// Drops every session (shutdown drain).  Session tasks observe
    /// their frame channels closing and exit.
    pub async fn close_all(&self) {
        let mut map = self.sessions.write().await;
        let count = map.len();
        map.clear();
        if count > 0 {
            Metrics::gauge_add(&self.metrics.active_sessions, -(count as i64));
            info!(count, "closed all connector sessions");
        }
    }
}
