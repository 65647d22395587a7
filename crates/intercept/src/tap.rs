//! Decrypted frame tap
//!
//! The relay tees upstream→client byte runs into the tap registered for the
//! in-flight submission. A tap is scoped to the submission's backend host:
//! the intercepted page may open side connections (telemetry, assets)
//! through the proxy, and their frames must not bleed into the response
//! stream, so `publish` delivers only frames whose connection host matches
//! the registered one. The gateway holds at most one submission against the
//! backend session at a time, so the registry carries a single slot; frames
//! observed while no tap is registered are dropped.

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// One decrypted event observed on the intercepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// A run of decrypted upstream→client bytes.
    Data(Bytes),
    /// The upstream closed the connection cleanly.
    Closed,
    /// The relay tore down mid-stream (upstream error or reset).
    Aborted,
}

const TAP_BUFFER: usize = 256;

struct Slot {
    request_id: String,
    host: String,
    tx: mpsc::Sender<StreamFrame>,
}

/// Hands out at most one frame receiver, scoped to one submission's host.
#[derive(Default)]
pub struct TapRegistry {
    slot: Mutex<Option<Slot>>,
}

impl TapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tap for `request_id`, matching frames from connections to
    /// `host` only. Replaces any previous tap (the old receiver sees its
    /// sender dropped).
    pub async fn register(&self, request_id: &str, host: &str) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(TAP_BUFFER);
        let mut slot = self.slot.lock().await;
        if let Some(old) = slot.replace(Slot {
            request_id: request_id.to_string(),
            host: host.to_string(),
            tx,
        }) {
            debug!(request_id = %old.request_id, "replacing stale tap");
        }
        rx
    }

    /// Drop the tap for `request_id` if it is still the registered one.
    pub async fn unregister(&self, request_id: &str) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|s| s.request_id == request_id) {
            *slot = None;
        }
    }

    /// Publish one frame observed on a connection to `host`. Frames for a
    /// different host, with no tap, or for a receiver that fell behind or
    /// went away, are dropped.
    pub async fn publish(&self, host: &str, frame: StreamFrame) {
        let tx = {
            let slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(s) if s.host == host => s.tx.clone(),
                Some(_) => {
                    debug!(host, "frame from unrelated host dropped");
                    return;
                }
                None => return,
            }
        };
        if tx.send(frame).await.is_err() {
            debug!("tap receiver gone, frame dropped");
        }
    }

    /// Whether any tap is currently registered.
    pub async fn is_registered(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}
