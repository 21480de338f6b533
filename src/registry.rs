//! # Request Stream Registry
//!
//! Per-session maps of request id → in-flight HTTP assembly state and
//! request id → live WebSocket session handle. Owned by one tunnel
//! session and recreated on every reconnect, so nothing here outlives a
//! single connection attempt and no request can leak across sessions.

use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};

use crate::protocol::Headers;

#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub id: String,
    pub method: String,
    pub url: String,
    pub headers: Headers,
}

/// Transient record holding a request's metadata and its body chunks in
/// receive order, from `request` until `end`.
#[derive(Debug)]
pub struct PendingRequest {
    pub meta: RequestMeta,
    pub chunks: Vec<Bytes>,
}

impl PendingRequest {
    /// Concatenates the received chunks in receive order.
    pub fn body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body_len());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    fn body_len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

/// Commands delivered to a live WebSocket bridge worker from the demux
/// loop, in place of the worker reaching back into the registry itself.
#[derive(Debug)]
pub enum WsCommand {
    Frame(Vec<u8>),
    Close,
}

#[derive(Clone)]
pub struct WsHandle {
    pub tx: mpsc::UnboundedSender<WsCommand>,
}

/// Outcome of appending a body chunk to a pending request.
#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The chunk was appended.
    Appended,
    /// Appending the chunk would have pushed the assembled body past
    /// `max_body_bytes`; the request was dropped instead.
    Overflow,
    /// No live request exists under this id; the chunk was dropped.
    Unknown,
}

/// The two per-session registries, guarded by one coarse lock each —
/// critical sections stay short and do no I/O.
#[derive(Default)]
pub struct Registry {
    requests: Mutex<HashMap<String, PendingRequest>>,
    ws_sessions: Mutex<HashMap<String, WsHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `meta` under `meta.id`, replacing any existing entry
    /// under that id.
    pub async fn open_request(&self, meta: RequestMeta) {
        let mut requests = self.requests.lock().await;
        requests.insert(
            meta.id.clone(),
            PendingRequest {
                meta,
                chunks: Vec::new(),
            },
        );
    }

    /// Appends a body chunk if `id` has a live entry, drops it silently
    /// if the id is unknown, and drops the whole request (rather than
    /// letting it grow forever) if doing so would push its assembled
    /// body past `max_body_bytes`.
    pub async fn append_chunk(&self, id: &str, bytes: Bytes, max_body_bytes: usize) -> AppendOutcome {
        let mut requests = self.requests.lock().await;
        let Some(pending) = requests.get_mut(id) else {
            return AppendOutcome::Unknown;
        };
        if pending.body_len() + bytes.len() > max_body_bytes {
            requests.remove(id);
            return AppendOutcome::Overflow;
        }
        pending.chunks.push(bytes);
        AppendOutcome::Appended
    }

    /// Removes and returns the entry for `id`, if any.
    pub async fn take_request(&self, id: &str) -> Option<PendingRequest> {
        self.requests.lock().await.remove(id)
    }

    pub async fn register_ws(&self, id: String, handle: WsHandle) {
        self.ws_sessions.lock().await.insert(id, handle);
    }

    pub async fn ws_handle(&self, id: &str) -> Option<WsHandle> {
        self.ws_sessions.lock().await.get(id).cloned()
    }

    pub async fn take_ws(&self, id: &str) -> Option<WsHandle> {
        self.ws_sessions.lock().await.remove(id)
    }
}
