//! # Chunked File Transfer
//!
//! Runs over an established peer link's ordered reliable channel.
//!
//! ## Transfer Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     FILE TRANSFER PROTOCOL                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  Sender                              Receiver                       │
//! │  ──────                              ────────                       │
//! │                                                                     │
//! │  1. file-start ─────────────────────►  allocate session + buffer    │
//! │     (id, filename, size, mime)                                      │
//! │                                                                     │
//! │  2. chunk ──────────────────────────►  decode base64, place chunk   │
//! │     (index, base64 data)               at its declared index        │
//! │     … strictly increasing index,                                    │
//! │     short pause between chunks                                      │
//! │                                                                     │
//! │  3. done ───────────────────────────►  verify contiguous coverage,  │
//! │                                        reassemble, complete         │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The inter-chunk pause is a throttle to keep channel buffers sane, not a
//! flow-control protocol — it does not react to channel backpressure. The
//! only transfer failure detected in flight is loss of the underlying link;
//! missing chunk data additionally surfaces as a corruption failure when the
//! receiver verifies coverage at `done`.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::channel::{ChannelMessage, FileMetadata};
use crate::events::ClientEvent;
use crate::link::DataChannel;

/// Fixed chunk size for sends: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Pause between chunk emissions.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(50);

/// Reason recorded when a transfer dies with its link.
pub const REASON_PEER_DISCONNECTED: &str = "peer-disconnected";

// ── Session ───────────────────────────────────────────────────────────────────

/// Direction of a transfer relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Lifecycle of a transfer. `Completed` and `Failed` are final; the session
/// record is retained for display, never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed { reason: String },
}

impl TransferStatus {
    /// Whether the transfer is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

/// A tracked transfer session.
#[derive(Debug, Clone)]
pub struct TransferSession {
    /// Unique transfer identifier (the `file_id` on the wire).
    pub id: String,
    /// The remote peer this transfer is attributed to.
    pub peer_id: String,
    pub filename: String,
    /// Declared total size in bytes.
    pub total_size: u64,
    pub mime: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    /// Running progress, 0–100.
    pub progress: u8,
    /// Bytes sent or received so far.
    pub transferred: u64,
    /// Unix timestamp (ms) when the session was created.
    pub started_at: i64,
    /// Receive side only: chunk data placed at its declared index.
    chunks: Vec<Option<Vec<u8>>>,
}

impl TransferSession {
    fn new(metadata: &FileMetadata, peer_id: &str, direction: TransferDirection) -> Self {
        Self {
            id: metadata.id.clone(),
            peer_id: peer_id.to_string(),
            filename: metadata.filename.clone(),
            total_size: metadata.size,
            mime: metadata.mime.clone(),
            direction,
            status: TransferStatus::Pending,
            progress: 0,
            transferred: 0,
            started_at: crate::time::now_timestamp_millis(),
            chunks: Vec::new(),
        }
    }

    fn update_progress(&mut self) {
        self.progress = if self.total_size == 0 {
            0
        } else {
            ((self.transferred * 100) / self.total_size).min(100) as u8
        };
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Transfer lifecycle updates surfaced to the application layer.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started {
        transfer_id: String,
        peer_id: String,
        filename: String,
        total_size: u64,
        direction: TransferDirection,
    },

    Progress {
        transfer_id: String,
        transferred: u64,
        total_size: u64,
        progress: u8,
    },

    /// `data` holds the reassembled bytes on the receive side, `None` for
    /// completed sends.
    Completed {
        transfer_id: String,
        data: Option<Vec<u8>>,
    },

    Failed {
        transfer_id: String,
        reason: String,
    },
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Chunked send/receive engine. Cheap to clone; all clones share the session
/// table, so a paced send task and the dispatch loop see the same state.
#[derive(Clone)]
pub struct TransferEngine {
    sessions: Arc<DashMap<String, TransferSession>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl TransferEngine {
    pub fn new(events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            events,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: DEFAULT_CHUNK_DELAY,
        }
    }

    /// Override chunk size and pacing delay.
    pub fn with_pacing(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = chunk_delay;
        self
    }

    /// Snapshot of a session, if tracked.
    pub fn session(&self, transfer_id: &str) -> Option<TransferSession> {
        self.sessions.get(transfer_id).map(|s| s.clone())
    }

    /// Snapshot of every tracked session, for display.
    pub fn sessions(&self) -> Vec<TransferSession> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(ClientEvent::Transfer(event));
    }

    // ── Sending ───────────────────────────────────────────────────────────

    /// Register an outgoing transfer session before its paced send starts.
    pub fn begin_send(&self, metadata: &FileMetadata, peer_id: &str) {
        let session = TransferSession::new(metadata, peer_id, TransferDirection::Send);
        self.emit(TransferEvent::Started {
            transfer_id: session.id.clone(),
            peer_id: session.peer_id.clone(),
            filename: session.filename.clone(),
            total_size: session.total_size,
            direction: TransferDirection::Send,
        });
        self.sessions.insert(session.id.clone(), session);
    }

    /// Drive one outgoing transfer to completion: `file-start`, then chunks
    /// in strictly increasing index order with a pacing pause between them,
    /// then `done`.
    ///
    /// Stops emitting as soon as the session leaves `Transferring` — tearing
    /// down the owning link fails the session and cancels the remainder.
    pub async fn run_send(
        self,
        metadata: FileMetadata,
        channel: Arc<dyn DataChannel>,
        data: Vec<u8>,
    ) {
        let transfer_id = metadata.id.clone();

        // A session failed before the task got scheduled stays failed.
        {
            let Some(mut session) = self.sessions.get_mut(&transfer_id) else {
                return;
            };
            if session.status != TransferStatus::Pending {
                return;
            }
            session.status = TransferStatus::Transferring;
        }

        if self
            .send_frame(&channel, &ChannelMessage::FileStart { metadata })
            .is_err()
        {
            self.fail(&transfer_id, REASON_PEER_DISCONNECTED);
            return;
        }

        let total = data.len() as u64;
        let chunk_count = data.chunks(self.chunk_size).len();

        for (index, chunk) in data.chunks(self.chunk_size).enumerate() {
            // Cancellation check: a peer-left teardown fails the session
            // between chunks and must stop further emission.
            match self.sessions.get(&transfer_id) {
                Some(session) if session.status == TransferStatus::Transferring => {}
                _ => return,
            }

            let frame = ChannelMessage::Chunk {
                file_id: transfer_id.clone(),
                index: index as u32,
                data: BASE64.encode(chunk),
            };
            if self.send_frame(&channel, &frame).is_err() {
                self.fail(&transfer_id, REASON_PEER_DISCONNECTED);
                return;
            }

            if let Some(mut session) = self.sessions.get_mut(&transfer_id) {
                session.transferred += chunk.len() as u64;
                session.update_progress();
                let event = TransferEvent::Progress {
                    transfer_id: transfer_id.clone(),
                    transferred: session.transferred,
                    total_size: total,
                    progress: session.progress,
                };
                drop(session);
                self.emit(event);
            }

            if index + 1 < chunk_count {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        match self.sessions.get(&transfer_id) {
            Some(session) if session.status == TransferStatus::Transferring => {}
            _ => return,
        }

        let done = ChannelMessage::Done {
            file_id: transfer_id.clone(),
        };
        if self.send_frame(&channel, &done).is_err() {
            self.fail(&transfer_id, REASON_PEER_DISCONNECTED);
            return;
        }

        if let Some(mut session) = self.sessions.get_mut(&transfer_id) {
            session.status = TransferStatus::Completed;
            session.progress = 100;
        }
        self.emit(TransferEvent::Completed {
            transfer_id,
            data: None,
        });
    }

    fn send_frame(
        &self,
        channel: &Arc<dyn DataChannel>,
        message: &ChannelMessage,
    ) -> crate::error::Result<()> {
        let bytes = serde_json::to_vec(message)?;
        channel.send(&bytes)
    }

    // ── Receiving ─────────────────────────────────────────────────────────

    /// `file-start`: allocate the session and its chunk buffer.
    pub fn on_file_start(&self, peer_id: &str, metadata: &FileMetadata) {
        if self.sessions.contains_key(&metadata.id) {
            tracing::warn!(
                transfer_id = metadata.id.as_str(),
                "Duplicate file-start, ignoring"
            );
            return;
        }

        let session = TransferSession::new(metadata, peer_id, TransferDirection::Receive);
        tracing::debug!(
            transfer_id = session.id.as_str(),
            filename = session.filename.as_str(),
            size = session.total_size,
            "Incoming file transfer"
        );
        self.emit(TransferEvent::Started {
            transfer_id: session.id.clone(),
            peer_id: session.peer_id.clone(),
            filename: session.filename.clone(),
            total_size: session.total_size,
            direction: TransferDirection::Receive,
        });
        self.sessions.insert(session.id.clone(), session);
    }

    /// `chunk`: decode and place the data at its declared index. Chunks for
    /// unknown or already-terminal transfers are dropped.
    pub fn on_chunk(&self, peer_id: &str, file_id: &str, index: u32, data_b64: &str) {
        let Some(mut session) = self.sessions.get_mut(file_id) else {
            tracing::debug!(transfer_id = file_id, "Chunk for unknown transfer, dropping");
            return;
        };
        if session.status.is_terminal() || session.peer_id != peer_id {
            return;
        }

        let bytes = match BASE64.decode(data_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    transfer_id = file_id,
                    index = index,
                    error = %e,
                    "Undecodable chunk payload, dropping"
                );
                return;
            }
        };

        session.status = TransferStatus::Transferring;

        let slot = index as usize;
        if slot >= session.chunks.len() {
            session.chunks.resize(slot + 1, None);
        }
        if session.chunks[slot].is_none() {
            session.transferred += bytes.len() as u64;
        }
        session.chunks[slot] = Some(bytes);
        session.update_progress();

        let event = TransferEvent::Progress {
            transfer_id: session.id.clone(),
            transferred: session.transferred,
            total_size: session.total_size,
            progress: session.progress,
        };
        drop(session);
        self.emit(event);
    }

    /// `done`: verify contiguous coverage of the declared size, reassemble,
    /// and complete — or fail the session as corrupted.
    pub fn on_done(&self, peer_id: &str, file_id: &str) {
        let assembled = {
            let Some(mut session) = self.sessions.get_mut(file_id) else {
                tracing::debug!(transfer_id = file_id, "Done for unknown transfer, dropping");
                return;
            };
            if session.status.is_terminal() || session.peer_id != peer_id {
                return;
            }

            let gap = session.chunks.iter().any(|c| c.is_none());
            if gap || session.transferred != session.total_size {
                session.status = TransferStatus::Failed {
                    reason: "corrupted transfer: incomplete chunk coverage".to_string(),
                };
                let event = TransferEvent::Failed {
                    transfer_id: session.id.clone(),
                    reason: "corrupted transfer: incomplete chunk coverage".to_string(),
                };
                drop(session);
                self.emit(event);
                return;
            }

            let mut assembled = Vec::with_capacity(session.total_size as usize);
            for chunk in session.chunks.iter().flatten() {
                assembled.extend_from_slice(chunk);
            }
            session.status = TransferStatus::Completed;
            session.progress = 100;
            session.chunks.clear();
            assembled
        };

        self.emit(TransferEvent::Completed {
            transfer_id: file_id.to_string(),
            data: Some(assembled),
        });
    }

    // ── Failure paths ─────────────────────────────────────────────────────

    /// Fail a single transfer. No-op if already terminal.
    pub fn fail(&self, transfer_id: &str, reason: &str) {
        let failed = {
            let Some(mut session) = self.sessions.get_mut(transfer_id) else {
                return;
            };
            if session.status.is_terminal() {
                false
            } else {
                session.status = TransferStatus::Failed {
                    reason: reason.to_string(),
                };
                true
            }
        };

        if failed {
            self.emit(TransferEvent::Failed {
                transfer_id: transfer_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Fail every in-flight transfer attributed to a peer. Called when the
    /// peer leaves the room or its link goes down.
    pub fn fail_for_peer(&self, peer_id: &str, reason: &str) {
        let affected: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.peer_id == peer_id && !s.status.is_terminal())
            .map(|s| s.id.clone())
            .collect();

        for transfer_id in affected {
            self.fail(&transfer_id, reason);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
