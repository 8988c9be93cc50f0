//! Data-channel envelope.
//!
//! Messages exchanged peer-to-peer over an established link's ordered
//! reliable channel — the relay is never involved. Chat rides the same
//! channel as file transfers; chunk payloads are base64 strings so the
//! envelope stays plain JSON.

use serde::{Deserialize, Serialize};

/// A message on the peer-to-peer data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// A chat line, delivered directly to the remote peer.
    Chat {
        id: String,
        sender_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        content: String,
        /// Unix timestamp (ms) at the sender.
        timestamp: i64,
    },

    /// Announces an incoming file and its metadata. The receiver allocates a
    /// transfer session keyed by `metadata.id`.
    FileStart { metadata: FileMetadata },

    /// One chunk of file data, base64-encoded, with its zero-based index.
    Chunk {
        file_id: String,
        index: u32,
        data: String,
    },

    /// The sender has emitted the final chunk; the receiver reassembles.
    Done { file_id: String },
}

/// Metadata announced in `file-start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Transfer id, unique per file send.
    pub id: String,
    pub filename: String,
    /// Declared total size in bytes.
    pub size: u64,
    pub mime: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}
