//! Error types for the client core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client core.
///
/// Negotiation errors are deliberately non-fatal to the engine: a rejected
/// description or candidate leaves the affected link broken but the room
/// session keeps running.
#[derive(Error, Debug)]
pub enum Error {
    /// The peer-link capability rejected an operation.
    #[error("peer link failure: {0}")]
    Link(String),

    /// The data channel refused a write (closed or not yet open).
    #[error("data channel unavailable: {0}")]
    Channel(String),

    /// The signaling transport could not deliver a message to the relay.
    #[error("signaling send failed: {0}")]
    Signaling(String),

    /// A transfer-protocol violation or corrupted reassembly.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Chunk payload was not valid base64.
    #[error("chunk encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Envelope (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client has not yet learned its server-assigned peer id.
    #[error("not joined to a room yet")]
    NotJoined,
}
