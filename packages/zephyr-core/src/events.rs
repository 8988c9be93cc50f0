//! Events emitted by the client engine for the application/UI layer.

use crate::negotiator::LinkState;
use crate::signaling::{ErrorCode, PeerInfo};
use crate::transfer::TransferEvent;

/// Everything the application layer needs to render a room session.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The relay confirmed our join; we now know our server-assigned id.
    JoinedRoom { room_id: String, peer_id: String },

    /// Another peer appeared in the room.
    PeerJoined { peer: PeerInfo },

    /// A peer left the room (or was evicted).
    PeerLeft { peer_id: String },

    /// A peer link moved through its negotiation lifecycle.
    LinkStateChanged { peer_id: String, state: LinkState },

    /// A chat line arrived over a data channel.
    ChatReceived {
        peer_id: String,
        id: String,
        sender_name: Option<String>,
        content: String,
        timestamp: i64,
    },

    /// The relay reported a protocol error for one of our messages.
    ServerError { code: ErrorCode, message: String },

    /// File-transfer lifecycle updates.
    Transfer(TransferEvent),
}
