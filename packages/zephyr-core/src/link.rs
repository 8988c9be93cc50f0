//! The peer-link capability.
//!
//! NAT traversal, session-description handling, encryption, and the ordered
//! reliable byte channel all live behind these traits — the negotiation
//! engine never touches a transport API directly. A browser build backs them
//! with `RTCPeerConnection`; tests back them with in-memory fakes.
//!
//! Descriptions and candidates are opaque `serde_json::Value` blobs: the
//! engine queues and forwards them but never interprets their contents.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Connection-state transitions observed on a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkConnectionState {
    /// Whether the link can no longer carry traffic.
    pub fn is_down(self) -> bool {
        matches!(
            self,
            LinkConnectionState::Disconnected
                | LinkConnectionState::Failed
                | LinkConnectionState::Closed
        )
    }
}

/// Events a link implementation pushes to the negotiation engine.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The underlying connection changed state.
    StateChanged {
        peer_id: String,
        state: LinkConnectionState,
    },

    /// The link gathered a local connectivity candidate to be signaled to
    /// the remote peer.
    CandidateGathered {
        peer_id: String,
        candidate: serde_json::Value,
    },

    /// A data channel opened (locally created or announced by the remote).
    ChannelOpen {
        peer_id: String,
        channel: Arc<dyn DataChannel>,
    },

    /// Bytes arrived on the link's data channel.
    ChannelMessage { peer_id: String, data: Vec<u8> },
}

/// An established link's ordered reliable byte channel.
pub trait DataChannel: Send + Sync + std::fmt::Debug {
    /// Queue bytes for in-order delivery. Fails if the channel is closed.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Whether the channel currently accepts writes.
    fn is_writable(&self) -> bool;
}

/// One peer link under negotiation or established.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Produce a local session description for an outgoing offer.
    async fn create_offer(&self) -> Result<serde_json::Value>;

    /// Produce a local session description answering a remote offer.
    async fn create_answer(&self) -> Result<serde_json::Value>;

    async fn set_local_description(&self, description: &serde_json::Value) -> Result<()>;

    async fn set_remote_description(&self, description: &serde_json::Value) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: &serde_json::Value) -> Result<()>;

    /// Request an ordered reliable data channel. The channel handle arrives
    /// asynchronously via [`LinkEvent::ChannelOpen`] once it is usable.
    async fn open_channel(&self, label: &str) -> Result<()>;

    /// Tear the link down. Idempotent.
    async fn close(&self);
}

/// Constructs peer links. One engine holds one factory for the room.
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Create a fresh link for `peer_id`, wiring its events into `events`.
    async fn create_link(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}

/// Outbound path from the engine to the relay.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    /// Deliver a signaling envelope to the relay.
    async fn send(&self, message: crate::signaling::SignalMessage) -> Result<()>;
}
