//! # Peer Negotiation
//!
//! Per-remote-peer state machine that turns relayed signaling messages into
//! established peer links.
//!
//! ## Who initiates
//!
//! Only the peer that just received the initial `peer-list` initiates
//! connections, to every peer in that list. A peer that instead observes a
//! `peer-joined` notification waits to receive an offer. This asymmetric
//! rule is the collision-avoidance strategy: the two sides of any pair can
//! never both be the initiator under normal join ordering.
//!
//! ## Link lifecycle
//!
//! ```text
//!             initiate                     offer received
//!   Idle ───────────────► LocalOfferSent      Idle ──► RemoteOfferReceived
//!                │                                          │
//!                │ answer received                          │ answer sent
//!                ▼                                          ▼
//!             Stable ◄────────────────────────────── AnswerSent
//!                          (channel opens)
//! ```
//!
//! Candidates that arrive before the matching description are queued per
//! side and drained when the description lands. Negotiation failures leave
//! the link `Broken` — still listed, not connected, never retried.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::{ChannelMessage, FileMetadata};
use crate::error::{Error, Result};
use crate::events::ClientEvent;
use crate::link::{DataChannel, LinkEvent, PeerLink, PeerLinkFactory, SignalingSink};
use crate::signaling::{JoinPayload, PeerInfo, SignalMessage};
use crate::transfer::{TransferEngine, REASON_PEER_DISCONNECTED};

/// Label for the data channel carrying chat and file traffic.
const CHANNEL_LABEL: &str = "zephyr";

/// Cap on each per-peer candidate queue.
const MAX_QUEUED_CANDIDATES: usize = 64;

/// Negotiation state of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Peer is known, no negotiation yet.
    Idle,
    /// We sent an offer and are waiting for the answer.
    LocalOfferSent,
    /// We received an offer and are producing the answer.
    RemoteOfferReceived,
    /// Our answer went out; waiting for the link to settle.
    AnswerSent,
    /// Negotiation finished; the link is (or is becoming) usable.
    Stable,
    /// The link capability rejected a description or candidate, or the
    /// connection dropped. Not terminal for the room session — the peer is
    /// still listed, just not connected.
    Broken,
}

/// Everything tracked for one remote peer.
struct PeerEntry {
    info: PeerInfo,
    link: Option<Arc<dyn PeerLink>>,
    state: LinkState,
    local_description_set: bool,
    remote_description_set: bool,
    /// Inbound candidates buffered until the remote description is set.
    pending_remote_candidates: Vec<serde_json::Value>,
    /// Locally gathered candidates buffered until the local description is set.
    pending_local_candidates: Vec<serde_json::Value>,
    channel: Option<Arc<dyn DataChannel>>,
}

impl PeerEntry {
    fn new(info: PeerInfo) -> Self {
        Self {
            info,
            link: None,
            state: LinkState::Idle,
            local_description_set: false,
            remote_description_set: false,
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            channel: None,
        }
    }
}

/// Client engine for one room membership.
///
/// Drive it from a single loop: feed relayed envelopes to
/// [`handle_signal`](RoomClient::handle_signal) and link events to
/// [`handle_link_event`](RoomClient::handle_link_event). Sequential dispatch
/// is what serializes per-peer negotiation — never call into one `RoomClient`
/// from two tasks.
pub struct RoomClient {
    room_id: String,
    username: Option<String>,
    /// Our server-assigned peer id, learned from the `peer-list` envelope.
    local_id: Option<String>,
    peers: HashMap<String, PeerEntry>,
    factory: Arc<dyn PeerLinkFactory>,
    signaling: Arc<dyn SignalingSink>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    events: mpsc::UnboundedSender<ClientEvent>,
    transfers: TransferEngine,
}

impl RoomClient {
    /// Create a client for `room_id`. Returns the receiver for link events;
    /// the caller owns the loop that feeds them back into
    /// [`handle_link_event`](RoomClient::handle_link_event).
    pub fn new(
        room_id: impl Into<String>,
        username: Option<String>,
        factory: Arc<dyn PeerLinkFactory>,
        signaling: Arc<dyn SignalingSink>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let client = Self {
            room_id: room_id.into(),
            username,
            local_id: None,
            peers: HashMap::new(),
            factory,
            signaling,
            link_events: link_tx,
            events: events.clone(),
            transfers: TransferEngine::new(events),
        };
        (client, link_rx)
    }

    /// Our server-assigned peer id, once the `peer-list` has arrived.
    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    /// The transfer engine, for session inspection.
    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    /// Current negotiation state for a peer, if known.
    pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        self.peers.get(peer_id).map(|p| p.state)
    }

    /// Ids of peers with an open data channel.
    pub fn connected_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, p)| p.channel.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    // ── Room membership ───────────────────────────────────────────────────

    /// Ask the relay to put us in the room.
    pub async fn join(&self) -> Result<()> {
        self.signaling
            .send(SignalMessage::Join {
                room_id: self.room_id.clone(),
                payload: JoinPayload {
                    username: self.username.clone(),
                },
            })
            .await
    }

    /// Leave the room: tell the relay, tear down every link, fail in-flight
    /// transfers.
    pub async fn leave(&mut self) -> Result<()> {
        self.signaling
            .send(SignalMessage::Leave {
                room_id: Some(self.room_id.clone()),
            })
            .await?;

        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.teardown_peer(&peer_id).await;
        }
        Ok(())
    }

    // ── Signaling dispatch ────────────────────────────────────────────────

    /// Feed one relayed envelope into the state machine.
    pub async fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::PeerList {
                room_id,
                target_id,
                payload,
                ..
            } => {
                // The envelope is addressed to us alone; target_id carries
                // our own server-assigned id.
                if let Some(id) = target_id {
                    self.local_id = Some(id.clone());
                    self.emit(ClientEvent::JoinedRoom {
                        room_id,
                        peer_id: id,
                    });
                }

                // Receiving the peer-list makes us the initiator toward
                // everyone already in the room.
                for info in payload {
                    let peer_id = info.id.clone();
                    self.peers
                        .entry(peer_id.clone())
                        .or_insert_with(|| PeerEntry::new(info.clone()));
                    self.emit(ClientEvent::PeerJoined { peer: info });
                    self.initiate(&peer_id).await;
                }
            }

            SignalMessage::PeerJoined { payload, .. } => {
                // A newcomer initiates toward us — we wait for its offer.
                self.peers
                    .entry(payload.id.clone())
                    .or_insert_with(|| PeerEntry::new(payload.clone()));
                self.emit(ClientEvent::PeerJoined { peer: payload });
            }

            SignalMessage::PeerLeft { payload, .. } => {
                self.on_peer_left(&payload.peer_id).await;
            }

            SignalMessage::Offer {
                sender_id, payload, ..
            } => {
                if let Some(sender) = sender_id {
                    self.on_offer(&sender, payload).await;
                }
            }

            SignalMessage::Answer {
                sender_id, payload, ..
            } => {
                if let Some(sender) = sender_id {
                    self.on_answer(&sender, payload).await;
                }
            }

            SignalMessage::Candidate {
                sender_id, payload, ..
            } => {
                if let Some(sender) = sender_id {
                    self.on_candidate(&sender, payload).await;
                }
            }

            SignalMessage::Ping => {
                // Liveness probe — acknowledge or get evicted.
                if let Err(e) = self.signaling.send(SignalMessage::Pong).await {
                    tracing::warn!(error = %e, "Failed to acknowledge liveness probe");
                }
            }

            SignalMessage::Error { payload } => {
                tracing::warn!(
                    code = ?payload.code,
                    message = payload.message.as_str(),
                    "Relay reported an error"
                );
                self.emit(ClientEvent::ServerError {
                    code: payload.code,
                    message: payload.message,
                });
            }

            // Client-originated tags have no meaning when received.
            SignalMessage::Join { .. }
            | SignalMessage::Leave { .. }
            | SignalMessage::Pong => {}
        }
    }

    // ── Negotiation ───────────────────────────────────────────────────────

    /// Open a link toward `peer_id`: create the data channel, produce and
    /// send the offer.
    async fn initiate(&mut self, peer_id: &str) {
        let link = match self
            .factory
            .create_link(peer_id, self.link_events.clone())
            .await
        {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(peer_id = peer_id, error = %e, "Failed to create peer link");
                self.mark_broken(peer_id);
                return;
            }
        };

        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.link = Some(link.clone());
        }

        let offer = async {
            link.open_channel(CHANNEL_LABEL).await?;
            let offer = link.create_offer().await?;
            link.set_local_description(&offer).await?;
            Ok::<_, Error>(offer)
        }
        .await;

        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!(peer_id = peer_id, error = %e, "Offer negotiation failed");
                self.mark_broken(peer_id);
                return;
            }
        };

        self.set_state(peer_id, LinkState::LocalOfferSent);
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.local_description_set = true;
        }
        self.drain_local_candidates(peer_id).await;

        let message = SignalMessage::Offer {
            room_id: Some(self.room_id.clone()),
            sender_id: self.local_id.clone(),
            target_id: Some(peer_id.to_string()),
            payload: offer,
        };
        if let Err(e) = self.signaling.send(message).await {
            tracing::warn!(peer_id = peer_id, error = %e, "Failed to send offer");
            self.mark_broken(peer_id);
        }
    }

    /// A remote offer arrived: apply it, answer it.
    async fn on_offer(&mut self, sender_id: &str, offer: serde_json::Value) {
        if !self.peers.contains_key(sender_id) {
            // Offer can race ahead of the peer-joined notification.
            self.peers.insert(
                sender_id.to_string(),
                PeerEntry::new(PeerInfo {
                    id: sender_id.to_string(),
                    username: None,
                    joined_at: crate::time::now_timestamp_millis(),
                }),
            );
        }

        let state = self.peers.get(sender_id).map(|p| p.state);
        if state != Some(LinkState::Idle) {
            // Glare: an offer while we are already negotiating. Upstream
            // semantics are to apply it anyway; under rapid simultaneous
            // joins this can leave the link wedged.
            tracing::warn!(
                peer_id = sender_id,
                state = ?state,
                "Offer received in non-idle state, proceeding anyway"
            );
        }

        let link = match self.peers.get(sender_id).and_then(|p| p.link.clone()) {
            Some(link) => link,
            None => {
                match self
                    .factory
                    .create_link(sender_id, self.link_events.clone())
                    .await
                {
                    Ok(link) => {
                        if let Some(entry) = self.peers.get_mut(sender_id) {
                            entry.link = Some(link.clone());
                        }
                        link
                    }
                    Err(e) => {
                        tracing::warn!(peer_id = sender_id, error = %e, "Failed to create peer link");
                        self.mark_broken(sender_id);
                        return;
                    }
                }
            }
        };

        if let Err(e) = link.set_remote_description(&offer).await {
            tracing::warn!(peer_id = sender_id, error = %e, "Remote offer rejected");
            self.mark_broken(sender_id);
            return;
        }
        self.set_state(sender_id, LinkState::RemoteOfferReceived);
        if let Some(entry) = self.peers.get_mut(sender_id) {
            entry.remote_description_set = true;
        }
        self.drain_remote_candidates(sender_id).await;

        let answer = async {
            let answer = link.create_answer().await?;
            link.set_local_description(&answer).await?;
            Ok::<_, Error>(answer)
        }
        .await;

        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(peer_id = sender_id, error = %e, "Answer negotiation failed");
                self.mark_broken(sender_id);
                return;
            }
        };

        if let Some(entry) = self.peers.get_mut(sender_id) {
            entry.local_description_set = true;
        }
        self.drain_local_candidates(sender_id).await;

        let message = SignalMessage::Answer {
            room_id: Some(self.room_id.clone()),
            sender_id: self.local_id.clone(),
            target_id: Some(sender_id.to_string()),
            payload: answer,
        };
        match self.signaling.send(message).await {
            Ok(()) => self.set_state(sender_id, LinkState::AnswerSent),
            Err(e) => {
                tracing::warn!(peer_id = sender_id, error = %e, "Failed to send answer");
                self.mark_broken(sender_id);
            }
        }
    }

    /// An answer arrived. Valid only while we wait in `LocalOfferSent`;
    /// anything else is stale or duplicate and silently ignored.
    async fn on_answer(&mut self, sender_id: &str, answer: serde_json::Value) {
        let Some(entry) = self.peers.get(sender_id) else {
            tracing::debug!(peer_id = sender_id, "Answer from unknown peer, dropping");
            return;
        };
        if entry.state != LinkState::LocalOfferSent {
            tracing::debug!(
                peer_id = sender_id,
                state = ?entry.state,
                "Stale answer, ignoring"
            );
            return;
        }
        let Some(link) = entry.link.clone() else {
            return;
        };

        if let Err(e) = link.set_remote_description(&answer).await {
            tracing::warn!(peer_id = sender_id, error = %e, "Remote answer rejected");
            self.mark_broken(sender_id);
            return;
        }

        if let Some(entry) = self.peers.get_mut(sender_id) {
            entry.remote_description_set = true;
        }
        self.drain_remote_candidates(sender_id).await;
        self.set_state(sender_id, LinkState::Stable);
    }

    /// A connectivity candidate arrived. Queued until the remote description
    /// is set; dropped when no link exists for the sender at all.
    async fn on_candidate(&mut self, sender_id: &str, candidate: serde_json::Value) {
        let link = {
            let Some(entry) = self.peers.get_mut(sender_id) else {
                tracing::debug!(peer_id = sender_id, "Candidate for unknown peer, dropping");
                return;
            };
            let Some(link) = entry.link.clone() else {
                tracing::debug!(peer_id = sender_id, "Candidate before any link, dropping");
                return;
            };

            if !entry.remote_description_set {
                if entry.pending_remote_candidates.len() >= MAX_QUEUED_CANDIDATES {
                    tracing::warn!(peer_id = sender_id, "Inbound candidate queue full, dropping");
                    return;
                }
                entry.pending_remote_candidates.push(candidate);
                return;
            }
            link
        };

        if let Err(e) = link.add_remote_candidate(&candidate).await {
            tracing::warn!(peer_id = sender_id, error = %e, "Candidate rejected");
        }
    }

    /// A peer left: tear its link down and fail its in-flight transfers.
    async fn on_peer_left(&mut self, peer_id: &str) {
        self.teardown_peer(peer_id).await;
        self.emit(ClientEvent::PeerLeft {
            peer_id: peer_id.to_string(),
        });
    }

    async fn teardown_peer(&mut self, peer_id: &str) {
        if let Some(entry) = self.peers.remove(peer_id) {
            if let Some(link) = entry.link {
                link.close().await;
            }
        }
        self.transfers.fail_for_peer(peer_id, REASON_PEER_DISCONNECTED);
    }

    fn set_state(&mut self, peer_id: &str, state: LinkState) {
        let changed = match self.peers.get_mut(peer_id) {
            Some(entry) if entry.state != state => {
                entry.state = state;
                true
            }
            _ => false,
        };
        if changed {
            self.emit(ClientEvent::LinkStateChanged {
                peer_id: peer_id.to_string(),
                state,
            });
        }
    }

    fn mark_broken(&mut self, peer_id: &str) {
        self.set_state(peer_id, LinkState::Broken);
    }

    /// Apply queued inbound candidates now that the remote description is set.
    async fn drain_remote_candidates(&mut self, peer_id: &str) {
        let (link, queued) = match self.peers.get_mut(peer_id) {
            Some(entry) => (
                entry.link.clone(),
                std::mem::take(&mut entry.pending_remote_candidates),
            ),
            None => return,
        };
        let Some(link) = link else { return };

        for candidate in queued {
            if let Err(e) = link.add_remote_candidate(&candidate).await {
                tracing::warn!(peer_id = peer_id, error = %e, "Queued candidate rejected");
            }
        }
    }

    /// Flush locally gathered candidates now that the local description is set.
    async fn drain_local_candidates(&mut self, peer_id: &str) {
        let queued = match self.peers.get_mut(peer_id) {
            Some(entry) => std::mem::take(&mut entry.pending_local_candidates),
            None => return,
        };

        for candidate in queued {
            self.send_candidate(peer_id, candidate).await;
        }
    }

    async fn send_candidate(&self, peer_id: &str, candidate: serde_json::Value) {
        let message = SignalMessage::Candidate {
            room_id: Some(self.room_id.clone()),
            sender_id: self.local_id.clone(),
            target_id: Some(peer_id.to_string()),
            payload: candidate,
        };
        if let Err(e) = self.signaling.send(message).await {
            tracing::warn!(peer_id = peer_id, error = %e, "Failed to send candidate");
        }
    }

    // ── Link events ───────────────────────────────────────────────────────

    /// Feed one event from the link capability into the state machine.
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged { peer_id, state } => {
                if state.is_down() && self.peers.contains_key(&peer_id) {
                    if let Some(entry) = self.peers.get_mut(&peer_id) {
                        entry.channel = None;
                    }
                    tracing::info!(peer_id = peer_id.as_str(), state = ?state, "Peer link went down");
                    self.mark_broken(&peer_id);
                    self.transfers
                        .fail_for_peer(&peer_id, REASON_PEER_DISCONNECTED);
                }
            }

            LinkEvent::CandidateGathered { peer_id, candidate } => {
                let ready = match self.peers.get_mut(&peer_id) {
                    Some(entry) => {
                        if entry.local_description_set {
                            true
                        } else {
                            if entry.pending_local_candidates.len() >= MAX_QUEUED_CANDIDATES {
                                tracing::warn!(
                                    peer_id = peer_id.as_str(),
                                    "Outbound candidate queue full, dropping"
                                );
                                return;
                            }
                            entry.pending_local_candidates.push(candidate.clone());
                            false
                        }
                    }
                    None => return,
                };

                if ready {
                    self.send_candidate(&peer_id, candidate).await;
                }
            }

            LinkEvent::ChannelOpen { peer_id, channel } => {
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.channel = Some(channel);
                } else {
                    return;
                }
                self.set_state(&peer_id, LinkState::Stable);
            }

            LinkEvent::ChannelMessage { peer_id, data } => {
                self.on_channel_message(&peer_id, &data);
            }
        }
    }

    fn on_channel_message(&mut self, peer_id: &str, data: &[u8]) {
        let message: ChannelMessage = match serde_json::from_slice(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer_id = peer_id, error = %e, "Undecodable channel frame");
                return;
            }
        };

        match message {
            ChannelMessage::Chat {
                id,
                sender_name,
                content,
                timestamp,
                ..
            } => {
                self.emit(ClientEvent::ChatReceived {
                    peer_id: peer_id.to_string(),
                    id,
                    sender_name,
                    content,
                    timestamp,
                });
            }
            ChannelMessage::FileStart { metadata } => {
                self.transfers.on_file_start(peer_id, &metadata);
            }
            ChannelMessage::Chunk {
                file_id,
                index,
                data,
            } => {
                self.transfers.on_chunk(peer_id, &file_id, index, &data);
            }
            ChannelMessage::Done { file_id } => {
                self.transfers.on_done(peer_id, &file_id);
            }
        }
    }

    // ── Outbound chat & files ─────────────────────────────────────────────

    /// Send a chat line to every connected peer. Returns the message id.
    pub fn send_chat(&self, content: impl Into<String>) -> Result<String> {
        let local_id = self.local_id.clone().ok_or(Error::NotJoined)?;
        let message_id = Uuid::new_v4().to_string();
        let message = ChannelMessage::Chat {
            id: message_id.clone(),
            sender_id: local_id,
            sender_name: self.username.clone(),
            content: content.into(),
            timestamp: crate::time::now_timestamp_millis(),
        };
        let frame = serde_json::to_vec(&message)?;

        for entry in self.peers.values() {
            if let Some(channel) = &entry.channel {
                if channel.is_writable() {
                    // Best-effort fan-out; a dead channel surfaces through
                    // link state, not here.
                    let _ = channel.send(&frame);
                }
            }
        }

        Ok(message_id)
    }

    /// Send a file to one peer, or to every connected peer when `target` is
    /// `None`. Each recipient gets its own paced transfer session; returns
    /// the transfer ids.
    pub fn send_file(
        &self,
        filename: impl Into<String>,
        mime: impl Into<String>,
        data: Vec<u8>,
        target: Option<&str>,
    ) -> Result<Vec<String>> {
        let local_id = self.local_id.clone().ok_or(Error::NotJoined)?;
        let filename = filename.into();
        let mime = mime.into();

        let targets: Vec<(String, Arc<dyn DataChannel>)> = match target {
            Some(peer_id) => {
                let channel = self
                    .peers
                    .get(peer_id)
                    .and_then(|p| p.channel.clone())
                    .filter(|c| c.is_writable())
                    .ok_or_else(|| {
                        Error::Channel(format!("no open channel to peer {peer_id}"))
                    })?;
                vec![(peer_id.to_string(), channel)]
            }
            None => self
                .peers
                .iter()
                .filter_map(|(id, p)| {
                    p.channel
                        .clone()
                        .filter(|c| c.is_writable())
                        .map(|c| (id.clone(), c))
                })
                .collect(),
        };

        let mut transfer_ids = Vec::with_capacity(targets.len());
        for (peer_id, channel) in targets {
            let metadata = FileMetadata {
                id: Uuid::new_v4().to_string(),
                filename: filename.clone(),
                size: data.len() as u64,
                mime: mime.clone(),
                sender_id: local_id.clone(),
                sender_name: self.username.clone(),
            };
            transfer_ids.push(metadata.id.clone());

            self.transfers.begin_send(&metadata, &peer_id);
            tokio::spawn(
                self.transfers
                    .clone()
                    .run_send(metadata, channel, data.clone()),
            );
        }

        Ok(transfer_ids)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConnectionState;
    use crate::transfer::{TransferStatus, REASON_PEER_DISCONNECTED};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockLink {
        peer_id: String,
        local_descriptions: Mutex<Vec<serde_json::Value>>,
        remote_descriptions: Mutex<Vec<serde_json::Value>>,
        remote_candidates: Mutex<Vec<serde_json::Value>>,
        channels_requested: Mutex<Vec<String>>,
        closed: AtomicBool,
        reject_remote_description: AtomicBool,
    }

    impl MockLink {
        fn new(peer_id: &str) -> Self {
            Self {
                peer_id: peer_id.to_string(),
                local_descriptions: Mutex::new(Vec::new()),
                remote_descriptions: Mutex::new(Vec::new()),
                remote_candidates: Mutex::new(Vec::new()),
                channels_requested: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                reject_remote_description: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PeerLink for MockLink {
        async fn create_offer(&self) -> crate::error::Result<serde_json::Value> {
            Ok(json!({"kind": "offer", "for": self.peer_id}))
        }

        async fn create_answer(&self) -> crate::error::Result<serde_json::Value> {
            Ok(json!({"kind": "answer", "for": self.peer_id}))
        }

        async fn set_local_description(
            &self,
            description: &serde_json::Value,
        ) -> crate::error::Result<()> {
            self.local_descriptions.lock().unwrap().push(description.clone());
            Ok(())
        }

        async fn set_remote_description(
            &self,
            description: &serde_json::Value,
        ) -> crate::error::Result<()> {
            if self.reject_remote_description.load(Ordering::SeqCst) {
                return Err(Error::Link("rejected".to_string()));
            }
            self.remote_descriptions.lock().unwrap().push(description.clone());
            Ok(())
        }

        async fn add_remote_candidate(
            &self,
            candidate: &serde_json::Value,
        ) -> crate::error::Result<()> {
            self.remote_candidates.lock().unwrap().push(candidate.clone());
            Ok(())
        }

        async fn open_channel(&self, label: &str) -> crate::error::Result<()> {
            self.channels_requested.lock().unwrap().push(label.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockFactory {
        links: Mutex<HashMap<String, Arc<MockLink>>>,
    }

    impl MockFactory {
        fn link(&self, peer_id: &str) -> Arc<MockLink> {
            self.links.lock().unwrap().get(peer_id).unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerLinkFactory for MockFactory {
        async fn create_link(
            &self,
            peer_id: &str,
            _events: mpsc::UnboundedSender<LinkEvent>,
        ) -> crate::error::Result<Arc<dyn PeerLink>> {
            let link = Arc::new(MockLink::new(peer_id));
            self.links
                .lock()
                .unwrap()
                .insert(peer_id.to_string(), link.clone());
            Ok(link)
        }
    }

    #[derive(Default)]
    struct MockSink {
        sent: Mutex<Vec<SignalMessage>>,
    }

    impl MockSink {
        fn sent(&self) -> Vec<SignalMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignalingSink for MockSink {
        async fn send(&self, message: SignalMessage) -> crate::error::Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct MockChannel {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl DataChannel for MockChannel {
        fn send(&self, data: &[u8]) -> crate::error::Result<()> {
            self.frames.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn is_writable(&self) -> bool {
            true
        }
    }

    struct Harness {
        client: RoomClient,
        factory: Arc<MockFactory>,
        sink: Arc<MockSink>,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        _link_events: mpsc::UnboundedReceiver<LinkEvent>,
    }

    fn harness() -> Harness {
        let factory = Arc::new(MockFactory::default());
        let sink = Arc::new(MockSink::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (client, link_events) = RoomClient::new(
            "room-1",
            Some("alice".to_string()),
            factory.clone(),
            sink.clone(),
            events_tx,
        );
        Harness {
            client,
            factory,
            sink,
            events,
            _link_events: link_events,
        }
    }

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            username: None,
            joined_at: 1_700_000_000_000,
        }
    }

    fn peer_list(target: &str, peers: Vec<PeerInfo>) -> SignalMessage {
        SignalMessage::PeerList {
            room_id: "room-1".to_string(),
            sender_id: "server".to_string(),
            target_id: Some(target.to_string()),
            payload: peers,
        }
    }

    #[tokio::test]
    async fn test_peer_list_receiver_initiates_to_every_listed_peer() {
        let mut h = harness();
        h.client
            .handle_signal(peer_list("me", vec![peer("p1"), peer("p2")]))
            .await;

        assert_eq!(h.client.local_id(), Some("me"));
        assert_eq!(h.client.link_state("p1"), Some(LinkState::LocalOfferSent));
        assert_eq!(h.client.link_state("p2"), Some(LinkState::LocalOfferSent));

        let offers: Vec<_> = h
            .sink
            .sent()
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::Offer { .. }))
            .collect();
        assert_eq!(offers.len(), 2);

        // The data channel is requested by the initiator.
        assert_eq!(
            *h.factory.link("p1").channels_requested.lock().unwrap(),
            vec![CHANNEL_LABEL.to_string()]
        );
    }

    #[tokio::test]
    async fn test_peer_joined_observer_does_not_initiate() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![])).await;
        h.client
            .handle_signal(SignalMessage::PeerJoined {
                room_id: "room-1".to_string(),
                sender_id: "server".to_string(),
                payload: peer("p1"),
            })
            .await;

        assert_eq!(h.client.link_state("p1"), Some(LinkState::Idle));
        assert!(h
            .sink
            .sent()
            .iter()
            .all(|m| !matches!(m, SignalMessage::Offer { .. })));
    }

    #[tokio::test]
    async fn test_remote_offer_is_answered() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![])).await;
        h.client
            .handle_signal(SignalMessage::Offer {
                room_id: Some("room-1".to_string()),
                sender_id: Some("p1".to_string()),
                target_id: Some("me".to_string()),
                payload: json!({"kind": "offer"}),
            })
            .await;

        assert_eq!(h.client.link_state("p1"), Some(LinkState::AnswerSent));
        let link = h.factory.link("p1");
        assert_eq!(link.remote_descriptions.lock().unwrap().len(), 1);
        assert!(h
            .sink
            .sent()
            .iter()
            .any(|m| matches!(m, SignalMessage::Answer { .. })));
    }

    #[tokio::test]
    async fn test_answer_completes_local_offer() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![peer("p1")])).await;
        h.client
            .handle_signal(SignalMessage::Answer {
                room_id: Some("room-1".to_string()),
                sender_id: Some("p1".to_string()),
                target_id: Some("me".to_string()),
                payload: json!({"kind": "answer"}),
            })
            .await;

        assert_eq!(h.client.link_state("p1"), Some(LinkState::Stable));
        assert_eq!(
            h.factory.link("p1").remote_descriptions.lock().unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stale_answer_is_ignored() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![peer("p1")])).await;

        let answer = SignalMessage::Answer {
            room_id: Some("room-1".to_string()),
            sender_id: Some("p1".to_string()),
            target_id: Some("me".to_string()),
            payload: json!({"kind": "answer"}),
        };
        h.client.handle_signal(answer.clone()).await;
        assert_eq!(h.client.link_state("p1"), Some(LinkState::Stable));

        // A duplicate answer in Stable state must not re-apply anything.
        h.client.handle_signal(answer).await;
        assert_eq!(
            h.factory.link("p1").remote_descriptions.lock().unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![peer("p1")])).await;

        // Candidates before the answer: buffered, not applied.
        for i in 0..3 {
            h.client
                .handle_signal(SignalMessage::Candidate {
                    room_id: Some("room-1".to_string()),
                    sender_id: Some("p1".to_string()),
                    target_id: Some("me".to_string()),
                    payload: json!({"candidate": i}),
                })
                .await;
        }
        let link = h.factory.link("p1");
        assert!(link.remote_candidates.lock().unwrap().is_empty());

        h.client
            .handle_signal(SignalMessage::Answer {
                room_id: Some("room-1".to_string()),
                sender_id: Some("p1".to_string()),
                target_id: Some("me".to_string()),
                payload: json!({"kind": "answer"}),
            })
            .await;
        assert_eq!(link.remote_candidates.lock().unwrap().len(), 3);

        // After the remote description is set, candidates apply immediately.
        h.client
            .handle_signal(SignalMessage::Candidate {
                room_id: Some("room-1".to_string()),
                sender_id: Some("p1".to_string()),
                target_id: Some("me".to_string()),
                payload: json!({"candidate": 99}),
            })
            .await;
        assert_eq!(link.remote_candidates.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_candidate_without_link_is_dropped() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![])).await;
        h.client
            .handle_signal(SignalMessage::Candidate {
                room_id: Some("room-1".to_string()),
                sender_id: Some("ghost".to_string()),
                target_id: Some("me".to_string()),
                payload: json!({"candidate": 0}),
            })
            .await;

        assert!(h.client.link_state("ghost").is_none());
    }

    #[tokio::test]
    async fn test_rejected_offer_leaves_link_broken_not_torn_down() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![])).await;

        // Pre-create the entry via peer-joined so the factory-made link can
        // be configured to reject before the offer lands.
        h.client
            .handle_signal(SignalMessage::PeerJoined {
                room_id: "room-1".to_string(),
                sender_id: "server".to_string(),
                payload: peer("p1"),
            })
            .await;
        h.client
            .handle_signal(SignalMessage::Offer {
                room_id: Some("room-1".to_string()),
                sender_id: Some("p1".to_string()),
                target_id: Some("me".to_string()),
                payload: json!({"kind": "offer"}),
            })
            .await;
        // First offer succeeds; now reject a glare re-offer.
        let link = h.factory.link("p1");
        link.reject_remote_description.store(true, Ordering::SeqCst);
        h.client
            .handle_signal(SignalMessage::Offer {
                room_id: Some("room-1".to_string()),
                sender_id: Some("p1".to_string()),
                target_id: Some("me".to_string()),
                payload: json!({"kind": "offer-again"}),
            })
            .await;

        // Broken, but the peer stays listed.
        assert_eq!(h.client.link_state("p1"), Some(LinkState::Broken));
    }

    #[tokio::test]
    async fn test_peer_left_tears_down_and_fails_transfers() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![peer("p1")])).await;

        // An in-flight inbound transfer from p1.
        h.client
            .handle_link_event(LinkEvent::ChannelMessage {
                peer_id: "p1".to_string(),
                data: serde_json::to_vec(&ChannelMessage::FileStart {
                    metadata: FileMetadata {
                        id: "tx-1".to_string(),
                        filename: "notes.txt".to_string(),
                        size: 8,
                        mime: "text/plain".to_string(),
                        sender_id: "p1".to_string(),
                        sender_name: None,
                    },
                })
                .unwrap(),
            })
            .await;

        h.client
            .handle_signal(SignalMessage::PeerLeft {
                room_id: "room-1".to_string(),
                sender_id: "server".to_string(),
                payload: crate::signaling::PeerLeftPayload {
                    peer_id: "p1".to_string(),
                },
            })
            .await;

        assert!(h.client.link_state("p1").is_none());
        assert!(h.factory.link("p1").closed.load(Ordering::SeqCst));
        assert_eq!(
            h.client.transfers().session("tx-1").unwrap().status,
            TransferStatus::Failed {
                reason: REASON_PEER_DISCONNECTED.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_link_down_fails_transfers_for_that_peer() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![peer("p1")])).await;
        h.client
            .handle_link_event(LinkEvent::ChannelMessage {
                peer_id: "p1".to_string(),
                data: serde_json::to_vec(&ChannelMessage::FileStart {
                    metadata: FileMetadata {
                        id: "tx-2".to_string(),
                        filename: "a".to_string(),
                        size: 4,
                        mime: "application/octet-stream".to_string(),
                        sender_id: "p1".to_string(),
                        sender_name: None,
                    },
                })
                .unwrap(),
            })
            .await;

        h.client
            .handle_link_event(LinkEvent::StateChanged {
                peer_id: "p1".to_string(),
                state: LinkConnectionState::Failed,
            })
            .await;

        assert_eq!(h.client.link_state("p1"), Some(LinkState::Broken));
        assert!(matches!(
            h.client.transfers().session("tx-2").unwrap().status,
            TransferStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_local_candidates_buffer_until_local_description() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![])).await;
        h.client
            .handle_signal(SignalMessage::PeerJoined {
                room_id: "room-1".to_string(),
                sender_id: "server".to_string(),
                payload: peer("p1"),
            })
            .await;

        // We are the non-initiator: no local description yet. A gathered
        // candidate must wait, not hit the wire.
        h.client
            .handle_link_event(LinkEvent::CandidateGathered {
                peer_id: "p1".to_string(),
                candidate: json!({"candidate": "local-1"}),
            })
            .await;
        assert!(h
            .sink
            .sent()
            .iter()
            .all(|m| !matches!(m, SignalMessage::Candidate { .. })));

        // Answering the remote offer sets the local description, which
        // flushes the queued candidate.
        h.client
            .handle_signal(SignalMessage::Offer {
                room_id: Some("room-1".to_string()),
                sender_id: Some("p1".to_string()),
                target_id: Some("me".to_string()),
                payload: json!({"kind": "offer"}),
            })
            .await;

        let candidates: Vec<_> = h
            .sink
            .sent()
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::Candidate { .. }))
            .collect();
        assert_eq!(candidates.len(), 1);
        match &candidates[0] {
            SignalMessage::Candidate {
                target_id, payload, ..
            } => {
                assert_eq!(target_id.as_deref(), Some("p1"));
                assert_eq!(payload["candidate"], "local-1");
            }
            _ => unreachable!(),
        }

        // Candidates gathered after the flush go straight out.
        h.client
            .handle_link_event(LinkEvent::CandidateGathered {
                peer_id: "p1".to_string(),
                candidate: json!({"candidate": "local-2"}),
            })
            .await;
        let candidates = h
            .sink
            .sent()
            .into_iter()
            .filter(|m| matches!(m, SignalMessage::Candidate { .. }))
            .count();
        assert_eq!(candidates, 2);
    }

    #[tokio::test]
    async fn test_ping_is_acknowledged_with_pong() {
        let mut h = harness();
        h.client.handle_signal(SignalMessage::Ping).await;
        assert!(h
            .sink
            .sent()
            .iter()
            .any(|m| matches!(m, SignalMessage::Pong)));
    }

    #[tokio::test]
    async fn test_chat_fans_out_to_open_channels() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![peer("p1")])).await;

        let channel = Arc::new(MockChannel::default());
        h.client
            .handle_link_event(LinkEvent::ChannelOpen {
                peer_id: "p1".to_string(),
                channel: channel.clone(),
            })
            .await;

        h.client.send_chat("hello room").unwrap();

        let frames = channel.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let message: ChannelMessage = serde_json::from_slice(&frames[0]).unwrap();
        match message {
            ChannelMessage::Chat {
                content, sender_id, ..
            } => {
                assert_eq!(content, "hello room");
                assert_eq!(sender_id, "me");
            }
            _ => panic!("wrong frame"),
        }
    }

    #[tokio::test]
    async fn test_chat_before_join_fails() {
        let h = harness();
        assert!(matches!(
            h.client.send_chat("too early"),
            Err(Error::NotJoined)
        ));
    }

    #[tokio::test]
    async fn test_incoming_chat_surfaces_as_event() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![peer("p1")])).await;
        h.client
            .handle_link_event(LinkEvent::ChannelMessage {
                peer_id: "p1".to_string(),
                data: serde_json::to_vec(&ChannelMessage::Chat {
                    id: "m-1".to_string(),
                    sender_id: "p1".to_string(),
                    sender_name: Some("bob".to_string()),
                    content: "hi".to_string(),
                    timestamp: 1_700_000_000_000,
                })
                .unwrap(),
            })
            .await;

        let mut saw_chat = false;
        while let Ok(event) = h.events.try_recv() {
            if let ClientEvent::ChatReceived { content, .. } = event {
                assert_eq!(content, "hi");
                saw_chat = true;
            }
        }
        assert!(saw_chat);
    }

    #[tokio::test]
    async fn test_send_file_requires_open_channel() {
        let mut h = harness();
        h.client.handle_signal(peer_list("me", vec![peer("p1")])).await;

        // Channel not open yet.
        assert!(h
            .client
            .send_file("notes.txt", "text/plain", vec![1, 2, 3], Some("p1"))
            .is_err());

        let channel = Arc::new(MockChannel::default());
        h.client
            .handle_link_event(LinkEvent::ChannelOpen {
                peer_id: "p1".to_string(),
                channel,
            })
            .await;

        let ids = h
            .client
            .send_file("notes.txt", "text/plain", vec![1, 2, 3], Some("p1"))
            .unwrap();
        assert_eq!(ids.len(), 1);
    }
}
