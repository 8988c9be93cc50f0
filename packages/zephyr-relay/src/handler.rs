//! WebSocket connection handler.
//!
//! One handler per client socket, running a small protocol state machine:
//!
//! ```text
//!   Connected (no room) ──join──► InRoom(room_id) ──leave/close──► Closed
//! ```
//!
//! The handler parses signaling envelopes, applies room-membership changes
//! through [`RelayState`], and relays targeted offer/answer/candidate
//! messages with the sender id re-stamped from the connection — a
//! client-supplied sender id is never trusted. Payloads are opaque and pass
//! through unmodified.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use zephyr_core::signaling::{
    self, ErrorCode, PeerLeftPayload, SignalMessage, SERVER_SENDER,
};

use crate::state::{ClientSender, Member, RelayState};

/// Handle a single WebSocket connection for its whole lifetime.
///
/// 1. Assign a peer id and register the connection
/// 2. Spawn a sender task to forward outbound envelopes
/// 3. Process incoming messages until close, error, or eviction
/// 4. Run the leave path (shared with explicit `leave`) and unregister
pub async fn handle_websocket(socket: WebSocket, state: RelayState) {
    let peer_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();
    let entry = state.register_connection(&peer_id, tx.clone());
    let shutdown = entry.shutdown.clone();

    // ── Sender Task ───────────────────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize signaling message");
                }
            }
        }
    });

    // ── Receive Loop ──────────────────────────────────────────────────────

    let mut current_room: Option<String> = None;

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::warn!(
                    peer_id = peer_id.as_str(),
                    "Connection evicted by liveness supervisor"
                );
                break;
            }

            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match signaling::parse(&text) {
                        Ok(message) => {
                            handle_message(&state, &peer_id, &mut current_room, &tx, message);
                        }
                        Err(code) => {
                            tracing::warn!(
                                peer_id = peer_id.as_str(),
                                code = ?code,
                                "Rejected inbound frame"
                            );
                            let _ = tx.send(SignalMessage::error(code));
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(peer_id = peer_id.as_str(), "Client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {} // Binary / protocol-level ping+pong — ignore
                    Some(Err(e)) => {
                        tracing::warn!(
                            peer_id = peer_id.as_str(),
                            error = %e,
                            "WebSocket error"
                        );
                        break;
                    }
                }
            }
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────
    // Transport close, protocol error, and eviction all funnel through the
    // same leave path an explicit `leave` uses.

    if let Some(room_id) = current_room.take() {
        leave_room(&state, &room_id, &peer_id);
    }
    state.unregister_connection(&peer_id);
    sender_task.abort();
    tracing::info!(peer_id = peer_id.as_str(), "Connection closed");
}

/// Apply one parsed envelope against the registry. Synchronous: every
/// outbound delivery is an opportunistic unbounded-channel push.
pub(crate) fn handle_message(
    state: &RelayState,
    peer_id: &str,
    current_room: &mut Option<String>,
    tx: &ClientSender,
    message: SignalMessage,
) {
    match message {
        SignalMessage::Join { room_id, payload } => {
            // A re-join replaces the previous membership.
            if let Some(old_room) = current_room.take() {
                leave_room(state, &old_room, peer_id);
            }

            let member = Member {
                id: peer_id.to_string(),
                username: payload.username,
                joined_at: Utc::now(),
                sender: tx.clone(),
            };
            let joined = member.info();
            let existing = state.join(&room_id, member);

            // Order matters: announce the joiner to the room first, then
            // hand the joiner its snapshot. The snapshot excludes the joiner
            // and the broadcast excludes it too, so it never learns about
            // itself twice.
            state.broadcast(
                &room_id,
                &SignalMessage::PeerJoined {
                    room_id: room_id.clone(),
                    sender_id: SERVER_SENDER.to_string(),
                    payload: joined,
                },
                Some(peer_id),
            );

            let _ = tx.send(SignalMessage::PeerList {
                room_id: room_id.clone(),
                sender_id: SERVER_SENDER.to_string(),
                // The joiner learns its own server-assigned id here.
                target_id: Some(peer_id.to_string()),
                payload: existing,
            });

            *current_room = Some(room_id);
        }

        SignalMessage::Leave { .. } => {
            // A leave without a membership is a no-op.
            if let Some(room_id) = current_room.take() {
                leave_room(state, &room_id, peer_id);
            }
        }

        SignalMessage::Offer {
            target_id, payload, ..
        } => {
            relay_targeted(state, peer_id, current_room, tx, target_id, |room, sender, target| {
                SignalMessage::Offer {
                    room_id: Some(room),
                    sender_id: Some(sender),
                    target_id: Some(target),
                    payload,
                }
            });
        }

        SignalMessage::Answer {
            target_id, payload, ..
        } => {
            relay_targeted(state, peer_id, current_room, tx, target_id, |room, sender, target| {
                SignalMessage::Answer {
                    room_id: Some(room),
                    sender_id: Some(sender),
                    target_id: Some(target),
                    payload,
                }
            });
        }

        SignalMessage::Candidate {
            target_id, payload, ..
        } => {
            relay_targeted(state, peer_id, current_room, tx, target_id, |room, sender, target| {
                SignalMessage::Candidate {
                    room_id: Some(room),
                    sender_id: Some(sender),
                    target_id: Some(target),
                    payload,
                }
            });
        }

        SignalMessage::Pong => {
            state.mark_alive(peer_id);
        }

        SignalMessage::Ping => {
            // Client-initiated keepalive.
            let _ = tx.send(SignalMessage::Pong);
        }

        // Server-originated tags are not valid client input.
        SignalMessage::PeerList { .. }
        | SignalMessage::PeerJoined { .. }
        | SignalMessage::PeerLeft { .. }
        | SignalMessage::Error { .. } => {
            let _ = tx.send(SignalMessage::error(ErrorCode::InvalidMessage));
        }
    }
}

/// Relay an offer/answer/candidate to its target, re-stamping the sender id
/// and the room from the authenticated connection.
fn relay_targeted(
    state: &RelayState,
    peer_id: &str,
    current_room: &Option<String>,
    tx: &ClientSender,
    target_id: Option<String>,
    build: impl FnOnce(String, String, String) -> SignalMessage,
) {
    let Some(target_id) = target_id else {
        let _ = tx.send(SignalMessage::error(ErrorCode::MissingTarget));
        return;
    };

    // No membership means the target cannot exist for this sender.
    let Some(room_id) = current_room.as_deref() else {
        let _ = tx.send(SignalMessage::error(ErrorCode::PeerNotFound));
        return;
    };

    let message = build(
        room_id.to_string(),
        peer_id.to_string(),
        target_id.clone(),
    );
    if !state.send_to(room_id, &target_id, message) {
        let _ = tx.send(SignalMessage::error(ErrorCode::PeerNotFound));
    }
}

/// The shared leave path: remove the membership and tell the remaining
/// members. Used by explicit `leave`, transport close, and eviction alike.
pub(crate) fn leave_room(state: &RelayState, room_id: &str, peer_id: &str) {
    if state.leave(room_id, peer_id) {
        state.broadcast(
            room_id,
            &SignalMessage::PeerLeft {
                room_id: room_id.to_string(),
                sender_id: SERVER_SENDER.to_string(),
                payload: PeerLeftPayload {
                    peer_id: peer_id.to_string(),
                },
            },
            None,
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
