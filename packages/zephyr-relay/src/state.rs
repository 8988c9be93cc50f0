//! Server state management.
//!
//! Tracks open connections and room membership. All structures are
//! concurrent (DashMap) so connection handlers, the liveness supervisor, and
//! the sweep task operate on shared state without a global lock. The
//! registry owns only references to connections — a member's channel handle
//! is dropped on leave, never closed; socket lifetime belongs to its handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};

use zephyr_core::signaling::{PeerInfo, SignalMessage};

/// Maximum age of an empty room before the sweep removes it.
pub const DEFAULT_ROOM_MAX_AGE_HOURS: i64 = 24;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Liveness probe interval in seconds.
    pub probe_interval_secs: u64,
    /// Stale-room sweep interval in seconds.
    pub sweep_interval_secs: u64,
    /// Age after which an empty room is swept.
    pub room_max_age_hours: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            probe_interval_secs: 30,
            sweep_interval_secs: 3600,
            room_max_age_hours: DEFAULT_ROOM_MAX_AGE_HOURS,
        }
    }
}

/// A connected client's outbound channel.
pub type ClientSender = mpsc::UnboundedSender<SignalMessage>;

/// A member of a room. Holds a clone of the connection's sender — a lookup
/// handle, not ownership.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: String,
    pub username: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub sender: ClientSender,
}

impl Member {
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            username: self.username.clone(),
            joined_at: self.joined_at.timestamp_millis(),
        }
    }
}

/// A named room and its members. Insertion order is irrelevant.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub members: HashMap<String, Member>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            members: HashMap::new(),
        }
    }
}

/// Per-socket bookkeeping for every open connection, in a room or not.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub sender: ClientSender,
    /// Liveness flag: set by a `pong`, cleared when a probe goes out.
    pub alive: Arc<AtomicBool>,
    /// Signaled by the supervisor to evict the connection; the handler's
    /// normal close path then runs the same cleanup as an explicit leave.
    pub shutdown: Arc<Notify>,
}

/// Shared relay state.
#[derive(Clone)]
pub struct RelayState {
    /// Room id → room. Rooms are created on first join (or explicit
    /// creation) and removed when their last member leaves.
    pub rooms: Arc<DashMap<String, Room>>,

    /// Peer id → connection bookkeeping for every open socket.
    pub connections: Arc<DashMap<String, ConnectionEntry>>,

    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            config,
        }
    }

    // ── Connection Management ─────────────────────────────────────────────

    /// Register an open socket. The entry starts alive.
    pub fn register_connection(&self, peer_id: &str, sender: ClientSender) -> ConnectionEntry {
        let entry = ConnectionEntry {
            sender,
            alive: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        };
        tracing::info!(peer_id = peer_id, "Connection registered");
        self.connections.insert(peer_id.to_string(), entry.clone());
        entry
    }

    /// Drop a closed socket's bookkeeping.
    pub fn unregister_connection(&self, peer_id: &str) {
        tracing::info!(peer_id = peer_id, "Connection unregistered");
        self.connections.remove(peer_id);
    }

    /// Mark a connection alive (a liveness `pong` arrived).
    pub fn mark_alive(&self, peer_id: &str) {
        if let Some(entry) = self.connections.get(peer_id) {
            entry.alive.store(true, Ordering::SeqCst);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ── Room Registry ─────────────────────────────────────────────────────

    /// Create a room if absent. Idempotent — an existing room is untouched.
    /// Returns whether the room was newly created.
    pub fn create_room(&self, room_id: &str) -> bool {
        let mut created = false;
        self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            created = true;
            tracing::info!(room_id = room_id, "Room created");
            Room::new(room_id)
        });
        created
    }

    /// Add a member to a room, creating the room if absent. Returns the
    /// members present before the join — the snapshot for the joiner's
    /// `peer-list`.
    pub fn join(&self, room_id: &str, member: Member) -> Vec<PeerInfo> {
        let mut room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id));

        let existing: Vec<PeerInfo> = room.members.values().map(Member::info).collect();

        tracing::info!(
            room_id = room_id,
            peer_id = member.id.as_str(),
            member_count = room.members.len() + 1,
            "Member joined room"
        );
        room.members.insert(member.id.clone(), member);

        existing
    }

    /// Remove a member from a room; delete the room when it becomes empty.
    /// Returns true if the member was present.
    pub fn leave(&self, room_id: &str, peer_id: &str) -> bool {
        let (removed, now_empty) = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return false;
            };
            let removed = room.members.remove(peer_id).is_some();
            (removed, room.members.is_empty())
        };

        if removed {
            tracing::info!(room_id = room_id, peer_id = peer_id, "Member left room");
        }

        if now_empty {
            self.rooms.remove(room_id);
            tracing::debug!(room_id = room_id, "Removed empty room");
        }

        removed
    }

    /// Deliver a message to every member of a room except `exclude`.
    /// Best-effort fan-out: unwritable channels are skipped, never errored.
    pub fn broadcast(&self, room_id: &str, message: &SignalMessage, exclude: Option<&str>) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };

        for member in room.members.values() {
            if Some(member.id.as_str()) == exclude {
                continue;
            }
            if member.sender.is_closed() {
                continue;
            }
            let _ = member.sender.send(message.clone());
        }
    }

    /// Deliver a message to one member. Returns false when the room or
    /// target does not exist or its channel is not writable.
    pub fn send_to(&self, room_id: &str, target_id: &str, message: SignalMessage) -> bool {
        let Some(room) = self.rooms.get(room_id) else {
            return false;
        };
        let Some(member) = room.members.get(target_id) else {
            return false;
        };
        member.sender.send(message).is_ok()
    }

    /// Remove empty rooms older than `max_age`. Non-empty rooms are never
    /// swept regardless of age. Returns the number of rooms removed.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.rooms.len();

        self.rooms
            .retain(|_, room| !(room.members.is_empty() && room.created_at < cutoff));

        let removed = before - self.rooms.len();
        if removed > 0 {
            tracing::info!(count = removed, "Swept stale empty rooms");
        }
        removed
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total members across all rooms.
    pub fn member_count(&self) -> usize {
        self.rooms.iter().map(|r| r.members.len()).sum()
    }
}
