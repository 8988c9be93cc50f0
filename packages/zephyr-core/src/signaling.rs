//! Relay signaling protocol.
//!
//! One envelope per logical event, JSON-over-WebSocket. Session descriptions
//! and connectivity candidates are opaque to the relay — it forwards them
//! unmodified and never inspects their contents.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        SIGNALING FLOW                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  Peer A                    Relay                    Peer B          │
//! │  ──────                    ─────                    ──────          │
//! │                                                                     │
//! │  join{room} ─────────────►                                          │
//! │             ◄───────────── peer-list (to A only)                    │
//! │                            peer-joined ───────────► (others)        │
//! │                                                                     │
//! │  offer{target:B} ────────►  re-stamp sender ──────►                 │
//! │             ◄──────────────────────────────────────  answer         │
//! │  candidate ──────────────► ◄────────────────────────  candidate     │
//! │                                                                     │
//! │  (chat and file chunks never touch the relay — see `channel`)       │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

/// Sender id stamped on every server-originated message.
pub const SERVER_SENDER: &str = "server";

/// Envelope tags the relay recognizes. Anything else is `UNKNOWN_TYPE`.
const KNOWN_TYPES: &[&str] = &[
    "join",
    "leave",
    "offer",
    "answer",
    "candidate",
    "peer-list",
    "peer-joined",
    "peer-left",
    "error",
    "ping",
    "pong",
];

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A signaling envelope, client↔relay.
///
/// `offer`/`answer`/`candidate` must carry a `target_id`; the relay re-stamps
/// `sender_id` from the authenticated connection, so a client-supplied value
/// is never trusted. `peer-list`/`peer-joined`/`peer-left` are
/// server-originated with `sender_id = "server"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Enter a room, creating it if absent.
    Join {
        room_id: String,
        #[serde(default)]
        payload: JoinPayload,
    },

    /// Leave the current room. A `leave` without a prior `join` is a no-op.
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Session-description offer, relayed verbatim to `target_id`.
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        payload: serde_json::Value,
    },

    /// Session-description answer, relayed verbatim to `target_id`.
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        payload: serde_json::Value,
    },

    /// Connectivity candidate, relayed verbatim to `target_id`.
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        payload: serde_json::Value,
    },

    /// Snapshot of the room's other members, sent only to a freshly joined
    /// peer. `target_id` carries the recipient's own server-assigned peer id
    /// so the client learns its identity from the same message.
    PeerList {
        room_id: String,
        sender_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        payload: Vec<PeerInfo>,
    },

    /// A new member joined the room. Never sent to the member itself — it got
    /// the `peer-list` snapshot instead.
    PeerJoined {
        room_id: String,
        sender_id: String,
        payload: PeerInfo,
    },

    /// A member left the room (explicit leave, transport close, or eviction).
    PeerLeft {
        room_id: String,
        sender_id: String,
        payload: PeerLeftPayload,
    },

    /// Protocol error report. The connection stays open.
    Error { payload: ErrorPayload },

    /// Liveness probe (server → client).
    Ping,

    /// Liveness acknowledgment (client → server).
    Pong,
}

impl SignalMessage {
    /// Build an error envelope from a code, with its canonical message.
    pub fn error(code: ErrorCode) -> Self {
        SignalMessage::Error {
            payload: ErrorPayload {
                message: code.message().to_string(),
                code,
            },
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Payload of a `join` envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// A room member as seen in `peer-list` and `peer-joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Server-assigned peer id, unique per connection.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Unix timestamp (ms) when the peer joined the room.
    pub joined_at: i64,
}

/// Payload of a `peer-left` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLeftPayload {
    pub peer_id: String,
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Protocol error codes. All are recoverable — none closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    MissingTarget,
    PeerNotFound,
    UnknownType,
}

impl ErrorCode {
    /// Canonical human-readable message for the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "Message could not be parsed",
            ErrorCode::MissingTarget => "offer/answer/candidate requires a target_id",
            ErrorCode::PeerNotFound => "Target peer is not present in the room",
            ErrorCode::UnknownType => "Unrecognized message type",
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse an inbound frame, distinguishing malformed JSON / bad fields
/// (`INVALID_MESSAGE`) from a well-formed envelope with an unrecognized tag
/// (`UNKNOWN_TYPE`).
pub fn parse(text: &str) -> Result<SignalMessage, ErrorCode> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ErrorCode::InvalidMessage)?;

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ErrorCode::InvalidMessage)?;

    if !KNOWN_TYPES.contains(&tag) {
        return Err(ErrorCode::UnknownType);
    }

    serde_json::from_value(value).map_err(|_| ErrorCode::InvalidMessage)
}
