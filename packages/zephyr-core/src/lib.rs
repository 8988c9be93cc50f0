//! # Zephyr Core
//!
//! Client-side core for room-scoped P2P sharing: peers discover each other
//! through a signaling relay, negotiate direct encrypted links, and exchange
//! chat and chunked file transfers over the established channel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        ZEPHYR CORE MODULES                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌──────────────┐        ┌──────────────┐       ┌──────────────┐    │
//! │  │  signaling   │        │  negotiator  │       │   transfer   │    │
//! │  │              │        │              │       │              │    │
//! │  │ relay wire   │───────►│ per-peer     │──────►│ chunked send │    │
//! │  │ envelope     │        │ state machine│       │ + reassembly │    │
//! │  └──────────────┘        └──────┬───────┘       └──────────────┘    │
//! │                                 │                                   │
//! │                                 ▼                                   │
//! │  ┌──────────────┐        ┌──────────────┐       ┌──────────────┐    │
//! │  │   channel    │        │     link     │       │    events    │    │
//! │  │              │        │              │       │              │    │
//! │  │ data-channel │        │ peer-link    │       │ application  │    │
//! │  │ envelope     │        │ capability   │       │ event stream │    │
//! │  └──────────────┘        └──────────────┘       └──────────────┘    │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `link` module is a seam, not an implementation: NAT traversal, codec
//! negotiation, and encryption belong to whatever backs the traits (a
//! browser's `RTCPeerConnection`, an in-memory fake in tests). This crate
//! owns the parts with real invariants — signaling choreography, candidate
//! queuing, glare avoidance, and the chunk protocol.

pub mod channel;
pub mod error;
pub mod events;
pub mod link;
pub mod negotiator;
pub mod signaling;
pub mod time;
pub mod transfer;

pub use error::{Error, Result};
pub use events::ClientEvent;
pub use negotiator::{LinkState, RoomClient};
pub use signaling::{ErrorCode, PeerInfo, SignalMessage, SERVER_SENDER};
pub use transfer::{TransferEngine, TransferEvent, TransferSession, TransferStatus};
