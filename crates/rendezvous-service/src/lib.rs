//! Rendezvous Service Library
//!
//! Session orchestration core for anonymous one-to-one pairing:
//!
//! - Live connection registry with room membership and targeted delivery
//! - FIFO matching queue with compatibility rules for chat and voice searches
//! - Countdown and continuation votes that decide whether a room survives
//! - Voice-call signaling (ring, accept, offer/answer/ICE relay, hangup)
//! - In-room chat messages, typing indicators and reveal likes
//!
//! # Architecture
//!
//! ```text
//! WebSocket (dispatch::ws)
//! └── dispatch ── routes one ClientEvent per frame
//!     └── SessionHub (single owner of cross-component lifecycles)
//!         ├── MatchingQueue
//!         ├── Negotiator (one task per room countdown)
//!         ├── CallCoordinator (phase timers per call)
//!         ├── ChatService
//!         └── ConnectionRegistry (ClientChannel per connection)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One convergent room teardown**: every path that ends a room calls
//!   `SessionHub::end_room`, which is idempotent via a conditional store update
//! - **Timers post events**: countdown and call timers never mutate state
//!   directly, the hub re-checks the current phase before acting
//! - **Persistence behind a trait**: [`store::Store`] is the only seam to the
//!   durable layer; [`store::MemoryStore`] backs tests and single-node runs
//!
//! # Modules
//!
//! - [`registry`] - Connection registry and client channels
//! - [`matching`] - Search queue and pairing
//! - [`negotiation`] - Countdown and continuation votes
//! - [`calls`] - Voice-call signaling
//! - [`hub`] - Orchestration across components
//! - [`dispatch`] - Client event routing and WebSocket transport
//! - [`errors`] - Error types with client-facing codes

pub mod auth;
pub mod calls;
pub mod chat;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod hub;
pub mod matching;
pub mod models;
pub mod negotiation;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod timers;
