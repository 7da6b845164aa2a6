//! # Rendezvous Test Utilities
//!
//! Shared test utilities for the rendezvous service.
//!
//! ## Modules
//!
//! - `fixtures` - User records with preferences and bans
//! - `tokens` - Session token minting
//! - `client` - In-process client that dispatches events and asserts on replies
//! - `harness` - A running hub over `MemoryStore` with fast timings
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rendezvous_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     let (mut alice, mut bob, room_id) = harness.paired(EntryMode::Chat).await;
//!
//!     alice.send(ClientEvent::Message { content: "hi".into() }).await;
//!     bob.expect(|e| matches!(e, ServerEvent::Message { .. })).await;
//! }
//! ```

pub mod client;
pub mod fixtures;
pub mod harness;
pub mod tokens;

pub use client::*;
pub use fixtures::*;
pub use harness::*;
pub use tokens::*;
