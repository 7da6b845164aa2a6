//! A running session hub for integration tests.

use common::types::RoomId;
use rendezvous_service::auth::JwtAuthenticator;
use rendezvous_service::config::SessionConfig;
use rendezvous_service::dispatch::ws::WsState;
use rendezvous_service::hub::SessionHub;
use rendezvous_service::models::{EntryMode, MatchPreference, UserRecord};
use rendezvous_service::protocol::{ClientEvent, ServerEvent};
use rendezvous_service::store::{MemoryStore, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::TestClient;
use crate::fixtures::TestUser;
use crate::tokens::TestTokens;

/// Timings short enough for real-clock tests. Automatic voice calls are off
/// so tests that need a call start it explicitly.
#[must_use]
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        search_ticket_ttl: Duration::from_secs(5),
        expiry_sweep_interval: Duration::from_secs(1),
        match_followup_delay: Duration::from_millis(10),
        auto_call_on_voice_match: false,
        default_countdown: Duration::from_secs(1),
        countdown_retry_delay: Duration::from_millis(50),
        countdown_max_start_retries: 3,
        notification_timeout: Duration::from_secs(1),
        ring_timeout: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(1),
        relay_send_timeout: Duration::from_millis(200),
        relay_retry_backoff: Duration::from_millis(10),
        ..SessionConfig::default()
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub hub: Arc<SessionHub>,
    pub tokens: TestTokens,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHarness {
    /// Hub with [`fast_config`]. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    #[must_use]
    pub fn with_config(config: SessionConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let cancel_token = CancellationToken::new();
        let (hub, timer_rx) = SessionHub::new(
            Arc::clone(&store) as Arc<dyn Store>,
            config,
            cancel_token.child_token(),
        );
        let tasks = hub.start(timer_rx);
        Self {
            store,
            hub,
            tokens: TestTokens::default(),
            cancel_token,
            tasks,
        }
    }

    pub fn user(&self, username: &str) -> UserRecord {
        TestUser::new(username).insert(&self.store)
    }

    pub fn insert(&self, user: TestUser) -> UserRecord {
        user.insert(&self.store)
    }

    /// Connect `user` and consume the `connection` welcome.
    pub async fn client(&self, user: &UserRecord) -> TestClient {
        let mut client = TestClient::connect(&self.hub, user);
        client
            .expect(|e| matches!(e, ServerEvent::Connection { .. }))
            .await;
        client
    }

    /// Two connected users matched in `mode` and joined to their room.
    pub async fn paired(&self, mode: EntryMode) -> (TestClient, TestClient, RoomId) {
        let alice = self.user("alice");
        let bob = self.user("bob");
        let mut a = self.client(&alice).await;
        let mut b = self.client(&bob).await;

        for client in [&mut a, &mut b] {
            client
                .send(ClientEvent::Search {
                    mode,
                    preference: MatchPreference::SameMode,
                })
                .await;
        }

        let room_id = match a
            .expect(|e| matches!(e, ServerEvent::MatchFound { .. }))
            .await
        {
            ServerEvent::MatchFound { room_id, .. } => room_id,
            other => panic!("expected match_found, got {}", other.kind()),
        };
        b.expect(|e| matches!(e, ServerEvent::MatchFound { room_id: r, .. } if *r == room_id))
            .await;

        for client in [&mut a, &mut b] {
            client.send(ClientEvent::JoinRoom { room_id }).await;
            client
                .expect(|e| matches!(e, ServerEvent::RoomJoined { .. }))
                .await;
        }
        (a, b, room_id)
    }

    /// Transport state wired to this hub with a JWT authenticator.
    #[must_use]
    pub fn ws_state(&self) -> WsState {
        WsState {
            hub: Arc::clone(&self.hub),
            authenticator: Arc::new(JwtAuthenticator::new(self.tokens.secret())),
        }
    }

    /// Cancel the hub and wait for its background tasks.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        for task in self.tasks {
            task.await.expect("hub task panicked");
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
