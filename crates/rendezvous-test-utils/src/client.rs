//! In-process test client.
//!
//! Registers a real [`ClientChannel`] with the hub and routes events through
//! the same dispatcher the WebSocket transport uses, without a socket.

use common::types::{ConnectionId, UserId};
use rendezvous_service::dispatch::{dispatch, dispatch_text, ConnectionContext};
use rendezvous_service::hub::SessionHub;
use rendezvous_service::models::UserRecord;
use rendezvous_service::protocol::{ClientEvent, ServerEvent};
use rendezvous_service::registry::{ChannelReceiver, ClientChannel, Outbound};
use std::sync::Arc;
use std::time::Duration;

/// How long `expect*` waits before failing the test.
pub const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    hub: Arc<SessionHub>,
    ctx: ConnectionContext,
    rx: ChannelReceiver,
}

impl TestClient {
    /// Register a new connection for `user`. The `connection` welcome is
    /// left in the queue.
    pub fn connect(hub: &Arc<SessionHub>, user: &UserRecord) -> Self {
        let (channel, rx) = ClientChannel::new(user.id, hub.cancel_token());
        hub.connect(user, channel.clone());
        Self {
            hub: Arc::clone(hub),
            ctx: ConnectionContext::new(user.clone(), channel),
            rx,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.ctx.user_id()
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.ctx.channel().connection_id()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.ctx.channel().is_alive()
    }

    pub async fn send(&mut self, event: ClientEvent) {
        dispatch(&self.hub, &mut self.ctx, event).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        dispatch_text(&self.hub, &mut self.ctx, text).await;
    }

    /// Everything queued right now. Stops at a close.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        std::iter::from_fn(|| self.rx.try_recv())
            .filter_map(|item| match item {
                Outbound::Event(event) => Some(event),
                Outbound::Close { .. } => None,
            })
            .collect()
    }

    /// Next event, skipping nothing.
    ///
    /// # Panics
    ///
    /// If the channel closes or nothing arrives within [`EXPECT_TIMEOUT`].
    pub async fn next_event(&mut self) -> ServerEvent {
        match tokio::time::timeout(EXPECT_TIMEOUT, self.rx.recv()).await {
            Ok(Some(Outbound::Event(event))) => event,
            Ok(Some(Outbound::Close { reason })) => {
                panic!("user {}: channel closed ({reason})", self.user_id())
            }
            Ok(None) => panic!("user {}: channel already finished", self.user_id()),
            Err(_) => panic!("user {}: no event within {EXPECT_TIMEOUT:?}", self.user_id()),
        }
    }

    /// Skip events until one matches `pred`, and return it.
    ///
    /// # Panics
    ///
    /// If the channel closes first or the wait exceeds [`EXPECT_TIMEOUT`].
    pub async fn expect<F>(&mut self, pred: F) -> ServerEvent
    where
        F: Fn(&ServerEvent) -> bool,
    {
        let user_id = self.user_id();
        let wait = async {
            let mut skipped = Vec::new();
            loop {
                match self.rx.recv().await {
                    Some(Outbound::Event(event)) if pred(&event) => return event,
                    Some(Outbound::Event(event)) => skipped.push(event.kind()),
                    Some(Outbound::Close { reason }) => {
                        panic!("user {user_id}: closed ({reason}) before match; saw {skipped:?}")
                    }
                    None => panic!("user {user_id}: finished before match; saw {skipped:?}"),
                }
            }
        };
        tokio::time::timeout(EXPECT_TIMEOUT, wait)
            .await
            .unwrap_or_else(|_| panic!("user {user_id}: no matching event within {EXPECT_TIMEOUT:?}"))
    }

    /// Wait for an `error` event and return its code.
    pub async fn expect_error(&mut self) -> String {
        match self
            .expect(|e| matches!(e, ServerEvent::Error { .. }))
            .await
        {
            ServerEvent::Error { code, .. } => code,
            other => panic!("expected error, got {}", other.kind()),
        }
    }

    /// Wait for the transport close and return its reason.
    ///
    /// # Panics
    ///
    /// If the channel stays open past [`EXPECT_TIMEOUT`].
    pub async fn expect_closed(&mut self) -> String {
        let user_id = self.user_id();
        let wait = async {
            loop {
                match self.rx.recv().await {
                    Some(Outbound::Event(_)) => {}
                    Some(Outbound::Close { reason }) => return reason,
                    None => return "finished".to_string(),
                }
            }
        };
        tokio::time::timeout(EXPECT_TIMEOUT, wait)
            .await
            .unwrap_or_else(|_| panic!("user {user_id}: channel still open"))
    }

    /// Drop the connection the way the transport does on socket close.
    pub async fn disconnect(self) {
        self.hub
            .disconnect(self.user_id(), self.connection_id())
            .await;
        self.ctx.channel().sever("disconnected");
    }
}
