//! Dispatcher.
//!
//! Routes one connection's inbound events into the [`SessionHub`]. The only
//! state kept here is per connection: who is connected and which room they
//! joined. Every room-scoped event re-authorizes against the store before it
//! is routed.
//!
//! Failures are answered on the same connection with
//! `error{code, message}` using the client-safe message.

pub mod ws;

use chrono::Utc;
use common::types::{RoomId, UserId};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::calls::Signal;
use crate::errors::SessionError;
use crate::hub::{Closure, SessionHub};
use crate::models::{Room, RoomEndReason, UserRecord};
use crate::observability::metrics;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::ClientChannel;

/// Per-connection state.
#[derive(Debug)]
pub struct ConnectionContext {
    user: UserRecord,
    channel: ClientChannel,
    joined_room: Option<RoomId>,
}

impl ConnectionContext {
    #[must_use]
    pub fn new(user: UserRecord, channel: ClientChannel) -> Self {
        Self {
            user,
            channel,
            joined_room: None,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user.id
    }

    #[must_use]
    pub fn channel(&self) -> &ClientChannel {
        &self.channel
    }

    #[must_use]
    pub fn joined_room(&self) -> Option<RoomId> {
        self.joined_room
    }
}

/// Parse and route one text frame. Errors go back to the client.
pub async fn dispatch_text(hub: &Arc<SessionHub>, ctx: &mut ConnectionContext, text: &str) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => dispatch(hub, ctx, event).await,
        Err(e) => {
            debug!(target: "rv.dispatch", user_id = %ctx.user.id, error = %e, "Malformed client event");
            report(
                ctx,
                &SessionError::Validation("Malformed event".to_string()),
            );
        }
    }
}

/// Route one event. Errors go back to the client.
pub async fn dispatch(hub: &Arc<SessionHub>, ctx: &mut ConnectionContext, event: ClientEvent) {
    let kind = event.kind();
    if let Err(e) = route(hub, ctx, event).await {
        debug!(
            target: "rv.dispatch",
            user_id = %ctx.user.id,
            event = kind,
            error = %e,
            "Event failed"
        );
        report(ctx, &e);
    }
}

fn report(ctx: &ConnectionContext, err: &SessionError) {
    metrics::record_error(err.error_type_label());
    let event = ServerEvent::error(err.error_code(), err.client_message());
    if ctx.channel.deliver(event).is_err() {
        warn!(target: "rv.dispatch", user_id = %ctx.user.id, "Could not deliver error to client");
    }
}

/// The joined room, re-authorized.
async fn current_room(
    hub: &SessionHub,
    ctx: &ConnectionContext,
) -> Result<(UserRecord, Room), SessionError> {
    let room_id = ctx
        .joined_room
        .ok_or_else(|| SessionError::InvalidState("Join a room first".to_string()))?;
    hub.authorize_room(ctx.user.id, room_id).await
}

#[instrument(skip_all, name = "rv.dispatch.event", fields(user_id = %ctx.user.id, event = event.kind()))]
async fn route(
    hub: &Arc<SessionHub>,
    ctx: &mut ConnectionContext,
    event: ClientEvent,
) -> Result<(), SessionError> {
    let user_id = ctx.user.id;
    match event {
        ClientEvent::Heartbeat => {
            ctx.channel
                .deliver(ServerEvent::Heartbeat {
                    timestamp: Utc::now().timestamp_millis(),
                })
                .map_err(|e| SessionError::ChannelClosed(e.to_string()))?;
        }

        ClientEvent::Search { mode, preference } => {
            hub.search(user_id, mode, preference).await?;
        }
        ClientEvent::CancelSearch => {
            hub.cancel_search(user_id).await?;
        }

        ClientEvent::JoinRoom { room_id } => {
            hub.join_room(room_id, &ctx.channel).await?;
            ctx.joined_room = Some(room_id);
        }
        ClientEvent::LeaveRoom => {
            if let Some(room_id) = ctx.joined_room.take() {
                hub.leave_room(room_id, user_id);
            }
        }

        ClientEvent::Message { content } => {
            let (user, room) = current_room(hub, ctx).await?;
            hub.chat().send_message(room.id, &user, &content).await?;
        }
        ClientEvent::Typing => {
            let (user, room) = current_room(hub, ctx).await?;
            hub.chat().typing(&room, &user, true);
        }
        ClientEvent::StopTyping => {
            let (user, room) = current_room(hub, ctx).await?;
            hub.chat().typing(&room, &user, false);
        }
        ClientEvent::LikeResponse { response } => {
            let (_, room) = current_room(hub, ctx).await?;
            hub.chat().like_response(&room, user_id, response).await?;
        }

        ClientEvent::StartCountdown { duration } => {
            let (_, room) = current_room(hub, ctx).await?;
            hub.start_countdown(room.id, duration).await?;
        }
        ClientEvent::ContinuationResponse { response } => {
            let (_, room) = current_room(hub, ctx).await?;
            hub.respond_continuation(room.id, user_id, response).await?;
        }
        ClientEvent::KeepRoom => {
            let (_, room) = current_room(hub, ctx).await?;
            hub.keep_room(room.id, user_id).await?;
        }
        ClientEvent::EndRoom => {
            let (_, room) = current_room(hub, ctx).await?;
            hub.end_room(room.id, Some(user_id), RoomEndReason::UserEnded, Closure::Forced)
                .await?;
            ctx.joined_room = None;
        }

        ClientEvent::VoiceCallInitiate { callee_id } => {
            let (_, room) = current_room(hub, ctx).await?;
            hub.initiate_call(user_id, callee_id, room.id).await?;
        }
        ClientEvent::VoiceCallAccept { call_id } => {
            hub.accept_call(call_id, user_id).await?;
        }
        ClientEvent::VoiceCallReject { call_id, reason } => {
            hub.reject_call(call_id, user_id, reason).await?;
        }
        ClientEvent::VoiceCallEnd { call_id } => {
            hub.end_call(call_id, user_id).await?;
        }
        ClientEvent::WebrtcOffer { call_id, offer } => {
            hub.relay_signal(call_id, user_id, Signal::Offer(offer))
                .await?;
        }
        ClientEvent::WebrtcAnswer { call_id, answer } => {
            hub.relay_signal(call_id, user_id, Signal::Answer(answer))
                .await?;
        }
        ClientEvent::IceCandidate { call_id, candidate } => {
            hub.relay_signal(call_id, user_id, Signal::IceCandidate(candidate))
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::registry::{ChannelReceiver, Outbound};
    use crate::store::{MemoryStore, Store};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Client {
        ctx: ConnectionContext,
        rx: ChannelReceiver,
    }

    impl Client {
        fn events(&mut self) -> Vec<ServerEvent> {
            std::iter::from_fn(|| self.rx.try_recv())
                .filter_map(|item| match item {
                    Outbound::Event(event) => Some(event),
                    Outbound::Close { .. } => None,
                })
                .collect()
        }

        fn error_codes(&mut self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::Error { code, .. } => Some(code),
                    _ => None,
                })
                .collect()
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        hub: Arc<SessionHub>,
        root: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let root = CancellationToken::new();
            let (hub, _timer_rx) = SessionHub::new(
                Arc::clone(&store) as Arc<dyn Store>,
                SessionConfig::default(),
                root.child_token(),
            );
            Self { store, hub, root }
        }

        fn client(&self, username: &str) -> Client {
            let user = self.store.create_user(username);
            let (channel, rx) = ClientChannel::new(user.id, &self.root);
            self.hub.connect(&user, channel.clone());
            Client {
                ctx: ConnectionContext::new(user, channel),
                rx,
            }
        }

        async fn send(&self, client: &mut Client, event: serde_json::Value) {
            dispatch_text(&self.hub, &mut client.ctx, &event.to_string()).await;
        }

        /// Two clients matched and joined into the same room.
        async fn paired(&self) -> (Client, Client, RoomId) {
            let mut a = self.client("alice");
            let mut b = self.client("bob");
            self.send(&mut a, json!({"type": "search"})).await;
            self.send(&mut b, json!({"type": "search"})).await;
            let room_id = a
                .events()
                .into_iter()
                .find_map(|e| match e {
                    ServerEvent::MatchFound { room_id, .. } => Some(room_id),
                    _ => None,
                })
                .expect("match_found");
            self.send(&mut a, json!({"type": "join_room", "room_id": room_id}))
                .await;
            self.send(&mut b, json!({"type": "join_room", "room_id": room_id}))
                .await;
            a.events();
            b.events();
            (a, b, room_id)
        }
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered() {
        let f = Fixture::new();
        let mut a = f.client("alice");
        a.events();

        f.send(&mut a, json!({"type": "heartbeat"})).await;

        assert!(matches!(
            a.events().as_slice(),
            [ServerEvent::Heartbeat { .. }]
        ));
    }

    #[tokio::test]
    async fn test_malformed_event_is_validation_error() {
        let f = Fixture::new();
        let mut a = f.client("alice");
        a.events();

        dispatch_text(&f.hub, &mut a.ctx, "{not json").await;
        dispatch_text(&f.hub, &mut a.ctx, r#"{"type": "teleport"}"#).await;

        assert_eq!(a.error_codes(), vec!["VALIDATION_ERROR", "VALIDATION_ERROR"]);
    }

    #[tokio::test]
    async fn test_search_replies_queued_then_matches() {
        let f = Fixture::new();
        let mut a = f.client("alice");
        let mut b = f.client("bob");
        a.events();
        b.events();

        f.send(&mut a, json!({"type": "search", "mode": "chat", "preference": "same_mode"}))
            .await;
        assert_eq!(a.events(), vec![ServerEvent::SearchQueued { position: 1 }]);

        f.send(&mut b, json!({"type": "search"})).await;
        let seen = b.events();
        assert_eq!(seen.first(), Some(&ServerEvent::SearchQueued { position: 2 }));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ServerEvent::MatchFound { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_search_is_rejected() {
        let f = Fixture::new();
        let mut a = f.client("alice");
        f.send(&mut a, json!({"type": "search"})).await;
        a.events();

        f.send(&mut a, json!({"type": "search"})).await;

        assert_eq!(
            a.events(),
            vec![ServerEvent::SearchRejected {
                reason: "already_searching".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_cancel_search_always_answers() {
        let f = Fixture::new();
        let mut a = f.client("alice");
        a.events();

        f.send(&mut a, json!({"type": "cancel_search"})).await;

        assert_eq!(a.events(), vec![ServerEvent::SearchCancelled]);
    }

    #[tokio::test]
    async fn test_room_events_require_join() {
        let f = Fixture::new();
        let mut a = f.client("alice");
        a.events();

        f.send(&mut a, json!({"type": "message", "content": "hi"})).await;

        assert_eq!(a.error_codes(), vec!["INVALID_STATE"]);
    }

    #[tokio::test]
    async fn test_join_foreign_room_is_forbidden() {
        let f = Fixture::new();
        let (_a, _b, room_id) = f.paired().await;
        let mut outsider = f.client("mallory");
        outsider.events();

        f.send(
            &mut outsider,
            json!({"type": "join_room", "room_id": room_id}),
        )
        .await;

        assert_eq!(outsider.error_codes(), vec!["FORBIDDEN"]);
        assert_eq!(outsider.ctx.joined_room(), None);
    }

    #[tokio::test]
    async fn test_message_reaches_both_participants() {
        let f = Fixture::new();
        let (mut a, mut b, room_id) = f.paired().await;

        f.send(&mut a, json!({"type": "message", "content": "hello"}))
            .await;

        for client in [&mut a, &mut b] {
            assert!(client.events().iter().any(|e| matches!(
                e,
                ServerEvent::Message { content, room_id: r, .. } if content == "hello" && *r == room_id
            )));
        }
    }

    #[tokio::test]
    async fn test_end_room_closes_both_connections() {
        let f = Fixture::new();
        let (mut a, mut b, room_id) = f.paired().await;

        f.send(&mut a, json!({"type": "end_room"})).await;

        assert_eq!(a.ctx.joined_room(), None);
        let seen = b.events();
        assert!(seen.contains(&ServerEvent::RoomEnded {
            room_id,
            reason: "user_ended".to_string()
        }));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ServerEvent::RoomClosed { .. })));
        assert!(!f.hub.registry().has_live_channel(b.ctx.user_id()));
    }

    #[tokio::test]
    async fn test_room_scope_is_rechecked_after_room_ends() {
        let f = Fixture::new();
        let (_a, mut b, room_id) = f.paired().await;
        f.hub
            .end_room(room_id, None, RoomEndReason::Timeout, Closure::Graceful)
            .await
            .unwrap();
        b.events();

        // Bob's context still names the room but the store no longer does.
        f.send(&mut b, json!({"type": "message", "content": "still there?"}))
            .await;

        assert_eq!(b.error_codes(), vec!["FORBIDDEN"]);
    }

    #[tokio::test]
    async fn test_call_errors_carry_call_codes() {
        let f = Fixture::new();
        let (mut a, _b, _room) = f.paired().await;
        let self_id = a.ctx.user_id();

        f.send(
            &mut a,
            json!({"type": "voice_call_initiate", "callee_id": self_id}),
        )
        .await;

        let seen = a.events();
        assert!(seen.iter().any(|e| matches!(
            e,
            ServerEvent::Error { code, message } if code == "CANNOT_CALL_SELF" && message == "You cannot call yourself"
        )));
    }

    #[tokio::test]
    async fn test_full_call_flow() {
        let f = Fixture::new();
        let (mut a, mut b, _room) = f.paired().await;

        f.send(
            &mut a,
            json!({"type": "voice_call_initiate", "callee_id": b.ctx.user_id()}),
        )
        .await;
        let call_id = b
            .events()
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::VoiceCallIncoming { call_id, .. } => Some(call_id),
                _ => None,
            })
            .expect("incoming call");

        f.send(&mut b, json!({"type": "voice_call_accept", "callId": call_id}))
            .await;
        f.send(
            &mut a,
            json!({"type": "webrtc_offer", "callId": call_id, "offer": {"sdp": "o"}}),
        )
        .await;
        f.send(
            &mut b,
            json!({"type": "webrtc_answer", "callId": call_id, "answer": {"sdp": "a"}}),
        )
        .await;

        assert!(b.events().iter().any(|e| matches!(
            e,
            ServerEvent::WebrtcOffer { offer, .. } if offer == &json!({"sdp": "o"})
        )));
        assert!(a.events().iter().any(|e| matches!(
            e,
            ServerEvent::WebrtcAnswer { answer, .. } if answer == &json!({"sdp": "a"})
        )));
        assert!(f.hub.calls().active_call_for_user(a.ctx.user_id()).is_some());

        f.send(&mut a, json!({"type": "voice_call_end", "callId": call_id}))
            .await;
        assert!(b.events().iter().any(|e| matches!(
            e,
            ServerEvent::VoiceCallEnded { room_closed: true, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_and_vote_through_dispatch() {
        let f = Fixture::new();
        let (mut a, mut b, room_id) = f.paired().await;

        f.send(&mut a, json!({"type": "start_countdown", "duration": 1}))
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;

        f.send(
            &mut a,
            json!({"type": "continuation_response", "response": "yes"}),
        )
        .await;
        f.send(
            &mut b,
            json!({"type": "continuation_response", "response": "yes"}),
        )
        .await;

        assert!(a.events().contains(&ServerEvent::RoomKept { room_id }));
        let room = f.store.get_room(room_id).await.unwrap().unwrap();
        assert!(room.keep_active);
    }

    #[tokio::test]
    async fn test_like_round_raises_reveal_level() {
        let f = Fixture::new();
        let (mut a, mut b, room_id) = f.paired().await;

        f.send(&mut a, json!({"type": "like_response", "response": "yes"}))
            .await;
        f.send(&mut b, json!({"type": "like_response", "response": "yes"}))
            .await;

        assert!(a
            .events()
            .contains(&ServerEvent::RevealLevel { room_id, level: 1 }));
    }
}
