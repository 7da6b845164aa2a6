//! Session Hub.
//!
//! Owns the orchestration components and is the single place where they
//! meet. Everything that can end a room (explicit end, declined vote, vote
//! timeout, call end, force close) funnels through [`SessionHub::end_room`].
//!
//! Timers never act directly. They post [`TimerEvent`]s that the hub's
//! timer loop handles after re-checking live state.
//!
//! ```text
//! Dispatcher ──► SessionHub ──► MatchingQueue
//!                    │     ├──► Negotiator ──┐
//!                    │     ├──► CallCoordinator ──┤ TimerEvent
//!                    │     └──► ChatService       │
//!                    ▼                            │
//!            ConnectionRegistry ◄── timer loop ◄──┘
//! ```

use async_trait::async_trait;
use chrono::Utc;
use common::types::{CallId, ConnectionId, RoomId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::calls::{CallCoordinator, CallEnded, Signal};
use crate::chat::ChatService;
use crate::config::SessionConfig;
use crate::errors::SessionError;
use crate::matching::{EnqueueOutcome, MatchedPair, MatchingQueue, PairingOutcome};
use crate::models::{
    CallEndReason, CallSession, CallStatus, EntryMode, MatchPreference, Room, RoomEndReason,
    UserRecord, UserStatus, Vote,
};
use crate::negotiation::{Negotiator, VoteOutcome};
use crate::observability::metrics;
use crate::protocol::ServerEvent;
use crate::registry::{ClientChannel, ConnectionRegistry, JoinOutcome, RoomTeardown};
use crate::store::Store;
use crate::timers::{self, TimerEvent, TimerReceiver};

/// How a room's channels are treated when it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Participants leave the room; their connections stay open.
    Graceful,
    /// `room_closed` is broadcast and every member's channel is severed.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndRoomOutcome {
    Ended,
    /// Another path ended the room first. Nothing was done.
    AlreadyEnded,
}

pub struct SessionHub {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    queue: MatchingQueue,
    negotiator: Arc<Negotiator>,
    calls: CallCoordinator,
    chat: ChatService,
    config: SessionConfig,
    cancel_token: CancellationToken,
}

impl SessionHub {
    /// Build a hub. The returned receiver must be handed to
    /// [`SessionHub::start`].
    pub fn new(
        store: Arc<dyn Store>,
        config: SessionConfig,
        cancel_token: CancellationToken,
    ) -> (Arc<Self>, TimerReceiver) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (timer_tx, timer_rx) = timers::channel();

        let queue = MatchingQueue::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.search_ticket_ttl,
        );
        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.clone(),
            timer_tx.clone(),
            cancel_token.child_token(),
        ));
        let calls = CallCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.clone(),
            timer_tx,
            cancel_token.child_token(),
        );
        let chat = ChatService::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.max_message_length,
        );

        let hub = Arc::new(Self {
            store,
            registry,
            queue,
            negotiator,
            calls,
            chat,
            config,
            cancel_token,
        });
        (hub, timer_rx)
    }

    /// Spawn the timer loop and the search-ticket sweeper.
    pub fn start(self: &Arc<Self>, timer_rx: TimerReceiver) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).run_timer_loop(timer_rx)),
            tokio::spawn(Arc::clone(self).run_expiry_sweeper()),
        ]
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn queue(&self) -> &MatchingQueue {
        &self.queue
    }

    #[must_use]
    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    #[must_use]
    pub fn calls(&self) -> &CallCoordinator {
        &self.calls
    }

    #[must_use]
    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Register `channel` as `user`'s live connection and send the welcome.
    pub fn connect(&self, user: &UserRecord, channel: ClientChannel) {
        let connection_id = channel.connection_id();
        self.registry.register(channel);
        self.registry.unicast(
            user.id,
            ServerEvent::Connection {
                user_id: user.id,
                status: user.status,
                current_room_id: user.current_room_id,
                timestamp: Utc::now().timestamp_millis(),
            },
        );
        info!(
            target: "rv.hub",
            user_id = %user.id,
            connection_id = %connection_id,
            "User connected"
        );
    }

    /// Clean up after a connection went away.
    ///
    /// Does nothing if a newer connection has replaced it. Otherwise the
    /// user's search ticket is dropped and any live call ends with reason
    /// `user_disconnect`. Rooms and negotiations are left to their timers.
    #[instrument(skip_all, name = "rv.hub.disconnect", fields(user_id = %user_id, connection_id = %connection_id))]
    pub async fn disconnect(&self, user_id: UserId, connection_id: ConnectionId) {
        let removed = self.registry.deregister(user_id, connection_id);
        if !removed && self.registry.channel(user_id).is_some() {
            debug!(target: "rv.hub", "Connection was replaced, skipping cleanup");
            return;
        }

        if let Err(e) = self.queue.dequeue(user_id).await {
            warn!(target: "rv.hub", error = %e, "Failed to drop search ticket on disconnect");
        }

        if let Some(call) = self.calls.active_call_for_user(user_id) {
            match self
                .calls
                .end(call.id, Some(user_id), CallEndReason::UserDisconnect, false)
                .await
            {
                Ok(ended) => self.after_call_ended(ended, Some(user_id)).await,
                Err(e) => debug!(target: "rv.hub", error = %e, "Call already gone on disconnect"),
            }
        }
        info!(target: "rv.hub", "User disconnected");
    }

    /// Queue `user_id` for matching, tell them, then try to pair.
    ///
    /// # Errors
    ///
    /// `Store` if the queue cannot read or write presence.
    pub async fn search(
        self: &Arc<Self>,
        user_id: UserId,
        mode: EntryMode,
        preference: MatchPreference,
    ) -> Result<EnqueueOutcome, SessionError> {
        let outcome = self.queue.enqueue(user_id, mode, preference).await?;
        match outcome {
            EnqueueOutcome::Queued { position } => {
                self.registry
                    .unicast(user_id, ServerEvent::SearchQueued { position });
                self.run_pairing().await;
            }
            EnqueueOutcome::Rejected(reason) => {
                self.registry.unicast(
                    user_id,
                    ServerEvent::SearchRejected {
                        reason: reason.as_str().to_string(),
                    },
                );
            }
        }
        Ok(outcome)
    }

    /// Drop `user_id`'s ticket. Always answers `search_cancelled`.
    ///
    /// # Errors
    ///
    /// `Store` if presence cannot be reset.
    pub async fn cancel_search(&self, user_id: UserId) -> Result<bool, SessionError> {
        let removed = self.queue.dequeue(user_id).await?;
        self.registry.unicast(user_id, ServerEvent::SearchCancelled);
        Ok(removed)
    }

    /// Pair until the queue head cannot move.
    ///
    /// A request made while an attempt was running triggers one more pass
    /// after a successful match.
    pub async fn run_pairing(self: &Arc<Self>) {
        loop {
            match self.queue.attempt_pairing().await {
                Ok(PairingOutcome::Matched(pair)) => {
                    self.schedule_match_followup(pair);
                    if !self.queue.take_rerun() {
                        break;
                    }
                }
                Ok(outcome) => {
                    debug!(target: "rv.hub", ?outcome, "Pairing pass finished");
                    self.queue.take_rerun();
                    break;
                }
                Err(e) => {
                    warn!(target: "rv.hub", error = %e, "Pairing attempt failed");
                    metrics::record_error(e.error_type_label());
                    self.queue.take_rerun();
                    break;
                }
            }
        }
    }

    /// Voice matches start ringing once both clients had time to join.
    fn schedule_match_followup(self: &Arc<Self>, pair: MatchedPair) {
        if !(self.config.auto_call_on_voice_match && pair.room.entry_mode == EntryMode::Voice) {
            return;
        }
        let hub = Arc::clone(self);
        let token = self.cancel_token.child_token();
        let delay = self.config.match_followup_delay;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Err(e) = hub.calls.initiate(pair.first, pair.second, pair.room.id).await {
                        info!(
                            target: "rv.hub",
                            room_id = %pair.room.id,
                            error_code = e.code(),
                            "Automatic voice call not started"
                        );
                    }
                }
            }
        });
    }

    /// Check that `user_id` may act inside `room_id`.
    ///
    /// The user record must name the room as current and the room must be
    /// active with the user as a participant.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for an unknown user, `PermissionDenied` otherwise.
    pub async fn authorize_room(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<(UserRecord, Room), SessionError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| SessionError::Unauthorized("User no longer exists".to_string()))?;
        if user.current_room_id != Some(room_id) {
            return Err(SessionError::PermissionDenied(
                "Room is not your current room".to_string(),
            ));
        }
        match self.store.get_room(room_id).await? {
            Some(room) if room.is_active() && room.has_participant(user_id) => Ok((user, room)),
            _ => Err(SessionError::PermissionDenied(
                "Room is not available".to_string(),
            )),
        }
    }

    /// Authorize and add `channel`'s user to `room_id`.
    ///
    /// # Errors
    ///
    /// See [`SessionHub::authorize_room`]. `ChannelClosed` if `channel` was
    /// closed or replaced while the room was being authorized.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        channel: &ClientChannel,
    ) -> Result<Room, SessionError> {
        let user_id = channel.user_id();
        let (_, room) = self.authorize_room(user_id, room_id).await?;
        if self.registry.join_room(room_id, user_id, channel) == JoinOutcome::Stale {
            return Err(SessionError::ChannelClosed(
                "Connection was replaced".to_string(),
            ));
        }
        self.registry
            .unicast(user_id, ServerEvent::RoomJoined { room_id });
        Ok(room)
    }

    pub fn leave_room(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.registry.leave_room(room_id, user_id)
    }

    /// End `room_id` exactly once.
    ///
    /// Runs, in order: the conditional store update, negotiation teardown,
    /// call end, presence reset, `room_ended` broadcast, then the closure.
    /// Losing the race to another path returns `AlreadyEnded` with no side
    /// effects.
    ///
    /// # Errors
    ///
    /// `Store` if the conditional update fails. Later steps log and continue.
    #[instrument(skip_all, name = "rv.hub.end_room", fields(room_id = %room_id, reason = reason.as_str()))]
    pub async fn end_room(
        &self,
        room_id: RoomId,
        ended_by: Option<UserId>,
        reason: RoomEndReason,
        closure: Closure,
    ) -> Result<EndRoomOutcome, SessionError> {
        if !self.store.end_room(room_id, Utc::now()).await? {
            debug!(target: "rv.hub", "Room already ended");
            return Ok(EndRoomOutcome::AlreadyEnded);
        }

        self.negotiator.teardown(room_id);
        self.chat.forget_room(room_id);

        if let Some(call) = self.calls.active_call_in_room(room_id) {
            if let Err(e) = self
                .calls
                .end(call.id, ended_by, CallEndReason::RoomEnded, true)
                .await
            {
                debug!(target: "rv.hub", call_id = %call.id, error = %e, "Call already ended");
            }
        }

        let participants = match self.store.get_room(room_id).await {
            Ok(Some(room)) => room.participants().to_vec(),
            Ok(None) => self.registry.members(room_id),
            Err(e) => {
                warn!(target: "rv.hub", error = %e, "Failed to reload ended room");
                self.registry.members(room_id)
            }
        };
        for user_id in &participants {
            self.reset_presence(*user_id, room_id).await;
        }

        self.registry.broadcast(
            room_id,
            ServerEvent::RoomEnded {
                room_id,
                reason: reason.as_str().to_string(),
            },
            None,
        );

        match closure {
            Closure::Graceful => {
                for user_id in &participants {
                    self.registry.leave_room(room_id, *user_id);
                }
            }
            Closure::Forced => {
                self.registry.force_close(room_id, self).await;
            }
        }

        metrics::record_room_ended(reason.as_str());
        info!(target: "rv.hub", ended_by = ?ended_by, "Room ended");
        Ok(EndRoomOutcome::Ended)
    }

    async fn reset_presence(&self, user_id: UserId, room_id: RoomId) {
        let still_here = match self.store.get_user(user_id).await {
            Ok(Some(user)) => user.current_room_id == Some(room_id),
            Ok(None) => false,
            Err(e) => {
                warn!(target: "rv.hub", user_id = %user_id, error = %e, "Failed to load user for presence reset");
                return;
            }
        };
        if !still_here {
            return;
        }
        if let Err(e) = self
            .store
            .set_user_presence(user_id, UserStatus::Idle, None)
            .await
        {
            warn!(target: "rv.hub", user_id = %user_id, error = %e, "Failed to reset presence");
        }
    }

    /// # Errors
    ///
    /// See [`Negotiator::start_countdown`].
    pub async fn start_countdown(
        &self,
        room_id: RoomId,
        duration_secs: Option<u64>,
    ) -> Result<u64, SessionError> {
        self.negotiator
            .start_countdown(room_id, duration_secs.map(Duration::from_secs))
            .await
    }

    /// Record a vote. A "no" ends the room.
    ///
    /// # Errors
    ///
    /// See [`Negotiator::respond`].
    pub async fn respond_continuation(
        &self,
        room_id: RoomId,
        user_id: UserId,
        vote: Vote,
    ) -> Result<VoteOutcome, SessionError> {
        let outcome = self.negotiator.respond(room_id, user_id, vote).await?;
        if outcome == VoteOutcome::Ended {
            self.end_room(room_id, Some(user_id), RoomEndReason::Declined, Closure::Graceful)
                .await?;
        }
        Ok(outcome)
    }

    /// # Errors
    ///
    /// See [`Negotiator::set_keep_flag`].
    pub async fn keep_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(Room, Option<VoteOutcome>), SessionError> {
        self.negotiator.set_keep_flag(room_id, user_id).await
    }

    /// # Errors
    ///
    /// See [`CallCoordinator::initiate`].
    pub async fn initiate_call(
        &self,
        caller_id: UserId,
        callee_id: UserId,
        room_id: RoomId,
    ) -> Result<CallSession, SessionError> {
        Ok(self.calls.initiate(caller_id, callee_id, room_id).await?)
    }

    /// # Errors
    ///
    /// See [`CallCoordinator::accept`].
    pub async fn accept_call(
        &self,
        call_id: CallId,
        user_id: UserId,
    ) -> Result<CallSession, SessionError> {
        Ok(self.calls.accept(call_id, user_id).await?)
    }

    /// # Errors
    ///
    /// See [`CallCoordinator::reject`].
    pub async fn reject_call(
        &self,
        call_id: CallId,
        user_id: UserId,
        reason: Option<String>,
    ) -> Result<CallSession, SessionError> {
        Ok(self.calls.reject(call_id, user_id, reason).await?)
    }

    /// Hang up. Closes the room unless it is kept.
    ///
    /// # Errors
    ///
    /// See [`CallCoordinator::end`].
    pub async fn end_call(
        &self,
        call_id: CallId,
        user_id: UserId,
    ) -> Result<CallEnded, SessionError> {
        let ended = self
            .calls
            .end(call_id, Some(user_id), CallEndReason::UserHangup, false)
            .await?;
        self.after_call_ended(ended.clone(), Some(user_id)).await;
        Ok(ended)
    }

    /// # Errors
    ///
    /// See [`CallCoordinator::relay`].
    pub async fn relay_signal(
        &self,
        call_id: CallId,
        from: UserId,
        signal: Signal,
    ) -> Result<(), SessionError> {
        Ok(self.calls.relay(call_id, from, signal).await?)
    }

    async fn after_call_ended(&self, ended: CallEnded, ended_by: Option<UserId>) {
        if !ended.room_closed {
            return;
        }
        if let Err(e) = self
            .end_room(
                ended.session.room_id,
                ended_by,
                RoomEndReason::CallEnded,
                Closure::Forced,
            )
            .await
        {
            error!(
                target: "rv.hub",
                room_id = %ended.session.room_id,
                error = %e,
                "Failed to end room after call"
            );
        }
    }

    /// Act on one timer event after re-checking live state.
    pub async fn handle_timer(&self, event: TimerEvent) {
        debug!(target: "rv.hub", ?event, "Timer fired");
        let (call_id, expected, reason) = match event {
            TimerEvent::RingTimeout { call_id } => {
                (call_id, CallStatus::Ringing, CallEndReason::Timeout)
            }
            TimerEvent::ConnectTimeout { call_id } => {
                (call_id, CallStatus::Accepted, CallEndReason::Timeout)
            }
            TimerEvent::MaxDuration { call_id } => (
                call_id,
                CallStatus::Active,
                CallEndReason::MaxDurationReached,
            ),
            TimerEvent::NegotiationExpired {
                room_id,
                generation,
            } => {
                if self.negotiator.confirm_expired(room_id, generation) {
                    if let Err(e) = self
                        .end_room(room_id, None, RoomEndReason::Timeout, Closure::Graceful)
                        .await
                    {
                        error!(target: "rv.hub", room_id = %room_id, error = %e, "Failed to end room after vote timeout");
                    }
                }
                return;
            }
        };

        if let Some(ended) = self.calls.on_timer(call_id, expected, reason).await {
            self.after_call_ended(ended, None).await;
        }
    }

    async fn run_timer_loop(self: Arc<Self>, mut timer_rx: TimerReceiver) {
        info!(target: "rv.hub", "Timer loop started");
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                event = timer_rx.recv() => match event {
                    Some(event) => self.handle_timer(event).await,
                    None => break,
                },
            }
        }
        info!(target: "rv.hub", "Timer loop stopped");
    }

    async fn run_expiry_sweeper(self: Arc<Self>) {
        let period = self.config.expiry_sweep_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.queue.sweep_expired(Instant::now()).await;
                    if !expired.is_empty() {
                        self.run_pairing().await;
                    }
                }
            }
        }
        debug!(target: "rv.hub", "Expiry sweeper stopped");
    }
}

#[async_trait]
impl RoomTeardown for SessionHub {
    async fn before_room_close(&self, room_id: RoomId) {
        if let Some(call) = self.calls.active_call_in_room(room_id) {
            if let Err(e) = self
                .calls
                .end(call.id, None, CallEndReason::RoomEnded, true)
                .await
            {
                debug!(target: "rv.hub", call_id = %call.id, error = %e, "Call ended concurrently");
            }
        }
        self.negotiator.teardown(room_id);
    }
}
