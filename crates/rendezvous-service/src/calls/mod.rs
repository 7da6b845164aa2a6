//! Call Signaling Coordinator.
//!
//! Tracks voice calls between the two participants of a room and relays
//! their WebRTC signaling. Payloads are forwarded as opaque JSON.
//!
//! ```text
//! initiated -> ringing -> accepted -> active -> ended
//!                 |
//!                 +-> rejected
//! ```
//!
//! # Invariants
//!
//! - A user is party to at most one non-terminal call
//! - Each live call owns one timer token for its current phase (ringing,
//!   connecting, active); moving phase cancels the previous timer
//! - Removing a call from the book is the commit point of `end`, so a
//!   second `end` fails with `INVALID_CALL_STATE`
//!
//! The coordinator never ends rooms itself. [`CallEnded::room_closed`]
//! tells the hub whether it must.

use chrono::Utc;
use common::types::{CallId, RoomId, UserId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::errors::CallError;
use crate::models::{CallEndReason, CallSession, CallStatus, CallUpdate, UserRecord};
use crate::observability::metrics;
use crate::protocol::{CallRole, ServerEvent};
use crate::registry::{ConnectionRegistry, RelayPolicy};
use crate::store::Store;
use crate::timers::{self, TimerEvent, TimerSender};

/// One signaling payload on its way to the other party.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(Value),
    Answer(Value),
    IceCandidate(Value),
}

impl Signal {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice_candidate",
        }
    }

    fn into_event(self, call_id: CallId, from: UserId) -> ServerEvent {
        match self {
            Signal::Offer(offer) => ServerEvent::WebrtcOffer {
                call_id,
                offer,
                from,
            },
            Signal::Answer(answer) => ServerEvent::WebrtcAnswer {
                call_id,
                answer,
                from,
            },
            Signal::IceCandidate(candidate) => ServerEvent::IceCandidate {
                call_id,
                candidate,
                from,
            },
        }
    }
}

/// Result of ending a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEnded {
    pub session: CallSession,
    /// The hub must now end the room and force-close it.
    pub room_closed: bool,
}

#[derive(Debug)]
struct LiveCall {
    session: CallSession,
    phase_timer: CancellationToken,
}

#[derive(Debug, Default)]
struct CallBook {
    calls: HashMap<CallId, LiveCall>,
    by_user: HashMap<UserId, CallId>,
}

impl CallBook {
    fn busy(&self, user_id: UserId) -> bool {
        self.by_user.contains_key(&user_id)
    }

    /// Remove `call_id` and its index entries. Cancels its phase timer.
    fn take(&mut self, call_id: CallId) -> Option<CallSession> {
        let live = self.calls.remove(&call_id)?;
        live.phase_timer.cancel();
        for user in [live.session.caller_id, live.session.callee_id] {
            if self.by_user.get(&user) == Some(&call_id) {
                self.by_user.remove(&user);
            }
        }
        Some(live.session)
    }
}

fn unknown_call() -> CallError {
    CallError::InvalidCallState("Unknown or finished call".to_string())
}

pub struct CallCoordinator {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    config: SessionConfig,
    timer_tx: TimerSender,
    cancel_token: CancellationToken,
    book: Mutex<CallBook>,
}

impl CallCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        config: SessionConfig,
        timer_tx: TimerSender,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            timer_tx,
            cancel_token,
            book: Mutex::new(CallBook::default()),
        }
    }

    fn book(&self) -> MutexGuard<'_, CallBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn relay_policy(&self) -> RelayPolicy {
        RelayPolicy {
            send_timeout: self.config.relay_send_timeout,
            attempts: self.config.relay_max_attempts,
            backoff: self.config.relay_retry_backoff,
        }
    }

    /// Start a fresh phase timer that posts `event` after `after`.
    fn arm_phase(&self, live: &mut LiveCall, after: Duration, event: TimerEvent) {
        live.phase_timer.cancel();
        live.phase_timer = self.cancel_token.child_token();
        timers::arm(live.phase_timer.clone(), after, event, self.timer_tx.clone());
    }

    #[must_use]
    pub fn active_call_for_user(&self, user_id: UserId) -> Option<CallSession> {
        let book = self.book();
        let call_id = book.by_user.get(&user_id)?;
        book.calls.get(call_id).map(|live| live.session.clone())
    }

    #[must_use]
    pub fn active_call_in_room(&self, room_id: RoomId) -> Option<CallSession> {
        self.book()
            .calls
            .values()
            .find(|live| live.session.room_id == room_id)
            .map(|live| live.session.clone())
    }

    #[must_use]
    pub fn live_call_count(&self) -> usize {
        self.book().calls.len()
    }

    async fn available_user(&self, user_id: UserId) -> Result<UserRecord, CallError> {
        match self.store.get_user(user_id).await? {
            Some(user) if !user.is_banned(Utc::now()) => Ok(user),
            _ => Err(CallError::UserNotFound),
        }
    }

    /// Ring `callee_id` on behalf of `caller_id` inside `room_id`.
    ///
    /// # Errors
    ///
    /// Checked in order: `CannotCallSelf`, `UserAlreadyInCall`,
    /// `TargetUserBusy`, `UserNotFound`, `UsersNotInSameRoom`, `RoomEnded`,
    /// `CallNotificationsDisabled`. Store failures are `SystemError`.
    #[instrument(skip_all, name = "rv.call.initiate", fields(room_id = %room_id, caller_id = %caller_id, callee_id = %callee_id))]
    pub async fn initiate(
        &self,
        caller_id: UserId,
        callee_id: UserId,
        room_id: RoomId,
    ) -> Result<CallSession, CallError> {
        if caller_id == callee_id {
            return Err(CallError::CannotCallSelf);
        }
        {
            let book = self.book();
            if book.busy(caller_id) {
                return Err(CallError::UserAlreadyInCall);
            }
            if book.busy(callee_id) {
                return Err(CallError::TargetUserBusy);
            }
        }

        let caller = self.available_user(caller_id).await?;
        let callee = self.available_user(callee_id).await?;

        let live_presence = self.registry.is_in_room(room_id, caller_id)
            && self.registry.is_in_room(room_id, callee_id);
        let room = self.store.get_room(room_id).await?;
        let persisted_presence = caller.current_room_id == Some(room_id)
            && callee.current_room_id == Some(room_id)
            && room
                .as_ref()
                .is_some_and(|r| r.has_participant(caller_id) && r.has_participant(callee_id));
        let Some(room) = room.filter(|_| live_presence && persisted_presence) else {
            return Err(CallError::UsersNotInSameRoom);
        };
        if !room.is_active() {
            return Err(CallError::RoomEnded);
        }
        if !self.store.get_call_settings(callee_id).await?.call_notifications {
            return Err(CallError::CallNotificationsDisabled);
        }

        let mut session = self
            .store
            .create_call_session(room_id, caller_id, callee_id)
            .await?;

        // Another call, a leave or a room end may have landed while the
        // session was written.
        let mut conflict = {
            let mut book = self.book();
            let conflict = if book.busy(caller_id) {
                Some(CallError::UserAlreadyInCall)
            } else if book.busy(callee_id) {
                Some(CallError::TargetUserBusy)
            } else if !self.registry.is_in_room(room_id, caller_id)
                || !self.registry.is_in_room(room_id, callee_id)
            {
                Some(CallError::UsersNotInSameRoom)
            } else {
                None
            };
            if conflict.is_none() {
                session.status = CallStatus::Ringing;
                let mut live = LiveCall {
                    session: session.clone(),
                    phase_timer: self.cancel_token.child_token(),
                };
                self.arm_phase(
                    &mut live,
                    self.config.ring_timeout,
                    TimerEvent::RingTimeout {
                        call_id: session.id,
                    },
                );
                book.by_user.insert(caller_id, session.id);
                book.by_user.insert(callee_id, session.id);
                book.calls.insert(session.id, live);
            }
            conflict
        };

        // A room that ended during the write was swept before this call was
        // committed. If a sweep took it since, there is nothing to withdraw.
        if conflict.is_none() {
            let room_error = match self.store.get_room(room_id).await {
                Ok(Some(room)) if room.is_active() => None,
                Ok(_) => Some(CallError::RoomEnded),
                Err(e) => Some(CallError::from(e)),
            };
            if let Some(err) = room_error {
                if self.book().take(session.id).is_none() {
                    debug!(target: "rv.call", call_id = %session.id, "Call already ended with its room");
                    return Err(err);
                }
                conflict = Some(err);
            }
        }

        if let Some(err) = conflict {
            let reason = match err {
                CallError::RoomEnded => CallEndReason::RoomEnded,
                _ => CallEndReason::Superseded,
            };
            warn!(
                target: "rv.call",
                call_id = %session.id,
                error_code = err.code(),
                "Call abandoned while being created"
            );
            let update = CallUpdate {
                status: Some(CallStatus::Ended),
                ended_at: Some(Utc::now()),
                end_reason: Some(reason.as_str().to_string()),
                ..CallUpdate::default()
            };
            if let Err(e) = self.store.update_call_session(session.id, update).await {
                warn!(target: "rv.call", call_id = %session.id, error = %e, "Failed to persist abandoned call");
            }
            metrics::record_call_outcome(reason.as_str());
            return Err(err);
        }

        self.registry.unicast(
            callee_id,
            ServerEvent::VoiceCallIncoming {
                call_id: session.id,
                caller: caller.profile(),
                room_id,
            },
        );
        self.registry.unicast(
            caller_id,
            ServerEvent::VoiceCallInitiated {
                call_id: session.id,
                callee_id,
            },
        );

        if let Err(e) = self
            .store
            .update_call_session(session.id, CallUpdate::status(CallStatus::Ringing))
            .await
        {
            warn!(target: "rv.call", call_id = %session.id, error = %e, "Failed to persist ringing state");
        }

        info!(target: "rv.call", call_id = %session.id, "Call ringing");
        Ok(session)
    }

    /// Callee picks up a ringing call.
    ///
    /// # Errors
    ///
    /// `InvalidCallState` unless `user_id` is the callee and the call is ringing.
    #[instrument(skip_all, name = "rv.call.accept", fields(call_id = %call_id, user_id = %user_id))]
    pub async fn accept(&self, call_id: CallId, user_id: UserId) -> Result<CallSession, CallError> {
        let answered_at = Utc::now();
        let session = {
            let mut book = self.book();
            let live = book.calls.get_mut(&call_id).ok_or_else(unknown_call)?;
            if live.session.callee_id != user_id {
                return Err(CallError::InvalidCallState(
                    "Only the callee can accept".to_string(),
                ));
            }
            if live.session.status != CallStatus::Ringing {
                return Err(CallError::InvalidCallState(format!(
                    "Call is {}",
                    live.session.status.as_str()
                )));
            }
            live.session.status = CallStatus::Accepted;
            live.session.answered_at = Some(answered_at);
            self.arm_phase(
                live,
                self.config.connect_timeout,
                TimerEvent::ConnectTimeout { call_id },
            );
            live.session.clone()
        };

        let update = CallUpdate {
            status: Some(CallStatus::Accepted),
            answered_at: Some(answered_at),
            ..CallUpdate::default()
        };
        if let Err(e) = self.store.update_call_session(call_id, update).await {
            warn!(target: "rv.call", call_id = %call_id, error = %e, "Failed to persist accepted state");
        }

        self.registry.unicast(
            session.caller_id,
            ServerEvent::VoiceCallAccepted {
                call_id,
                callee_id: session.callee_id,
            },
        );
        self.registry.unicast(
            session.caller_id,
            ServerEvent::VoiceCallStartWebrtc {
                call_id,
                role: CallRole::Caller,
            },
        );
        self.registry.unicast(
            session.callee_id,
            ServerEvent::VoiceCallStartWebrtc {
                call_id,
                role: CallRole::Callee,
            },
        );

        info!(target: "rv.call", call_id = %call_id, "Call accepted");
        Ok(session)
    }

    /// Callee declines before accepting.
    ///
    /// # Errors
    ///
    /// `InvalidCallState` unless `user_id` is the callee and the call has not
    /// been accepted.
    #[instrument(skip_all, name = "rv.call.reject", fields(call_id = %call_id, user_id = %user_id))]
    pub async fn reject(
        &self,
        call_id: CallId,
        user_id: UserId,
        reason: Option<String>,
    ) -> Result<CallSession, CallError> {
        let mut session = {
            let mut book = self.book();
            let live = book.calls.get(&call_id).ok_or_else(unknown_call)?;
            if live.session.callee_id != user_id {
                return Err(CallError::InvalidCallState(
                    "Only the callee can reject".to_string(),
                ));
            }
            if !live.session.status.can_transition_to(CallStatus::Rejected) {
                return Err(CallError::InvalidCallState(format!(
                    "Call is {}",
                    live.session.status.as_str()
                )));
            }
            book.take(call_id).ok_or_else(unknown_call)?
        };

        let reason = reason.unwrap_or_else(|| "declined".to_string());
        session.status = CallStatus::Rejected;
        session.ended_at = Some(Utc::now());
        session.end_reason = Some(reason.clone());

        let update = CallUpdate {
            status: Some(CallStatus::Rejected),
            ended_at: session.ended_at,
            end_reason: Some(reason.clone()),
            ..CallUpdate::default()
        };
        if let Err(e) = self.store.update_call_session(call_id, update).await {
            warn!(target: "rv.call", call_id = %call_id, error = %e, "Failed to persist rejection");
        }

        self.registry.unicast(
            session.caller_id,
            ServerEvent::VoiceCallRejected { call_id, reason },
        );
        metrics::record_call_outcome("rejected");
        info!(target: "rv.call", call_id = %call_id, "Call rejected");
        Ok(session)
    }

    /// Forward a signaling payload from `from` to the other party.
    ///
    /// An answer that reaches the caller moves the call to active and starts
    /// the maximum-duration timer.
    ///
    /// # Errors
    ///
    /// - `InvalidCallState` - not a party, call not accepted/active, or an
    ///   answer sent by the caller
    /// - `SystemError` - delivery failed after all retries; the call state is
    ///   left unchanged
    #[instrument(skip_all, name = "rv.call.relay", fields(call_id = %call_id, from = %from, kind = signal.kind()))]
    pub async fn relay(&self, call_id: CallId, from: UserId, signal: Signal) -> Result<(), CallError> {
        let is_answer = matches!(signal, Signal::Answer(_));
        let (target, caller_id) = {
            let book = self.book();
            let live = book.calls.get(&call_id).ok_or_else(unknown_call)?;
            let target = live.session.other_party(from).ok_or_else(|| {
                CallError::InvalidCallState("Not a party to this call".to_string())
            })?;
            if !matches!(
                live.session.status,
                CallStatus::Accepted | CallStatus::Active
            ) {
                return Err(CallError::InvalidCallState(format!(
                    "Call is {}",
                    live.session.status.as_str()
                )));
            }
            if is_answer && from != live.session.callee_id {
                return Err(CallError::InvalidCallState(
                    "Only the callee answers".to_string(),
                ));
            }
            (target, live.session.caller_id)
        };

        let kind = signal.kind();
        let delivered = self
            .registry
            .unicast_with_retry(target, signal.into_event(call_id, from), self.relay_policy())
            .await;
        metrics::record_signal_relay(kind, delivered.is_ok());
        if let Err(e) = delivered {
            warn!(target: "rv.call", call_id = %call_id, kind = kind, error = %e, "Signal relay failed");
            return Err(CallError::SystemError(format!("{kind} delivery failed: {e}")));
        }

        if is_answer {
            self.activate(call_id, caller_id).await;
        }
        Ok(())
    }

    async fn activate(&self, call_id: CallId, caller_id: UserId) {
        let ceiling = match self.store.get_call_settings(caller_id).await {
            Ok(settings) => Duration::from_secs(settings.max_call_duration_secs),
            Err(e) => {
                warn!(target: "rv.call", call_id = %call_id, error = %e, "Using default call ceiling");
                self.config.default_max_call_duration
            }
        };

        let activated = {
            let mut book = self.book();
            match book.calls.get_mut(&call_id) {
                Some(live) if live.session.status == CallStatus::Accepted => {
                    live.session.status = CallStatus::Active;
                    self.arm_phase(live, ceiling, TimerEvent::MaxDuration { call_id });
                    true
                }
                _ => false,
            }
        };
        if !activated {
            return;
        }

        if let Err(e) = self
            .store
            .update_call_session(call_id, CallUpdate::status(CallStatus::Active))
            .await
        {
            warn!(target: "rv.call", call_id = %call_id, error = %e, "Failed to persist active state");
        }
        info!(
            target: "rv.call",
            call_id = %call_id,
            max_duration_secs = ceiling.as_secs(),
            "Call active"
        );
    }

    /// End a call.
    ///
    /// Both parties get `voice_call_ended`. The room must close when
    /// `force_end_room` is set or the room is not kept.
    ///
    /// # Errors
    ///
    /// `InvalidCallState` if the call is unknown or already ended, or if
    /// `ended_by` is not a party.
    #[instrument(skip_all, name = "rv.call.end", fields(call_id = %call_id, reason = reason.as_str()))]
    pub async fn end(
        &self,
        call_id: CallId,
        ended_by: Option<UserId>,
        reason: CallEndReason,
        force_end_room: bool,
    ) -> Result<CallEnded, CallError> {
        let mut session = {
            let mut book = self.book();
            let live = book.calls.get(&call_id).ok_or_else(unknown_call)?;
            if ended_by.is_some_and(|user| !live.session.is_party(user)) {
                return Err(CallError::InvalidCallState(
                    "Not a party to this call".to_string(),
                ));
            }
            book.take(call_id).ok_or_else(unknown_call)?
        };

        let ended_at = Utc::now();
        let duration = session
            .answered_at
            .map_or(0, |answered| {
                u64::try_from((ended_at - answered).num_seconds()).unwrap_or(0)
            });
        session.status = CallStatus::Ended;
        session.ended_at = Some(ended_at);
        session.duration_secs = Some(duration);
        session.end_reason = Some(reason.as_str().to_string());

        let update = CallUpdate {
            status: Some(CallStatus::Ended),
            ended_at: Some(ended_at),
            duration_secs: Some(duration),
            end_reason: Some(reason.as_str().to_string()),
            ..CallUpdate::default()
        };
        if let Err(e) = self.store.update_call_session(call_id, update).await {
            warn!(target: "rv.call", call_id = %call_id, error = %e, "Failed to persist call end");
        }

        let room_closed = force_end_room
            || match self.store.get_room(session.room_id).await {
                Ok(Some(room)) => !room.keep_active,
                Ok(None) => true,
                Err(e) => {
                    warn!(target: "rv.call", call_id = %call_id, error = %e, "Room lookup failed, leaving room open");
                    false
                }
            };

        let notice = ServerEvent::VoiceCallEnded {
            call_id,
            reason: reason.as_str().to_string(),
            duration,
            ended_by,
            room_closed,
        };
        self.registry.unicast(session.caller_id, notice.clone());
        self.registry.unicast(session.callee_id, notice);

        metrics::record_call_outcome(reason.as_str());
        if session.answered_at.is_some() {
            metrics::record_call_duration(Duration::from_secs(duration));
        }
        info!(
            target: "rv.call",
            call_id = %call_id,
            duration_secs = duration,
            room_closed = room_closed,
            "Call ended"
        );
        Ok(CallEnded {
            session,
            room_closed,
        })
    }

    /// Act on a call timer if the call is still in `expected` status.
    ///
    /// Returns `None` for a stale timer.
    pub async fn on_timer(
        &self,
        call_id: CallId,
        expected: CallStatus,
        reason: CallEndReason,
    ) -> Option<CallEnded> {
        let current = self
            .book()
            .calls
            .get(&call_id)
            .map(|live| live.session.status);
        if current != Some(expected) {
            debug!(target: "rv.call", call_id = %call_id, "Ignoring stale call timer");
            return None;
        }
        match self.end(call_id, None, reason, false).await {
            Ok(ended) => Some(ended),
            Err(e) => {
                debug!(target: "rv.call", call_id = %call_id, error = %e, "Call gone before timer ran");
                None
            }
        }
    }
}
