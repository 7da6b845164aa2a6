//! Countdown / Continuation Negotiator.
//!
//! Once a room has run for a while, its participants decide whether to keep
//! talking:
//!
//! ```text
//! idle -> pending -> countdown(D) -> notification(30s) -> kept | ended -> idle
//! ```
//!
//! Each room has at most one [`RoomNegotiation`]. It owns a cancellation
//! token and a single task that drives the start retries, the countdown
//! ticks and the notification ticks. Tearing the context down is one
//! `cancel()`.
//!
//! The vote deadline is posted to the hub as
//! [`TimerEvent::NegotiationExpired`] and confirmed through
//! [`Negotiator::confirm_expired`], which ignores events from an older
//! generation.

use chrono::Utc;
use common::types::{RoomId, UserId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{SessionConfig, MAX_COUNTDOWN_SECONDS};
use crate::errors::SessionError;
use crate::models::{Room, Vote};
use crate::observability::metrics;
use crate::protocol::ServerEvent;
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use crate::timers::{TimerEvent, TimerSender};

const TICK: Duration = Duration::from_secs(1);

/// Where a room's negotiation currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Waiting for both participants to be present.
    Pending { attempts: u32 },
    Countdown { deadline: Instant, end_timestamp: i64 },
    Notification {
        deadline: Instant,
        users_to_notify: Vec<UserId>,
    },
}

impl NegotiationPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationPhase::Pending { .. } => "pending",
            NegotiationPhase::Countdown { .. } => "countdown",
            NegotiationPhase::Notification { .. } => "notification",
        }
    }
}

/// Result of a continuation vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// A "no" was cast. The caller must end the room.
    Ended,
    /// Both participants said "yes".
    Kept,
    /// Recorded; the other participant has not answered.
    Waiting,
}

/// Read-only view of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationStatus {
    pub room_id: RoomId,
    pub phase: &'static str,
    pub remaining_secs: u64,
    pub yes_votes: Vec<UserId>,
    pub users_to_notify: Vec<UserId>,
}

#[derive(Debug)]
struct RoomNegotiation {
    generation: u64,
    participants: [UserId; 2],
    phase: NegotiationPhase,
    yes_votes: BTreeSet<UserId>,
    cancel_token: CancellationToken,
}

impl RoomNegotiation {
    fn all_voted_yes(&self) -> bool {
        self.participants.iter().all(|p| self.yes_votes.contains(p))
    }
}

/// Seconds left until `deadline`, rounded up.
fn remaining_secs(deadline: Instant) -> u64 {
    let left = deadline.saturating_duration_since(Instant::now());
    left.as_secs() + u64::from(left.subsec_nanos() > 0)
}

fn wall_clock_deadline(duration: Duration) -> i64 {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_add(millis)
}

/// Owns every room's continuation negotiation.
pub struct Negotiator {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    config: SessionConfig,
    timer_tx: TimerSender,
    cancel_token: CancellationToken,
    rooms: Mutex<HashMap<RoomId, RoomNegotiation>>,
    next_generation: AtomicU64,
}

impl Negotiator {
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
            rooms: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomId, RoomNegotiation>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_active(&self, room_id: RoomId) -> bool {
        self.rooms().contains_key(&room_id)
    }

    #[must_use]
    pub fn status(&self, room_id: RoomId) -> Option<NegotiationStatus> {
        let rooms = self.rooms();
        let ctx = rooms.get(&room_id)?;
        let (remaining_secs, users_to_notify) = match &ctx.phase {
            NegotiationPhase::Pending { .. } => (0, Vec::new()),
            NegotiationPhase::Countdown { deadline, .. } => (remaining_secs(*deadline), Vec::new()),
            NegotiationPhase::Notification {
                deadline,
                users_to_notify,
            } => (remaining_secs(*deadline), users_to_notify.clone()),
        };
        Some(NegotiationStatus {
            room_id,
            phase: ctx.phase.as_str(),
            remaining_secs,
            yes_votes: ctx.yes_votes.iter().copied().collect(),
            users_to_notify,
        })
    }

    /// Start a countdown of `duration` (or the default) for `room_id`.
    ///
    /// The countdown itself begins once both participants have a live
    /// channel in the room. Returns the context's generation.
    ///
    /// # Errors
    ///
    /// - `Validation` - duration is zero or above the maximum
    /// - `NotFound` - no such room
    /// - `InvalidState` - room ended, already kept, or already negotiating
    /// - `Store` - room lookup failed
    #[instrument(skip_all, name = "rv.negotiation.start", fields(room_id = %room_id))]
    pub async fn start_countdown(
        self: &Arc<Self>,
        room_id: RoomId,
        duration: Option<Duration>,
    ) -> Result<u64, SessionError> {
        let duration = duration.unwrap_or(self.config.default_countdown);
        if duration.is_zero() || duration > Duration::from_secs(MAX_COUNTDOWN_SECONDS) {
            return Err(SessionError::Validation(format!(
                "Countdown must be between 1 and {MAX_COUNTDOWN_SECONDS} seconds"
            )));
        }

        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or_else(|| SessionError::NotFound("Room not found".to_string()))?;
        if !room.is_active() {
            return Err(SessionError::InvalidState("Room has ended".to_string()));
        }
        if room.keep_active {
            return Err(SessionError::InvalidState(
                "Room is already kept".to_string(),
            ));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.cancel_token.child_token();
        {
            let mut rooms = self.rooms();
            if rooms.contains_key(&room_id) {
                return Err(SessionError::InvalidState(
                    "A countdown is already running".to_string(),
                ));
            }
            rooms.insert(
                room_id,
                RoomNegotiation {
                    generation,
                    participants: room.participants(),
                    phase: NegotiationPhase::Pending { attempts: 0 },
                    yes_votes: BTreeSet::new(),
                    cancel_token: cancel_token.clone(),
                },
            );
        }

        info!(
            target: "rv.negotiation",
            room_id = %room_id,
            generation = generation,
            duration_secs = duration.as_secs(),
            "Countdown requested"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(room, generation, duration, cancel_token).await;
        });
        Ok(generation)
    }

    /// Single task behind a room's negotiation.
    async fn drive(
        self: Arc<Self>,
        room: Room,
        generation: u64,
        duration: Duration,
        cancel_token: CancellationToken,
    ) {
        let room_id = room.id;

        if !self.await_participants(&room, generation, &cancel_token).await {
            return;
        }

        if !self.run_countdown(room_id, generation, duration, &cancel_token).await {
            return;
        }

        self.run_notification(room_id, generation, &cancel_token).await;
    }

    /// Retry until both participants are present. Returns `false` if the
    /// context was cancelled or gave up.
    async fn await_participants(
        &self,
        room: &Room,
        generation: u64,
        cancel_token: &CancellationToken,
    ) -> bool {
        let mut attempts: u32 = 0;
        loop {
            let present = room
                .participants()
                .iter()
                .all(|user| self.registry.is_in_room(room.id, *user));
            if present {
                return true;
            }

            attempts += 1;
            if attempts > self.config.countdown_max_start_retries {
                warn!(
                    target: "rv.negotiation",
                    room_id = %room.id,
                    attempts = attempts - 1,
                    "Participants never joined, abandoning countdown"
                );
                self.discard(room.id, generation, "abandoned");
                return false;
            }

            if !self.set_phase(room.id, generation, NegotiationPhase::Pending { attempts }) {
                return false;
            }
            debug!(
                target: "rv.negotiation",
                room_id = %room.id,
                attempt = attempts,
                "Waiting for both participants before countdown"
            );

            tokio::select! {
                biased;
                () = cancel_token.cancelled() => return false,
                () = tokio::time::sleep(self.config.countdown_retry_delay) => {}
            }
        }
    }

    async fn run_countdown(
        &self,
        room_id: RoomId,
        generation: u64,
        duration: Duration,
        cancel_token: &CancellationToken,
    ) -> bool {
        let started = Instant::now();
        let deadline = started + duration;
        let end_timestamp = wall_clock_deadline(duration);

        if !self.set_phase(
            room_id,
            generation,
            NegotiationPhase::Countdown {
                deadline,
                end_timestamp,
            },
        ) {
            return false;
        }

        self.registry.broadcast(
            room_id,
            ServerEvent::CountdownStart {
                room_id,
                duration: duration.as_secs(),
                end_timestamp,
            },
            None,
        );

        let mut ticker = tokio::time::interval_at(started + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => return false,
                () = tokio::time::sleep_until(deadline) => return true,
                _ = ticker.tick() => {
                    if self.registry.members(room_id).is_empty() {
                        info!(target: "rv.negotiation", room_id = %room_id, "Room emptied during countdown");
                        self.discard(room_id, generation, "abandoned");
                        return false;
                    }
                    self.registry.broadcast(
                        room_id,
                        ServerEvent::CountdownUpdate {
                            room_id,
                            remaining: remaining_secs(deadline),
                            end_timestamp,
                        },
                        None,
                    );
                }
            }
        }
    }

    async fn run_notification(
        self: &Arc<Self>,
        room_id: RoomId,
        generation: u64,
        cancel_token: &CancellationToken,
    ) {
        let room = match self.store.get_room(room_id).await {
            Ok(Some(room)) if room.is_active() => room,
            Ok(_) => {
                self.discard(room_id, generation, "abandoned");
                return;
            }
            Err(e) => {
                warn!(target: "rv.negotiation", room_id = %room_id, error = %e, "Failed to load room for vote");
                self.discard(room_id, generation, "abandoned");
                return;
            }
        };

        let users_to_notify: Vec<UserId> = room
            .participants()
            .into_iter()
            .filter(|user| !room.keep_flag(*user))
            .collect();

        if users_to_notify.is_empty() {
            info!(target: "rv.negotiation", room_id = %room_id, "Both participants already opted in");
            if self.take_context(room_id, Some(generation)).is_some() {
                self.keep_room(room_id).await;
            }
            return;
        }

        let timeout = self.config.notification_timeout;
        let deadline = Instant::now() + timeout;
        {
            let mut rooms = self.rooms();
            let Some(ctx) = rooms.get_mut(&room_id).filter(|c| c.generation == generation) else {
                return;
            };
            // A participant who already opted in counts as yes.
            for user in room.participants() {
                if room.keep_flag(user) {
                    ctx.yes_votes.insert(user);
                }
            }
            ctx.phase = NegotiationPhase::Notification {
                deadline,
                users_to_notify: users_to_notify.clone(),
            };
        }

        for user in &users_to_notify {
            self.registry.unicast(
                *user,
                ServerEvent::NotificationShow {
                    room_id,
                    timeout: timeout.as_secs(),
                    users_to_notify: users_to_notify.clone(),
                },
            );
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => return,
                () = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    self.registry.broadcast(
                        room_id,
                        ServerEvent::NotificationUpdate {
                            room_id,
                            remaining: remaining_secs(deadline),
                            users_to_notify: users_to_notify.clone(),
                        },
                        None,
                    );
                }
            }
        }

        if self
            .timer_tx
            .send(TimerEvent::NegotiationExpired {
                room_id,
                generation,
            })
            .await
            .is_err()
        {
            debug!(target: "rv.negotiation", room_id = %room_id, "Hub gone before vote expired");
        }
    }

    /// Move a context to `phase` if it is still `generation`.
    fn set_phase(&self, room_id: RoomId, generation: u64, phase: NegotiationPhase) -> bool {
        let mut rooms = self.rooms();
        match rooms.get_mut(&room_id) {
            Some(ctx) if ctx.generation == generation => {
                ctx.phase = phase;
                true
            }
            _ => false,
        }
    }

    /// Remove and cancel a context, optionally only if it matches `generation`.
    fn take_context(&self, room_id: RoomId, generation: Option<u64>) -> Option<RoomNegotiation> {
        let mut rooms = self.rooms();
        let matches = match (rooms.get(&room_id), generation) {
            (Some(ctx), Some(g)) => ctx.generation == g,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return None;
        }
        let ctx = rooms.remove(&room_id)?;
        ctx.cancel_token.cancel();
        Some(ctx)
    }

    fn discard(&self, room_id: RoomId, generation: u64, outcome: &'static str) {
        if self.take_context(room_id, Some(generation)).is_some() {
            metrics::record_negotiation(outcome);
            debug!(target: "rv.negotiation", room_id = %room_id, outcome = outcome, "Negotiation discarded");
        }
    }

    async fn keep_room(&self, room_id: RoomId) {
        if let Err(e) = self.store.set_room_keep_active(room_id, true).await {
            warn!(target: "rv.negotiation", room_id = %room_id, error = %e, "Failed to persist kept room");
        }
        self.registry
            .broadcast(room_id, ServerEvent::RoomKept { room_id }, None);
        metrics::record_negotiation("kept");
        info!(target: "rv.negotiation", room_id = %room_id, "Room kept");
    }

    /// Record a continuation vote.
    ///
    /// # Errors
    ///
    /// - `InvalidState` - no vote is open for the room
    /// - `PermissionDenied` - `user_id` is not a participant
    #[instrument(skip_all, name = "rv.negotiation.respond", fields(room_id = %room_id, user_id = %user_id))]
    pub async fn respond(
        &self,
        room_id: RoomId,
        user_id: UserId,
        vote: Vote,
    ) -> Result<VoteOutcome, SessionError> {
        let outcome = {
            let mut rooms = self.rooms();
            let ctx = rooms.get_mut(&room_id).ok_or_else(|| {
                SessionError::InvalidState("No continuation vote is open".to_string())
            })?;
            if !ctx.participants.contains(&user_id) {
                return Err(SessionError::PermissionDenied(
                    "Not a participant of this room".to_string(),
                ));
            }
            if !matches!(ctx.phase, NegotiationPhase::Notification { .. }) {
                return Err(SessionError::InvalidState(
                    "No continuation vote is open".to_string(),
                ));
            }

            match vote {
                Vote::No => VoteOutcome::Ended,
                Vote::Yes => {
                    ctx.yes_votes.insert(user_id);
                    if ctx.all_voted_yes() {
                        VoteOutcome::Kept
                    } else {
                        VoteOutcome::Waiting
                    }
                }
            }
        };

        match outcome {
            VoteOutcome::Ended => {
                self.take_context(room_id, None);
                metrics::record_negotiation("declined");
                info!(target: "rv.negotiation", room_id = %room_id, user_id = %user_id, "Continuation declined");
            }
            VoteOutcome::Kept => {
                self.take_context(room_id, None);
                self.keep_room(room_id).await;
            }
            VoteOutcome::Waiting => {
                self.registry
                    .unicast(user_id, ServerEvent::ContinuationWaiting { room_id });
            }
        }
        Ok(outcome)
    }

    /// Record `user_id`'s keep-active opt-in ahead of the vote.
    ///
    /// Counts as a "yes" if a vote is already open. Returns the updated room
    /// and the vote outcome, if a vote was open.
    ///
    /// # Errors
    ///
    /// - `NotFound` - no such room
    /// - `InvalidState` - room ended
    /// - `PermissionDenied` - `user_id` is not a participant
    /// - `Store` - persistence failed
    #[instrument(skip_all, name = "rv.negotiation.keep", fields(room_id = %room_id, user_id = %user_id))]
    pub async fn set_keep_flag(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(Room, Option<VoteOutcome>), SessionError> {
        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or_else(|| SessionError::NotFound("Room not found".to_string()))?;
        if !room.is_active() {
            return Err(SessionError::InvalidState("Room has ended".to_string()));
        }
        if !room.has_participant(user_id) {
            return Err(SessionError::PermissionDenied(
                "Not a participant of this room".to_string(),
            ));
        }

        let already_kept = room.keep_active;
        let room = self.store.set_keep_flag(room_id, user_id).await?;

        let voting = self
            .rooms()
            .get(&room_id)
            .is_some_and(|ctx| matches!(ctx.phase, NegotiationPhase::Notification { .. }));
        if voting {
            let outcome = self.respond(room_id, user_id, Vote::Yes).await?;
            return Ok((room, Some(outcome)));
        }

        if room.keep_active && !already_kept {
            // Nothing left to vote on.
            self.take_context(room_id, None);
            self.registry
                .broadcast(room_id, ServerEvent::RoomKept { room_id }, None);
            metrics::record_negotiation("kept");
        }
        Ok((room, None))
    }

    /// Confirm a vote deadline. Returns `true` if the room should now end
    /// with reason "timeout".
    pub fn confirm_expired(&self, room_id: RoomId, generation: u64) -> bool {
        let in_vote = self.rooms().get(&room_id).is_some_and(|ctx| {
            ctx.generation == generation
                && matches!(ctx.phase, NegotiationPhase::Notification { .. })
        });
        if !in_vote {
            debug!(
                target: "rv.negotiation",
                room_id = %room_id,
                generation = generation,
                "Ignoring stale vote deadline"
            );
            return false;
        }
        if self.take_context(room_id, Some(generation)).is_some() {
            metrics::record_negotiation("timeout");
            return true;
        }
        false
    }

    /// Cancel any negotiation for `room_id`. Returns `true` if one existed.
    pub fn teardown(&self, room_id: RoomId) -> bool {
        let removed = self.take_context(room_id, None).is_some();
        if removed {
            metrics::record_negotiation("torn_down");
            debug!(target: "rv.negotiation", room_id = %room_id, "Negotiation torn down");
        }
        removed
    }
}
