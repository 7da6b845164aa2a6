//! Matching Queue.
//!
//! A FIFO of search tickets. Each pairing attempt looks only at the two
//! oldest tickets:
//!
//! 1. Pop the head pair
//! 2. Re-fetch both users and re-check both tickets are still queued
//! 3. Check entry-mode and pairwise compatibility
//! 4. Rejected: push both back to the front of the queue and stop
//! 5. Compatible: create the room, re-check the tickets, then commit
//!
//! A rejected head pair blocks every ticket behind it until one of the two
//! leaves the queue. The blocked attempt is logged at warn and counted in
//! `rv_matching_head_blocked_total`, and each ticket's `retry_count` grows.
//!
//! Queue membership is the authoritative "searching" status. The Store
//! mirror is written after the in-memory change.

pub mod compat;

use chrono::Utc;
use common::types::{RoomId, UserId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::errors::SessionError;
use crate::models::{EntryMode, MatchPreference, NewRoom, Room, RoomEndReason, UserRecord, UserStatus};
use crate::observability::metrics;
use crate::protocol::ServerEvent;
use crate::registry::ConnectionRegistry;
use crate::store::Store;

use compat::Incompatibility;

/// Opening lines sent with `match_found`.
const ICEBREAKERS: &[&str] = &[
    "What's the best thing that happened to you this week?",
    "If you could live anywhere for a year, where would it be?",
    "What's a hobby you've always wanted to pick up?",
    "What song have you had on repeat lately?",
    "What's the most underrated food you can think of?",
    "If you had a free day tomorrow, how would you spend it?",
    "What's something you're looking forward to?",
    "What's the last thing that made you laugh out loud?",
];

const FALLBACK_ICEBREAKER: &str = "Say hello!";

/// Icebreaker for a room, stable for a given room id.
#[must_use]
pub fn icebreaker_for(room_id: RoomId) -> &'static str {
    let len = ICEBREAKERS.len() as u64;
    usize::try_from(room_id.0.unsigned_abs() % len)
        .ok()
        .and_then(|i| ICEBREAKERS.get(i))
        .copied()
        .unwrap_or(FALLBACK_ICEBREAKER)
}

/// One user waiting to be matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTicket {
    pub user_id: UserId,
    pub mode: EntryMode,
    pub preference: MatchPreference,
    pub enqueued_at: Instant,
    /// Number of rejected head pairs this ticket has been part of.
    pub retry_count: u32,
}

/// Why a search request was turned away. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejection {
    AlreadySearching,
    AlreadyInRoom,
    UnknownUser,
    Banned,
}

impl EnqueueRejection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EnqueueRejection::AlreadySearching => "already_searching",
            EnqueueRejection::AlreadyInRoom => "already_in_room",
            EnqueueRejection::UnknownUser => "unknown_user",
            EnqueueRejection::Banned => "banned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 1-based position in the queue.
    Queued { position: usize },
    Rejected(EnqueueRejection),
}

/// A committed match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedPair {
    pub room: Room,
    /// The caller for any voice follow-up (the older ticket).
    pub first: UserId,
    pub second: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    Matched(MatchedPair),
    /// Head pair was incompatible and went back to the front.
    Rejected(Incompatibility),
    /// A ticket left during room creation; the room was discarded.
    Aborted,
    /// Fewer than two valid tickets.
    NotEnoughTickets,
    /// Another attempt is in progress. A re-run was requested.
    Busy,
}

impl PairingOutcome {
    #[must_use]
    pub fn matched(self) -> Option<MatchedPair> {
        match self {
            PairingOutcome::Matched(pair) => Some(pair),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<UserId>,
    tickets: HashMap<UserId, SearchTicket>,
}

impl QueueState {
    /// Whether `ticket` is still the live ticket for its user.
    fn holds(&self, ticket: &SearchTicket) -> bool {
        self.tickets
            .get(&ticket.user_id)
            .is_some_and(|t| t.enqueued_at == ticket.enqueued_at)
    }

    fn requeue_front(&mut self, users: &[UserId]) {
        for user_id in users.iter().rev() {
            if self.tickets.contains_key(user_id) && !self.order.contains(user_id) {
                self.order.push_front(*user_id);
            }
        }
    }
}

/// Resets the in-progress flag when an attempt finishes, however it exits.
struct PairingGuard<'a>(&'a AtomicBool);

impl<'a> PairingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PairingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Process-wide queue of users waiting for a partner.
pub struct MatchingQueue {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    ticket_ttl: Duration,
    state: Mutex<QueueState>,
    in_progress: AtomicBool,
    rerun_requested: AtomicBool,
}

impl MatchingQueue {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ConnectionRegistry>, ticket_ttl: Duration) -> Self {
        Self {
            store,
            registry,
            ticket_ttl,
            state: Mutex::new(QueueState::default()),
            in_progress: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_searching(&self, user_id: UserId) -> bool {
        self.state().tickets.contains_key(&user_id)
    }

    #[must_use]
    pub fn ticket(&self, user_id: UserId) -> Option<SearchTicket> {
        self.state().tickets.get(&user_id).cloned()
    }

    /// 1-based queue position of `user_id`.
    #[must_use]
    pub fn position(&self, user_id: UserId) -> Option<usize> {
        self.state()
            .order
            .iter()
            .position(|id| *id == user_id)
            .map(|i| i + 1)
    }

    /// Consume a pending re-run request.
    pub fn take_rerun(&self) -> bool {
        self.rerun_requested.swap(false, Ordering::AcqRel)
    }

    /// Add a ticket for `user_id`.
    ///
    /// The caller runs a pairing attempt after a `Queued` outcome.
    ///
    /// # Errors
    ///
    /// `SessionError::Store` if the user lookup or presence write fails. A
    /// failed presence write removes the ticket again.
    #[instrument(skip_all, name = "rv.matching.enqueue", fields(user_id = %user_id))]
    pub async fn enqueue(
        &self,
        user_id: UserId,
        mode: EntryMode,
        preference: MatchPreference,
    ) -> Result<EnqueueOutcome, SessionError> {
        if self.is_searching(user_id) {
            return Ok(EnqueueOutcome::Rejected(EnqueueRejection::AlreadySearching));
        }

        let Some(user) = self.store.get_user(user_id).await? else {
            return Ok(EnqueueOutcome::Rejected(EnqueueRejection::UnknownUser));
        };
        if user.is_banned(Utc::now()) {
            return Ok(EnqueueOutcome::Rejected(EnqueueRejection::Banned));
        }
        if self.in_active_room(&user).await? {
            return Ok(EnqueueOutcome::Rejected(EnqueueRejection::AlreadyInRoom));
        }

        let ticket = SearchTicket {
            user_id,
            mode,
            preference,
            enqueued_at: Instant::now(),
            retry_count: 0,
        };
        let (position, depth) = {
            let mut state = self.state();
            // Re-check after the lookups; another search may have landed.
            if state.tickets.contains_key(&user_id) {
                return Ok(EnqueueOutcome::Rejected(EnqueueRejection::AlreadySearching));
            }
            state.tickets.insert(user_id, ticket.clone());
            state.order.push_back(user_id);
            (state.order.len(), state.order.len())
        };
        metrics::set_queue_depth(depth);

        if let Err(e) = self
            .store
            .set_user_presence(user_id, UserStatus::Searching, None)
            .await
        {
            let mut state = self.state();
            if state.holds(&ticket) {
                state.tickets.remove(&user_id);
                state.order.retain(|id| *id != user_id);
            }
            metrics::set_queue_depth(state.order.len());
            return Err(e.into());
        }

        debug!(
            target: "rv.matching",
            user_id = %user_id,
            mode = mode.as_str(),
            position = position,
            "Ticket queued"
        );
        Ok(EnqueueOutcome::Queued { position })
    }

    async fn in_active_room(&self, user: &UserRecord) -> Result<bool, SessionError> {
        let Some(room_id) = user.current_room_id else {
            return Ok(false);
        };
        Ok(self
            .store
            .get_room(room_id)
            .await?
            .is_some_and(|room| room.is_active()))
    }

    /// Remove `user_id`'s ticket. Idempotent.
    ///
    /// Returns `true` if a ticket was removed, in which case presence is
    /// reset to idle.
    ///
    /// # Errors
    ///
    /// `SessionError::Store` if the presence write fails. The ticket is gone
    /// either way.
    #[instrument(skip_all, name = "rv.matching.dequeue", fields(user_id = %user_id))]
    pub async fn dequeue(&self, user_id: UserId) -> Result<bool, SessionError> {
        let removed = {
            let mut state = self.state();
            let removed = state.tickets.remove(&user_id).is_some();
            if removed {
                state.order.retain(|id| *id != user_id);
            }
            metrics::set_queue_depth(state.order.len());
            removed
        };

        if removed {
            self.store
                .set_user_presence(user_id, UserStatus::Idle, None)
                .await?;
            debug!(target: "rv.matching", user_id = %user_id, "Ticket removed");
        }
        Ok(removed)
    }

    /// Try to match the two oldest tickets.
    ///
    /// Only one attempt runs at a time. A concurrent call returns `Busy` and
    /// asks the running attempt's owner for one more pass ([`Self::take_rerun`]).
    ///
    /// # Errors
    ///
    /// `SessionError::Store` if room creation fails. Both tickets are back at
    /// the front of the queue in that case.
    #[instrument(skip_all, name = "rv.matching.attempt")]
    pub async fn attempt_pairing(&self) -> Result<PairingOutcome, SessionError> {
        let Some(_guard) = PairingGuard::acquire(&self.in_progress) else {
            self.rerun_requested.store(true, Ordering::Release);
            return Ok(PairingOutcome::Busy);
        };

        loop {
            let Some((first, second)) = self.pop_head_pair() else {
                return Ok(PairingOutcome::NotEnoughTickets);
            };

            let users = (
                self.store.get_user(first.user_id).await,
                self.store.get_user(second.user_id).await,
            );
            let (user_a, user_b) = match users {
                (Ok(a), Ok(b)) => (a, b),
                (Err(e), _) | (_, Err(e)) => {
                    self.state().requeue_front(&[first.user_id, second.user_id]);
                    metrics::record_match_attempt("error");
                    return Err(e.into());
                }
            };

            // Tickets may have been cancelled while the users were fetched.
            let (user_a, user_b) = {
                let mut state = self.state();
                let first_live = state.holds(&first) && user_a.is_some();
                let second_live = state.holds(&second) && user_b.is_some();
                if !(first_live && second_live) {
                    for (ticket, user) in [(&first, &user_a), (&second, &user_b)] {
                        if user.is_none() && state.holds(ticket) {
                            state.tickets.remove(&ticket.user_id);
                        }
                    }
                    state.requeue_front(&[first.user_id, second.user_id]);
                    debug!(target: "rv.matching", "Discarded stale ticket from head pair");
                    continue;
                }
                match (user_a, user_b) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                }
            };

            let verdict = if compat::modes_compatible(&first, &second) {
                compat::check(&user_a, &user_b, Utc::now())
            } else {
                Err(Incompatibility::ModeMismatch)
            };

            if let Err(reason) = verdict {
                self.reject_head_pair(&first, &second, reason);
                return Ok(PairingOutcome::Rejected(reason));
            }

            return self.commit(first, second, user_a, user_b).await;
        }
    }

    /// Pop the two oldest tickets, discarding ids with no ticket behind them.
    fn pop_head_pair(&self) -> Option<(SearchTicket, SearchTicket)> {
        let mut state = self.state();
        let mut popped: Vec<SearchTicket> = Vec::with_capacity(2);
        while popped.len() < 2 {
            let Some(user_id) = state.order.pop_front() else {
                for ticket in popped.iter().rev() {
                    state.order.push_front(ticket.user_id);
                }
                return None;
            };
            if let Some(ticket) = state.tickets.get(&user_id) {
                popped.push(ticket.clone());
            }
        }
        let second = popped.pop()?;
        let first = popped.pop()?;
        Some((first, second))
    }

    fn reject_head_pair(&self, first: &SearchTicket, second: &SearchTicket, reason: Incompatibility) {
        let mut state = self.state();
        state.requeue_front(&[first.user_id, second.user_id]);
        for user_id in [first.user_id, second.user_id] {
            if let Some(ticket) = state.tickets.get_mut(&user_id) {
                ticket.retry_count = ticket.retry_count.saturating_add(1);
            }
        }
        let waiting = state.order.len();
        drop(state);

        warn!(
            target: "rv.matching",
            first = %first.user_id,
            second = %second.user_id,
            reason = reason.as_str(),
            first_retries = first.retry_count + 1,
            second_retries = second.retry_count + 1,
            waiting = waiting,
            "Head pair incompatible, queue blocked until one leaves"
        );
        metrics::record_head_blocked(reason.as_str());
        metrics::record_match_attempt("rejected");
    }

    async fn commit(
        &self,
        first: SearchTicket,
        second: SearchTicket,
        user_a: UserRecord,
        user_b: UserRecord,
    ) -> Result<PairingOutcome, SessionError> {
        let entry_mode = compat::resolve_entry_mode(&first, &second);
        let room = match self
            .store
            .create_room(NewRoom {
                user1_id: first.user_id,
                user2_id: second.user_id,
                entry_mode,
            })
            .await
        {
            Ok(room) => room,
            Err(e) => {
                self.state().requeue_front(&[first.user_id, second.user_id]);
                metrics::record_match_attempt("error");
                return Err(e.into());
            }
        };

        // Room creation suspended; either ticket may be gone now.
        let committed = {
            let mut state = self.state();
            if state.holds(&first) && state.holds(&second) {
                state.tickets.remove(&first.user_id);
                state.tickets.remove(&second.user_id);
                true
            } else {
                state.requeue_front(&[first.user_id, second.user_id]);
                false
            }
        };
        metrics::set_queue_depth(self.len());

        if !committed {
            warn!(
                target: "rv.matching",
                room_id = %room.id,
                "Ticket cancelled during room creation, discarding room"
            );
            if let Err(e) = self.store.end_room(room.id, Utc::now()).await {
                warn!(target: "rv.matching", room_id = %room.id, error = %e, "Failed to discard aborted room");
            }
            metrics::record_room_ended(RoomEndReason::MatchAborted.as_str());
            metrics::record_match_attempt("aborted");
            return Ok(PairingOutcome::Aborted);
        }

        for user_id in [first.user_id, second.user_id] {
            if let Err(e) = self
                .store
                .set_user_presence(user_id, UserStatus::Connected, Some(room.id))
                .await
            {
                warn!(target: "rv.matching", user_id = %user_id, error = %e, "Failed to mirror connected presence");
            }
        }

        let icebreaker = icebreaker_for(room.id);
        for (me, partner) in [(first.user_id, &user_b), (second.user_id, &user_a)] {
            let delivered = self.registry.unicast(
                me,
                ServerEvent::MatchFound {
                    room_id: room.id,
                    matched_user: partner.profile(),
                    icebreaker: icebreaker.to_string(),
                    entry_mode: room.entry_mode,
                },
            );
            if !delivered {
                debug!(target: "rv.matching", user_id = %me, "match_found not delivered");
            }
        }

        info!(
            target: "rv.matching",
            room_id = %room.id,
            user1 = %first.user_id,
            user2 = %second.user_id,
            entry_mode = room.entry_mode.as_str(),
            waited_ms = u64::try_from(first.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Match committed"
        );
        metrics::record_match_attempt("matched");

        Ok(PairingOutcome::Matched(MatchedPair {
            room,
            first: first.user_id,
            second: second.user_id,
        }))
    }

    /// Drop tickets older than the TTL as of `now`.
    ///
    /// Owners get presence reset to idle and a `search_expired` notice.
    /// Returns the expired users.
    #[instrument(skip_all, name = "rv.matching.sweep")]
    pub async fn sweep_expired(&self, now: Instant) -> Vec<UserId> {
        let expired: Vec<UserId> = {
            let mut state = self.state();
            let expired: Vec<UserId> = state
                .tickets
                .values()
                .filter(|t| now.saturating_duration_since(t.enqueued_at) >= self.ticket_ttl)
                .map(|t| t.user_id)
                .collect();
            for user_id in &expired {
                state.tickets.remove(user_id);
            }
            state.order.retain(|id| !expired.contains(id));
            metrics::set_queue_depth(state.order.len());
            expired
        };

        for user_id in &expired {
            if let Err(e) = self
                .store
                .set_user_presence(*user_id, UserStatus::Idle, None)
                .await
            {
                warn!(target: "rv.matching", user_id = %user_id, error = %e, "Failed to reset expired presence");
            }
            self.registry.unicast(*user_id, ServerEvent::SearchExpired);
        }

        if !expired.is_empty() {
            info!(target: "rv.matching", expired = expired.len(), "Expired search tickets");
        }
        expired
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{ChannelReceiver, ClientChannel, Outbound};
    use crate::store::MemoryStore;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        queue: MatchingQueue,
        root: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let registry = Arc::new(ConnectionRegistry::new());
            let queue = MatchingQueue::new(
                Arc::clone(&store) as Arc<dyn Store>,
                Arc::clone(&registry),
                Duration::from_secs(300),
            );
            Self {
                store,
                registry,
                queue,
                root: CancellationToken::new(),
            }
        }

        fn connect(&self, name: &str) -> (UserId, ChannelReceiver) {
            let user = self.store.create_user(name);
            let (channel, rx) = ClientChannel::new(user.id, &self.root);
            self.registry.register(channel);
            (user.id, rx)
        }
    }

    fn next_event(rx: &mut ChannelReceiver) -> Option<ServerEvent> {
        match rx.try_recv() {
            Some(Outbound::Event(event)) => Some(event),
            _ => None,
        }
    }

    async fn search(f: &Fixture, user: UserId, mode: EntryMode) -> EnqueueOutcome {
        f.queue
            .enqueue(user, mode, MatchPreference::SameMode)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_chat_users_are_paired() {
        let f = Fixture::new();
        let (a, mut a_rx) = f.connect("alice");
        let (b, mut b_rx) = f.connect("bob");

        search(&f, a, EntryMode::Chat).await;
        search(&f, b, EntryMode::Chat).await;
        let outcome = f.queue.attempt_pairing().await.unwrap();

        let pair = outcome.matched().expect("head pair should match");
        assert_eq!(pair.room.entry_mode, EntryMode::Chat);
        assert_eq!((pair.first, pair.second), (a, b));
        assert!(f.queue.is_empty());

        assert!(matches!(
            next_event(&mut a_rx),
            Some(ServerEvent::MatchFound { room_id, ref matched_user, .. })
                if room_id == pair.room.id && matched_user.id == b
        ));
        assert!(matches!(
            next_event(&mut b_rx),
            Some(ServerEvent::MatchFound { room_id, ref matched_user, .. })
                if room_id == pair.room.id && matched_user.id == a
        ));

        let stored = f.store.get_user(a).await.unwrap().unwrap();
        assert_eq!(stored.status, UserStatus::Connected);
        assert_eq!(stored.current_room_id, Some(pair.room.id));
    }

    #[tokio::test]
    async fn test_duplicate_search_is_rejected() {
        let f = Fixture::new();
        let (a, _rx) = f.connect("alice");

        search(&f, a, EntryMode::Chat).await;
        let second = search(&f, a, EntryMode::Voice).await;

        assert_eq!(
            second,
            EnqueueOutcome::Rejected(EnqueueRejection::AlreadySearching)
        );
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_user_in_active_room_cannot_search() {
        let f = Fixture::new();
        let (a, _a_rx) = f.connect("alice");
        let (b, _b_rx) = f.connect("bob");
        let room = f
            .store
            .create_room(NewRoom {
                user1_id: a,
                user2_id: b,
                entry_mode: EntryMode::Chat,
            })
            .await
            .unwrap();
        f.store
            .set_user_presence(a, UserStatus::Connected, Some(room.id))
            .await
            .unwrap();

        assert_eq!(
            search(&f, a, EntryMode::Chat).await,
            EnqueueOutcome::Rejected(EnqueueRejection::AlreadyInRoom)
        );
    }

    #[tokio::test]
    async fn test_banned_and_unknown_users_are_rejected() {
        let f = Fixture::new();
        let mut banned = f.store.create_user("mallory");
        banned.banned_until = Some(Utc::now() + chrono::Duration::days(1));
        f.store.put_user(banned.clone());

        assert_eq!(
            search(&f, banned.id, EntryMode::Chat).await,
            EnqueueOutcome::Rejected(EnqueueRejection::Banned)
        );
        assert_eq!(
            search(&f, UserId(4040), EntryMode::Chat).await,
            EnqueueOutcome::Rejected(EnqueueRejection::UnknownUser)
        );
    }

    #[tokio::test]
    async fn test_dequeue_is_idempotent_and_resets_presence() {
        let f = Fixture::new();
        let (a, _rx) = f.connect("alice");
        search(&f, a, EntryMode::Chat).await;
        assert_eq!(
            f.store.get_user(a).await.unwrap().unwrap().status,
            UserStatus::Searching
        );

        assert!(f.queue.dequeue(a).await.unwrap());
        assert!(!f.queue.dequeue(a).await.unwrap());

        assert!(!f.queue.is_searching(a));
        assert_eq!(
            f.store.get_user(a).await.unwrap().unwrap().status,
            UserStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_incompatible_head_blocks_compatible_tail() {
        let f = Fixture::new();
        let (a, _a) = f.connect("alice");
        let (b, _b) = f.connect("bob");
        let (c, _c) = f.connect("carol");

        search(&f, a, EntryMode::Chat).await;
        search(&f, b, EntryMode::Voice).await;
        search(&f, c, EntryMode::Chat).await;

        let outcome = f.queue.attempt_pairing().await.unwrap();

        assert_eq!(
            outcome,
            PairingOutcome::Rejected(Incompatibility::ModeMismatch)
        );
        // a and c could pair, but the head pair blocks them.
        assert_eq!(f.queue.position(a), Some(1));
        assert_eq!(f.queue.position(b), Some(2));
        assert_eq!(f.queue.position(c), Some(3));
        assert_eq!(f.queue.ticket(a).unwrap().retry_count, 1);
        assert_eq!(f.queue.ticket(b).unwrap().retry_count, 1);
        assert_eq!(f.queue.ticket(c).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_head_unblocks_when_one_leaves() {
        let f = Fixture::new();
        let (a, _a) = f.connect("alice");
        let (b, _b) = f.connect("bob");
        let (c, _c) = f.connect("carol");

        search(&f, a, EntryMode::Chat).await;
        search(&f, b, EntryMode::Voice).await;
        search(&f, c, EntryMode::Chat).await;
        f.queue.attempt_pairing().await.unwrap();

        f.queue.dequeue(b).await.unwrap();
        let outcome = f.queue.attempt_pairing().await.unwrap();

        assert!(matches!(
            outcome,
            PairingOutcome::Matched(MatchedPair { first, second, .. }) if first == a && second == c
        ));
    }

    #[tokio::test]
    async fn test_single_ticket_is_not_enough() {
        let f = Fixture::new();
        let (a, _a) = f.connect("alice");
        search(&f, a, EntryMode::Chat).await;

        assert_eq!(
            f.queue.attempt_pairing().await.unwrap(),
            PairingOutcome::NotEnoughTickets
        );
        assert_eq!(f.queue.position(a), Some(1), "lone ticket stays queued");
    }

    #[tokio::test]
    async fn test_concurrent_attempt_is_busy_and_requests_rerun() {
        let f = Fixture::new();
        let _guard = PairingGuard::acquire(&f.queue.in_progress).unwrap();

        assert_eq!(
            f.queue.attempt_pairing().await.unwrap(),
            PairingOutcome::Busy
        );
        assert!(f.queue.take_rerun());
        assert!(!f.queue.take_rerun());
    }

    #[tokio::test]
    async fn test_voice_with_any_preference_resolves_to_voice() {
        let f = Fixture::new();
        let (a, _a) = f.connect("alice");
        let (b, _b) = f.connect("bob");

        f.queue
            .enqueue(a, EntryMode::Chat, MatchPreference::Any)
            .await
            .unwrap();
        search(&f, b, EntryMode::Voice).await;

        let outcome = f.queue.attempt_pairing().await.unwrap();
        assert!(matches!(
            outcome,
            PairingOutcome::Matched(MatchedPair { ref room, .. }) if room.entry_mode == EntryMode::Voice
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_old_tickets_only() {
        let f = Fixture::new();
        let (a, mut a_rx) = f.connect("alice");
        search(&f, a, EntryMode::Chat).await;

        tokio::time::advance(Duration::from_secs(200)).await;
        let (b, _b_rx) = f.connect("bob");
        search(&f, b, EntryMode::Voice).await;

        tokio::time::advance(Duration::from_secs(100)).await;
        let expired = f.queue.sweep_expired(Instant::now()).await;

        assert_eq!(expired, vec![a]);
        assert!(!f.queue.is_searching(a));
        assert!(f.queue.is_searching(b));
        assert_eq!(next_event(&mut a_rx), Some(ServerEvent::SearchExpired));
        assert_eq!(
            f.store.get_user(a).await.unwrap().unwrap().status,
            UserStatus::Idle
        );
    }

    #[test]
    fn test_icebreaker_is_stable_per_room() {
        assert_eq!(icebreaker_for(RoomId(3)), icebreaker_for(RoomId(3)));
        assert_ne!(icebreaker_for(RoomId(1)), icebreaker_for(RoomId(2)));
        assert!(!icebreaker_for(RoomId(-7)).is_empty());
    }
}
