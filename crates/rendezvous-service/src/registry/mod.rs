//! Connection Registry.
//!
//! Maps each user to their single live [`ClientChannel`] and to the room
//! whose events they receive. The registry is process-wide and shared by
//! every handler, so all state sits behind one mutex that is never held
//! across an await.
//!
//! # Invariants
//!
//! - At most one channel per user; the newest registration wins
//! - At most one room membership per user
//! - A room entry exists only while it has members (emptying it does not
//!   end the persisted room)

pub mod channel;

pub use channel::{ChannelReceiver, ClientChannel, DeliveryError, Outbound};

use async_trait::async_trait;
use common::types::{ConnectionId, RoomId, UserId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::observability::metrics;
use crate::protocol::ServerEvent;

/// Bounded-time delivery with linear backoff, used for signaling relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayPolicy {
    pub send_timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

/// Work that must finish before a room's channels are severed.
///
/// Supplied by the caller of [`ConnectionRegistry::force_close`] so the
/// registry stays unaware of calls and negotiation.
#[async_trait]
pub trait RoomTeardown: Send + Sync {
    async fn before_room_close(&self, room_id: RoomId);
}

#[derive(Debug, Default)]
struct RegistryState {
    channels: HashMap<UserId, ClientChannel>,
    rooms: HashMap<RoomId, BTreeSet<UserId>>,
    memberships: HashMap<UserId, RoomId>,
}

impl RegistryState {
    /// Drop `user_id` from whatever room they are in.
    fn remove_membership(&mut self, user_id: UserId) -> Option<RoomId> {
        let room_id = self.memberships.remove(&user_id)?;
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(&user_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        Some(room_id)
    }
}

/// Result of [`ConnectionRegistry::join_room`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    /// The channel is closed or has been replaced by a newer connection.
    Stale,
}

/// Process-wide map of live channels and room membership.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `channel` as its user's live channel.
    ///
    /// A previous channel for the same user is sent `connection_replaced`
    /// and then severed. Returns the replaced channel, if any.
    pub fn register(&self, channel: ClientChannel) -> Option<ClientChannel> {
        let user_id = channel.user_id();
        let connection_id = channel.connection_id();

        let (previous, count) = {
            let mut state = self.state();
            let previous = state.channels.insert(user_id, channel);
            (previous, state.channels.len())
        };
        metrics::set_connections_active(count);

        let previous = previous.filter(|p| p.connection_id() != connection_id)?;

        info!(
            target: "rv.registry",
            user_id = %user_id,
            old_connection = %previous.connection_id(),
            new_connection = %connection_id,
            "Replacing existing connection"
        );
        let _ = previous.deliver(ServerEvent::ConnectionReplaced {
            message: "Signed in from another connection".to_string(),
        });
        previous.sever("replaced");
        Some(previous)
    }

    /// Remove `user_id`'s channel if it is still `connection_id`.
    ///
    /// Returns `false` when the user has since registered a newer
    /// connection (or none at all), leaving the registry untouched.
    pub fn deregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut state = self.state();
            let is_current = state
                .channels
                .get(&user_id)
                .is_some_and(|c| c.connection_id() == connection_id);
            if is_current {
                state.channels.remove(&user_id);
                state.remove_membership(user_id);
            }
            (is_current, state.channels.len())
        };

        if removed {
            metrics::set_connections_active(count);
            debug!(
                target: "rv.registry",
                user_id = %user_id,
                connection_id = %connection_id,
                "Connection deregistered"
            );
        }
        removed
    }

    /// Add `user_id` to `room_id`, registering `channel` if the user has no
    /// channel yet. Leaves any previous room.
    ///
    /// A dead channel, or one that is not the user's current channel, is
    /// refused with [`JoinOutcome::Stale`] and nothing changes.
    pub fn join_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
        channel: &ClientChannel,
    ) -> JoinOutcome {
        if !channel.is_alive() {
            return JoinOutcome::Stale;
        }

        let mut state = self.state();
        match state.channels.get(&user_id) {
            Some(current) if current.connection_id() != channel.connection_id() => {
                debug!(
                    target: "rv.registry",
                    user_id = %user_id,
                    connection_id = %channel.connection_id(),
                    current_connection = %current.connection_id(),
                    "Refusing join from a replaced connection"
                );
                return JoinOutcome::Stale;
            }
            Some(_) => {}
            None => {
                state.channels.insert(user_id, channel.clone());
                metrics::set_connections_active(state.channels.len());
            }
        }

        if state.memberships.get(&user_id) == Some(&room_id) {
            return JoinOutcome::AlreadyMember;
        }
        if let Some(previous) = state.remove_membership(user_id) {
            debug!(
                target: "rv.registry",
                user_id = %user_id,
                previous_room = %previous,
                "Leaving previous room on join"
            );
        }
        state.memberships.insert(user_id, room_id);
        state.rooms.entry(room_id).or_default().insert(user_id);
        debug!(target: "rv.registry", room_id = %room_id, user_id = %user_id, "Joined room");
        JoinOutcome::Joined
    }

    /// Remove `user_id` from `room_id`. Returns `true` if they were a member.
    pub fn leave_room(&self, room_id: RoomId, user_id: UserId) -> bool {
        let mut state = self.state();
        if state.memberships.get(&user_id) != Some(&room_id) {
            return false;
        }
        state.remove_membership(user_id);
        true
    }

    /// Whether `user_id` is a member of `room_id` with a live channel.
    #[must_use]
    pub fn is_in_room(&self, room_id: RoomId, user_id: UserId) -> bool {
        let state = self.state();
        state.memberships.get(&user_id) == Some(&room_id)
            && state.channels.get(&user_id).is_some_and(ClientChannel::is_alive)
    }

    #[must_use]
    pub fn room_of(&self, user_id: UserId) -> Option<RoomId> {
        self.state().memberships.get(&user_id).copied()
    }

    /// Members of `room_id` in ascending id order.
    #[must_use]
    pub fn members(&self, room_id: RoomId) -> Vec<UserId> {
        self.state()
            .rooms
            .get(&room_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn channel(&self, user_id: UserId) -> Option<ClientChannel> {
        self.state().channels.get(&user_id).cloned()
    }

    #[must_use]
    pub fn has_live_channel(&self, user_id: UserId) -> bool {
        self.state()
            .channels
            .get(&user_id)
            .is_some_and(ClientChannel::is_alive)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state().channels.len()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.state().rooms.len()
    }

    /// Deliver to one channel, lazily dropping it if it turns out dead.
    fn deliver_to(&self, channel: &ClientChannel, event: ServerEvent) -> bool {
        let kind = event.kind();
        match channel.deliver(event) {
            Ok(()) => true,
            Err(DeliveryError::Closed) => {
                debug!(
                    target: "rv.registry",
                    user_id = %channel.user_id(),
                    event = kind,
                    "Dropping dead channel"
                );
                self.deregister(channel.user_id(), channel.connection_id());
                false
            }
            Err(e) => {
                warn!(
                    target: "rv.registry",
                    user_id = %channel.user_id(),
                    event = kind,
                    error = %e,
                    "Delivery failed"
                );
                false
            }
        }
    }

    /// Send `event` to `user_id`. Returns `false` if there is no live channel.
    pub fn unicast(&self, user_id: UserId, event: ServerEvent) -> bool {
        match self.channel(user_id) {
            Some(channel) => self.deliver_to(&channel, event),
            None => false,
        }
    }

    /// Send `event` to `user_id` with bounded waits and retries.
    ///
    /// The channel is looked up again on every attempt so a reconnect during
    /// the backoff still receives the event.
    pub async fn unicast_with_retry(
        &self,
        user_id: UserId,
        event: ServerEvent,
        policy: RelayPolicy,
    ) -> Result<(), DeliveryError> {
        let mut last_error = DeliveryError::Closed;

        for attempt in 1..=policy.attempts.max(1) {
            if let Some(channel) = self.channel(user_id) {
                match channel
                    .deliver_timeout(event.clone(), policy.send_timeout)
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        if e == DeliveryError::Closed {
                            self.deregister(user_id, channel.connection_id());
                        }
                        last_error = e;
                    }
                }
            }

            warn!(
                target: "rv.registry",
                user_id = %user_id,
                event = event.kind(),
                attempt = attempt,
                max_attempts = policy.attempts,
                error = %last_error,
                "Relay delivery attempt failed"
            );

            if attempt < policy.attempts {
                tokio::time::sleep(policy.backoff * attempt).await;
            }
        }

        Err(last_error)
    }

    /// Send `event` to every member of `room_id` except `exclude`.
    ///
    /// A failed delivery never stops the others. Returns the number of
    /// members the event was queued for.
    pub fn broadcast(&self, room_id: RoomId, event: ServerEvent, exclude: Option<UserId>) -> usize {
        let targets: Vec<ClientChannel> = {
            let state = self.state();
            state
                .rooms
                .get(&room_id)
                .map(|members| {
                    members
                        .iter()
                        .filter(|id| Some(**id) != exclude)
                        .filter_map(|id| state.channels.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        let kind = event.kind();
        let delivered = targets
            .iter()
            .filter(|channel| self.deliver_to(channel, event.clone()))
            .count();

        if delivered == 0 {
            debug!(
                target: "rv.registry",
                room_id = %room_id,
                event = kind,
                "Broadcast reached no members"
            );
        }
        delivered
    }

    /// Ordered teardown of a room's live connections.
    ///
    /// 1. `teardown` ends the room's call and negotiation timers
    /// 2. `room_closed` is broadcast to every member
    /// 3. Every member's channel is severed and removed
    /// 4. The membership entry is discarded
    ///
    /// Returns the number of members that were severed.
    pub async fn force_close(&self, room_id: RoomId, teardown: &dyn RoomTeardown) -> usize {
        teardown.before_room_close(room_id).await;

        self.broadcast(
            room_id,
            ServerEvent::RoomClosed {
                room_id,
                force_close: true,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            None,
        );

        let (severed, count): (Vec<ClientChannel>, usize) = {
            let mut state = self.state();
            let members = state.rooms.remove(&room_id).unwrap_or_default();
            let severed = members
                .iter()
                .filter_map(|user_id| {
                    state.memberships.remove(user_id);
                    state.channels.remove(user_id)
                })
                .collect();
            (severed, state.channels.len())
        };

        for channel in &severed {
            channel.sever("room closed");
        }
        metrics::set_connections_active(count);

        info!(
            target: "rv.registry",
            room_id = %room_id,
            severed = severed.len(),
            "Room force-closed"
        );
        severed.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn connect(registry: &ConnectionRegistry, id: i64) -> (ClientChannel, ChannelReceiver) {
        let root = CancellationToken::new();
        let (channel, rx) = ClientChannel::new(UserId(id), &root);
        registry.register(channel.clone());
        (channel, rx)
    }

    fn drain(rx: &mut ChannelReceiver) -> Vec<Outbound> {
        std::iter::from_fn(|| rx.try_recv()).collect()
    }

    #[tokio::test]
    async fn test_register_replaces_and_severs_previous_channel() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = connect(&registry, 1);
        let (second, _second_rx) = connect(&registry, 1);

        assert!(!first.is_alive());
        assert!(second.is_alive());
        assert_eq!(
            registry.channel(UserId(1)).unwrap().connection_id(),
            second.connection_id()
        );

        let first_events = drain(&mut first_rx);
        assert!(matches!(
            first_events.first(),
            Some(Outbound::Event(ServerEvent::ConnectionReplaced { .. }))
        ));
        assert!(matches!(first_events.last(), Some(Outbound::Close { .. })));
    }

    #[tokio::test]
    async fn test_registering_same_channel_twice_is_not_a_replacement() {
        let registry = ConnectionRegistry::new();
        let (channel, _rx) = connect(&registry, 1);

        assert!(registry.register(channel.clone()).is_none());
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn test_stale_deregister_keeps_newer_connection() {
        let registry = ConnectionRegistry::new();
        let (first, _first_rx) = connect(&registry, 1);
        let (_second, _second_rx) = connect(&registry, 1);

        assert!(!registry.deregister(UserId(1), first.connection_id()));
        assert!(registry.has_live_channel(UserId(1)));
    }

    #[tokio::test]
    async fn test_join_and_leave_are_idempotent() {
        let registry = ConnectionRegistry::new();
        let (channel, _rx) = connect(&registry, 1);

        assert_eq!(
            registry.join_room(RoomId(5), UserId(1), &channel),
            JoinOutcome::Joined
        );
        assert_eq!(
            registry.join_room(RoomId(5), UserId(1), &channel),
            JoinOutcome::AlreadyMember
        );
        assert_eq!(registry.members(RoomId(5)), vec![UserId(1)]);

        assert!(registry.leave_room(RoomId(5), UserId(1)));
        assert!(!registry.leave_room(RoomId(5), UserId(1)));
        assert_eq!(registry.room_count(), 0, "emptied room entry is discarded");
    }

    #[tokio::test]
    async fn test_join_moves_user_between_rooms() {
        let registry = ConnectionRegistry::new();
        let (channel, _rx) = connect(&registry, 1);

        registry.join_room(RoomId(5), UserId(1), &channel);
        registry.join_room(RoomId(6), UserId(1), &channel);

        assert!(registry.members(RoomId(5)).is_empty());
        assert_eq!(registry.room_of(UserId(1)), Some(RoomId(6)));
    }

    #[tokio::test]
    async fn test_join_registers_channel_for_unregistered_user() {
        let registry = ConnectionRegistry::new();
        let root = CancellationToken::new();
        let (channel, _rx) = ClientChannel::new(UserId(1), &root);

        assert_eq!(
            registry.join_room(RoomId(5), UserId(1), &channel),
            JoinOutcome::Joined
        );
        assert!(registry.is_in_room(RoomId(5), UserId(1)));
    }

    #[tokio::test]
    async fn test_join_from_replaced_connection_keeps_newer_one() {
        let registry = ConnectionRegistry::new();
        let (old, _old_rx) = connect(&registry, 1);
        let (fresh, _fresh_rx) = connect(&registry, 1);
        assert!(!old.is_alive());

        assert_eq!(
            registry.join_room(RoomId(9), UserId(1), &old),
            JoinOutcome::Stale
        );

        assert!(fresh.is_alive());
        assert_eq!(
            registry.channel(UserId(1)).map(|c| c.connection_id()),
            Some(fresh.connection_id())
        );
        assert!(registry.has_live_channel(UserId(1)));
        assert_eq!(registry.room_of(UserId(1)), None);
    }

    #[tokio::test]
    async fn test_join_never_displaces_a_different_live_connection() {
        let registry = ConnectionRegistry::new();
        let (current, _current_rx) = connect(&registry, 1);
        let root = CancellationToken::new();
        let (other, _other_rx) = ClientChannel::new(UserId(1), &root);

        assert_eq!(
            registry.join_room(RoomId(5), UserId(1), &other),
            JoinOutcome::Stale
        );
        assert!(current.is_alive());
        assert!(registry.members(RoomId(5)).is_empty());
    }

    #[tokio::test]
    async fn test_unicast_without_channel_returns_false() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.unicast(UserId(9), ServerEvent::SearchCancelled));
    }

    #[tokio::test]
    async fn test_unicast_lazily_deregisters_dead_channel() {
        let registry = ConnectionRegistry::new();
        let (channel, rx) = connect(&registry, 1);
        registry.join_room(RoomId(5), UserId(1), &channel);
        drop(rx);

        assert!(!registry.unicast(UserId(1), ServerEvent::SearchCancelled));
        assert!(registry.channel(UserId(1)).is_none());
        assert!(registry.members(RoomId(5)).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_and_survives_dead_member() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_rx) = connect(&registry, 1);
        let (b, b_rx) = connect(&registry, 2);
        let (c, mut c_rx) = connect(&registry, 3);
        for (id, ch) in [(1, &a), (2, &b), (3, &c)] {
            registry.join_room(RoomId(5), UserId(id), ch);
        }
        drop(b_rx);

        let delivered = registry.broadcast(RoomId(5), ServerEvent::SearchCancelled, Some(UserId(3)));

        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut a_rx).len(), 1);
        assert!(drain(&mut c_rx).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_room_is_zero() {
        let registry = ConnectionRegistry::new();
        assert_eq!(
            registry.broadcast(RoomId(1), ServerEvent::SearchCancelled, None),
            0
        );
    }

    struct RecordingTeardown {
        calls: Arc<Mutex<Vec<RoomId>>>,
        registry: Arc<ConnectionRegistry>,
        saw_members: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl RoomTeardown for RecordingTeardown {
        async fn before_room_close(&self, room_id: RoomId) {
            self.calls.lock().unwrap().push(room_id);
            *self.saw_members.lock().unwrap() = self.registry.members(room_id).len();
        }
    }

    #[tokio::test]
    async fn test_force_close_runs_teardown_then_notice_then_sever() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, mut a_rx) = connect(&registry, 1);
        let (b, mut b_rx) = connect(&registry, 2);
        registry.join_room(RoomId(5), UserId(1), &a);
        registry.join_room(RoomId(5), UserId(2), &b);

        let teardown = RecordingTeardown {
            calls: Arc::new(Mutex::new(Vec::new())),
            registry: Arc::clone(&registry),
            saw_members: Arc::new(Mutex::new(0)),
        };

        let severed = registry.force_close(RoomId(5), &teardown).await;

        assert_eq!(severed, 2);
        assert_eq!(*teardown.calls.lock().unwrap(), vec![RoomId(5)]);
        assert_eq!(
            *teardown.saw_members.lock().unwrap(),
            2,
            "teardown runs while members are still connected"
        );

        for rx in [&mut a_rx, &mut b_rx] {
            let events = drain(rx);
            assert!(matches!(
                events.first(),
                Some(Outbound::Event(ServerEvent::RoomClosed {
                    force_close: true,
                    ..
                }))
            ));
            assert!(matches!(events.last(), Some(Outbound::Close { .. })));
        }

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_with_retry_gives_up_after_attempts() {
        let registry = ConnectionRegistry::new();
        let policy = RelayPolicy {
            send_timeout: Duration::from_millis(10),
            attempts: 3,
            backoff: Duration::from_millis(100),
        };

        let result = registry
            .unicast_with_retry(UserId(1), ServerEvent::SearchCancelled, policy)
            .await;

        assert_eq!(result, Err(DeliveryError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unicast_with_retry_reaches_reconnected_user() {
        let registry = Arc::new(ConnectionRegistry::new());
        let policy = RelayPolicy {
            send_timeout: Duration::from_millis(10),
            attempts: 3,
            backoff: Duration::from_millis(100),
        };

        let relay = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .unicast_with_retry(UserId(1), ServerEvent::SearchCancelled, policy)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_channel, mut rx) = connect(&registry, 1);

        assert_eq!(relay.await.unwrap(), Ok(()));
        assert_eq!(rx.recv().await, Some(Outbound::Event(ServerEvent::SearchCancelled)));
    }
}
