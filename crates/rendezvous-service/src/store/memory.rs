//! In-process `Store` implementation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CallId, MessageId, RoomId, UserId};

use super::Store;
use crate::errors::StoreError;
use crate::models::{
    CallSession, CallSettings, CallStatus, CallUpdate, ChatMessage, NewRoom, Room, UserRecord,
    UserStatus,
};

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<UserId, UserRecord>,
    rooms: HashMap<RoomId, Room>,
    calls: HashMap<CallId, CallSession>,
    messages: Vec<ChatMessage>,
    settings: HashMap<UserId, CallSettings>,
    next_user_id: i64,
    next_room_id: i64,
    next_call_id: i64,
    next_message_id: i64,
}

/// `Store` held entirely in memory. Data is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an idle user with no preferences and return it.
    pub fn create_user(&self, username: &str) -> UserRecord {
        let mut state = self.state();
        state.next_user_id += 1;
        let user = UserRecord {
            id: UserId(state.next_user_id),
            username: username.to_string(),
            nickname: None,
            avatar_url: None,
            gender: None,
            preferred_gender: Vec::new(),
            banned_until: None,
            status: UserStatus::Idle,
            current_room_id: None,
        };
        state.users.insert(user.id, user.clone());
        user
    }

    /// Insert or replace a user record as-is.
    pub fn put_user(&self, user: UserRecord) {
        let mut state = self.state();
        state.next_user_id = state.next_user_id.max(user.id.0);
        state.users.insert(user.id, user);
    }

    pub fn put_call_settings(&self, user_id: UserId, settings: CallSettings) {
        self.state().settings.insert(user_id, settings);
    }

    /// Number of persisted call sessions (any status).
    #[must_use]
    pub fn call_session_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Messages persisted for `room_id`, oldest first.
    #[must_use]
    pub fn messages_in(&self, room_id: RoomId) -> Vec<ChatMessage> {
        self.state()
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect()
    }
}

fn room_not_found(room_id: RoomId) -> StoreError {
    StoreError::NotFound(format!("room {room_id}"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.state().users.get(&user_id).cloned())
    }

    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .state()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn set_user_presence(
        &self,
        user_id: UserId,
        status: UserStatus,
        current_room_id: Option<RoomId>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.status = status;
        user.current_room_id = current_room_id;
        Ok(())
    }

    async fn create_room(&self, new_room: NewRoom) -> Result<Room, StoreError> {
        let mut state = self.state();
        state.next_room_id += 1;
        let room = Room {
            id: RoomId(state.next_room_id),
            user1_id: new_room.user1_id,
            user2_id: new_room.user2_id,
            entry_mode: new_room.entry_mode,
            current_mode: new_room.entry_mode,
            start_time: Utc::now(),
            end_time: None,
            keep_active: false,
            user1_keep: false,
            user2_keep: false,
            reveal_level: 0,
            last_message_time: None,
        };
        state.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.state().rooms.get(&room_id).cloned())
    }

    async fn end_room(
        &self,
        room_id: RoomId,
        ended_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| room_not_found(room_id))?;
        if room.end_time.is_some() {
            return Ok(false);
        }
        room.end_time = Some(ended_at);
        Ok(true)
    }

    async fn set_keep_flag(&self, room_id: RoomId, user_id: UserId) -> Result<Room, StoreError> {
        let mut state = self.state();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| room_not_found(room_id))?;
        if room.user1_id == user_id {
            room.user1_keep = true;
        } else if room.user2_id == user_id {
            room.user2_keep = true;
        } else {
            return Err(StoreError::NotFound(format!(
                "user {user_id} in room {room_id}"
            )));
        }
        if room.user1_keep && room.user2_keep {
            room.keep_active = true;
        }
        Ok(room.clone())
    }

    async fn set_room_keep_active(&self, room_id: RoomId, keep: bool) -> Result<(), StoreError> {
        let mut state = self.state();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| room_not_found(room_id))?;
        room.keep_active = keep;
        Ok(())
    }

    async fn set_reveal_level(&self, room_id: RoomId, level: u8) -> Result<(), StoreError> {
        let mut state = self.state();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| room_not_found(room_id))?;
        room.reveal_level = level;
        Ok(())
    }

    async fn create_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| room_not_found(room_id))?;
        room.last_message_time = Some(now);

        state.next_message_id += 1;
        let message = ChatMessage {
            id: MessageId(state.next_message_id),
            room_id,
            user_id,
            content: content.to_string(),
            created_at: now,
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn create_call_session(
        &self,
        room_id: RoomId,
        caller_id: UserId,
        callee_id: UserId,
    ) -> Result<CallSession, StoreError> {
        let mut state = self.state();
        state.next_call_id += 1;
        let session = CallSession {
            id: CallId(state.next_call_id),
            room_id,
            caller_id,
            callee_id,
            status: CallStatus::Initiated,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            duration_secs: None,
            end_reason: None,
        };
        state.calls.insert(session.id, session.clone());
        Ok(session)
    }

    async fn update_call_session(
        &self,
        call_id: CallId,
        update: CallUpdate,
    ) -> Result<CallSession, StoreError> {
        let mut state = self.state();
        let session = state
            .calls
            .get_mut(&call_id)
            .ok_or_else(|| StoreError::NotFound(format!("call {call_id}")))?;
        if let Some(status) = update.status {
            session.status = status;
        }
        if update.answered_at.is_some() {
            session.answered_at = update.answered_at;
        }
        if update.ended_at.is_some() {
            session.ended_at = update.ended_at;
        }
        if update.duration_secs.is_some() {
            session.duration_secs = update.duration_secs;
        }
        if update.end_reason.is_some() {
            session.end_reason = update.end_reason;
        }
        Ok(session.clone())
    }

    async fn get_call_session(&self, call_id: CallId) -> Result<Option<CallSession>, StoreError> {
        Ok(self.state().calls.get(&call_id).cloned())
    }

    async fn get_call_settings(&self, user_id: UserId) -> Result<CallSettings, StoreError> {
        Ok(self
            .state()
            .settings
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }
}
