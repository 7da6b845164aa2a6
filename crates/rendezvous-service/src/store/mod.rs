//! Persistence collaborator.
//!
//! The orchestration core never talks to a database directly. Everything it
//! persists goes through [`Store`], so a SQL backend can be plugged in by the
//! HTTP layer that owns the schema. [`MemoryStore`] backs development runs and
//! tests.
//!
//! Every failure surfaces as [`StoreError`], which callers map to
//! `SYSTEM_ERROR` on the wire.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{CallId, RoomId, UserId};

use crate::errors::StoreError;
use crate::models::{
    CallSession, CallSettings, CallUpdate, ChatMessage, NewRoom, Room, UserRecord, UserStatus,
};

/// CRUD over users, rooms, messages, call sessions and call settings.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>, StoreError>;

    async fn find_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserRecord>, StoreError>;

    /// Mirror a presence transition onto the user record.
    async fn set_user_presence(
        &self,
        user_id: UserId,
        status: UserStatus,
        current_room_id: Option<RoomId>,
    ) -> Result<(), StoreError>;

    async fn create_room(&self, new_room: NewRoom) -> Result<Room, StoreError>;

    async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError>;

    /// Set `end_time` only while it is still null.
    ///
    /// Returns `true` if this call performed the transition and `false` if the
    /// room had already ended.
    async fn end_room(&self, room_id: RoomId, ended_at: DateTime<Utc>)
        -> Result<bool, StoreError>;

    /// Record one participant's keep-active opt-in. Sets the room-level flag
    /// once both participants have opted in. Returns the updated room.
    async fn set_keep_flag(&self, room_id: RoomId, user_id: UserId) -> Result<Room, StoreError>;

    async fn set_room_keep_active(&self, room_id: RoomId, keep: bool) -> Result<(), StoreError>;

    async fn set_reveal_level(&self, room_id: RoomId, level: u8) -> Result<(), StoreError>;

    /// Persist a chat message and bump the room's last-message time.
    async fn create_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        content: &str,
    ) -> Result<ChatMessage, StoreError>;

    /// Persist a new call session in `initiated` state.
    async fn create_call_session(
        &self,
        room_id: RoomId,
        caller_id: UserId,
        callee_id: UserId,
    ) -> Result<CallSession, StoreError>;

    async fn update_call_session(
        &self,
        call_id: CallId,
        update: CallUpdate,
    ) -> Result<CallSession, StoreError>;

    async fn get_call_session(&self, call_id: CallId) -> Result<Option<CallSession>, StoreError>;

    /// Settings for `user_id`, or defaults when the user has none.
    async fn get_call_settings(&self, user_id: UserId) -> Result<CallSettings, StoreError>;
}
