//! In-room chat: messages, typing indicators and mutual "reveal" likes.

use common::types::{RoomId, UserId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument};

use crate::errors::SessionError;
use crate::models::{ChatMessage, Room, UserRecord, Vote};
use crate::protocol::ServerEvent;
use crate::registry::ConnectionRegistry;
use crate::store::Store;

/// Highest reveal level a room can reach.
pub const MAX_REVEAL_LEVEL: u8 = 2;

pub struct ChatService {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    max_message_length: usize,
    /// Users who answered "yes" to the room's current like round.
    likes: Mutex<HashMap<RoomId, BTreeSet<UserId>>>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        max_message_length: usize,
    ) -> Self {
        Self {
            store,
            registry,
            max_message_length,
            likes: Mutex::new(HashMap::new()),
        }
    }

    fn likes(&self) -> MutexGuard<'_, HashMap<RoomId, BTreeSet<UserId>>> {
        self.likes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist and broadcast a chat message.
    ///
    /// # Errors
    ///
    /// `Validation` for empty or oversized content, `Store` if the write fails.
    #[instrument(skip_all, name = "rv.chat.message", fields(room_id = %room_id, user_id = %sender.id))]
    pub async fn send_message(
        &self,
        room_id: RoomId,
        sender: &UserRecord,
        content: &str,
    ) -> Result<ChatMessage, SessionError> {
        let length = content.chars().count();
        if content.trim().is_empty() || length > self.max_message_length {
            return Err(SessionError::Validation(format!(
                "Message must be between 1 and {} characters",
                self.max_message_length
            )));
        }

        let message = self
            .store
            .create_message(room_id, sender.id, content)
            .await?;
        self.registry.broadcast(
            room_id,
            ServerEvent::Message {
                message_id: message.id,
                room_id,
                user_id: sender.id,
                username: sender.username.clone(),
                content: message.content.clone(),
                timestamp: message.created_at.timestamp_millis(),
            },
            None,
        );
        Ok(message)
    }

    /// Forward a typing indicator to the other participant only.
    pub fn typing(&self, room: &Room, sender: &UserRecord, started: bool) {
        let Some(other) = room.other_participant(sender.id) else {
            return;
        };
        let event = if started {
            ServerEvent::Typing {
                user_id: sender.id,
                username: sender.username.clone(),
            }
        } else {
            ServerEvent::StopTyping { user_id: sender.id }
        };
        self.registry.unicast(other, event);
    }

    /// Record a like answer. Returns the new reveal level when both
    /// participants said "yes" and the level went up.
    ///
    /// # Errors
    ///
    /// `NotFound` if the room is gone, `Store` on persistence failure.
    #[instrument(skip_all, name = "rv.chat.like", fields(room_id = %room.id, user_id = %user_id))]
    pub async fn like_response(
        &self,
        room: &Room,
        user_id: UserId,
        response: Vote,
    ) -> Result<Option<u8>, SessionError> {
        let both = {
            let mut likes = self.likes();
            match response {
                Vote::No => {
                    likes.remove(&room.id);
                    debug!(target: "rv.chat", room_id = %room.id, "Like round reset");
                    return Ok(None);
                }
                Vote::Yes => {
                    let pending = likes.entry(room.id).or_default();
                    pending.insert(user_id);
                    let both = room.participants().iter().all(|p| pending.contains(p));
                    if both {
                        likes.remove(&room.id);
                    }
                    both
                }
            }
        };
        if !both {
            return Ok(None);
        }

        let current = self
            .store
            .get_room(room.id)
            .await?
            .ok_or_else(|| SessionError::NotFound("Room not found".to_string()))?
            .reveal_level;
        let level = current.saturating_add(1).min(MAX_REVEAL_LEVEL);
        if level == current {
            return Ok(None);
        }

        self.store.set_reveal_level(room.id, level).await?;
        self.registry.broadcast(
            room.id,
            ServerEvent::RevealLevel {
                room_id: room.id,
                level,
            },
            None,
        );
        info!(
            target: "rv.chat",
            room_id = %room.id,
            level = level,
            "Reveal level raised"
        );
        Ok(Some(level))
    }

    /// Drop any pending like round for a room that ended.
    pub fn forget_room(&self, room_id: RoomId) {
        self.likes().remove(&room_id);
    }
}
