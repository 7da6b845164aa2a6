//! Domain records shared by the orchestration components.
//!
//! These mirror what the `Store` persists. Components hold them only as
//! short-lived snapshots and re-fetch before committing a mutation.

use chrono::{DateTime, Utc};
use common::types::{CallId, MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// Presence status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Idle,
    Searching,
    Connected,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Idle => "idle",
            UserStatus::Searching => "searching",
            UserStatus::Connected => "connected",
        }
    }
}

/// Channel type requested when entering the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    #[default]
    Chat,
    Voice,
}

impl EntryMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntryMode::Chat => "chat",
            EntryMode::Voice => "voice",
        }
    }
}

/// How strictly a ticket's entry mode must match its partner's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchPreference {
    /// Partner must request the same entry mode.
    #[default]
    SameMode,
    /// Any entry mode is acceptable.
    Any,
}

/// A continuation or like answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Yes,
    No,
}

/// Persisted user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
    pub gender: Option<String>,
    /// Genders this user wants to be matched with. Empty means no preference.
    pub preferred_gender: Vec<String>,
    pub banned_until: Option<DateTime<Utc>>,
    pub status: UserStatus,
    pub current_room_id: Option<RoomId>,
}

impl UserRecord {
    /// Whether a ban is in force at `now`.
    #[must_use]
    pub fn is_banned(&self, now: DateTime<Utc>) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }

    /// Whether `other`'s gender satisfies this user's preference.
    #[must_use]
    pub fn accepts_gender_of(&self, other: &UserRecord) -> bool {
        if self.preferred_gender.is_empty() {
            return true;
        }
        other
            .gender
            .as_ref()
            .is_some_and(|g| self.preferred_gender.iter().any(|p| p.eq_ignore_ascii_case(g)))
    }

    /// Public profile sent to the other participant.
    #[must_use]
    pub fn profile(&self) -> PublicProfile {
        PublicProfile {
            id: self.id,
            username: self.username.clone(),
            nickname: self.nickname.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// The subset of a user record visible to a partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicProfile {
    pub id: UserId,
    pub username: String,
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
}

/// Persisted pairing of two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub entry_mode: EntryMode,
    pub current_mode: EntryMode,
    pub start_time: DateTime<Utc>,
    /// `None` while the room is active.
    pub end_time: Option<DateTime<Utc>>,
    /// Both participants agreed to continue past the initial window.
    pub keep_active: bool,
    pub user1_keep: bool,
    pub user2_keep: bool,
    pub reveal_level: u8,
    pub last_message_time: Option<DateTime<Utc>>,
}

impl Room {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    #[must_use]
    pub fn participants(&self) -> [UserId; 2] {
        [self.user1_id, self.user2_id]
    }

    #[must_use]
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The participant that is not `user_id`, if `user_id` is one.
    #[must_use]
    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        if self.user1_id == user_id {
            Some(self.user2_id)
        } else if self.user2_id == user_id {
            Some(self.user1_id)
        } else {
            None
        }
    }

    /// The participant's own keep-active opt-in.
    #[must_use]
    pub fn keep_flag(&self, user_id: UserId) -> bool {
        if self.user1_id == user_id {
            self.user1_keep
        } else if self.user2_id == user_id {
            self.user2_keep
        } else {
            false
        }
    }
}

/// Input for creating a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRoom {
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub entry_mode: EntryMode,
}

/// Why a room ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomEndReason {
    /// A participant explicitly ended the room.
    UserEnded,
    /// A participant voted "no" on continuation.
    Declined,
    /// The continuation vote went unanswered.
    Timeout,
    /// A call ended in a room that was not kept.
    CallEnded,
    /// A participant cancelled while the room was being created.
    MatchAborted,
    /// Operator or service-initiated closure.
    ForceClosed,
}

impl RoomEndReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RoomEndReason::UserEnded => "user_ended",
            RoomEndReason::Declined => "declined",
            RoomEndReason::Timeout => "timeout",
            RoomEndReason::CallEnded => "call_ended",
            RoomEndReason::MatchAborted => "match_aborted",
            RoomEndReason::ForceClosed => "force_closed",
        }
    }
}

/// Voice call lifecycle.
///
/// ```text
/// initiated -> ringing -> accepted -> active -> ended
///                 |           |
///                 +-> rejected +-> ended
/// ```
/// Any non-terminal state may also go straight to `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Accepted,
    Active,
    Ended,
    Rejected,
}

impl CallStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Rejected)
    }

    #[must_use]
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::{Accepted, Active, Ended, Initiated, Rejected, Ringing};
        match (self, next) {
            (Initiated, Ringing)
            | (Ringing, Accepted)
            | (Accepted, Active)
            | (Initiated | Ringing, Rejected) => true,
            (from, Ended) => !from.is_terminal(),
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
        }
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    UserHangup,
    Timeout,
    UserDisconnect,
    MaxDurationReached,
    RoomEnded,
    /// A conflicting call was committed while this one was being created.
    Superseded,
}

impl CallEndReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CallEndReason::UserHangup => "user_hangup",
            CallEndReason::Timeout => "timeout",
            CallEndReason::UserDisconnect => "user_disconnect",
            CallEndReason::MaxDurationReached => "max_duration_reached",
            CallEndReason::RoomEnded => "room_ended",
            CallEndReason::Superseded => "superseded",
        }
    }
}

/// Persisted voice call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    pub room_id: RoomId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub end_reason: Option<String>,
}

impl CallSession {
    #[must_use]
    pub fn is_party(&self, user_id: UserId) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    #[must_use]
    pub fn other_party(&self, user_id: UserId) -> Option<UserId> {
        if self.caller_id == user_id {
            Some(self.callee_id)
        } else if self.callee_id == user_id {
            Some(self.caller_id)
        } else {
            None
        }
    }
}

/// Partial update applied to a persisted call session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallUpdate {
    pub status: Option<CallStatus>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub end_reason: Option<String>,
}

impl CallUpdate {
    #[must_use]
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Default call ceiling when a user has no settings row.
pub const DEFAULT_MAX_CALL_DURATION_SECS: u64 = 3600;

/// Per-user call preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSettings {
    pub call_notifications: bool,
    pub max_call_duration_secs: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            call_notifications: true,
            max_call_duration_secs: DEFAULT_MAX_CALL_DURATION_SECS,
        }
    }
}

/// Persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
