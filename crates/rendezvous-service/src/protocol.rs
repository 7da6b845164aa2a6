//! Real-time message vocabulary.
//!
//! Both directions are JSON objects tagged by `type`. Signaling payloads
//! (`offer`, `answer`, `candidate`) are carried as opaque
//! [`serde_json::Value`]s and never inspected.

use common::types::{CallId, MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{EntryMode, MatchPreference, PublicProfile, UserStatus, Vote};

/// Which side of a call should create the WebRTC offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Events pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once after a connection is registered.
    Connection {
        user_id: UserId,
        status: UserStatus,
        current_room_id: Option<RoomId>,
        timestamp: i64,
    },
    /// Sent to a channel that a newer connection replaced, just before it is severed.
    ConnectionReplaced { message: String },
    Error { code: String, message: String },
    Heartbeat { timestamp: i64 },

    SearchQueued { position: usize },
    SearchRejected { reason: String },
    SearchCancelled,
    SearchExpired,
    MatchFound {
        room_id: RoomId,
        matched_user: PublicProfile,
        icebreaker: String,
        entry_mode: EntryMode,
    },

    RoomJoined { room_id: RoomId },
    CountdownStart {
        room_id: RoomId,
        duration: u64,
        #[serde(rename = "endTimestamp")]
        end_timestamp: i64,
    },
    CountdownUpdate {
        room_id: RoomId,
        remaining: u64,
        #[serde(rename = "endTimestamp")]
        end_timestamp: i64,
    },
    NotificationShow {
        room_id: RoomId,
        timeout: u64,
        users_to_notify: Vec<UserId>,
    },
    NotificationUpdate {
        room_id: RoomId,
        remaining: u64,
        users_to_notify: Vec<UserId>,
    },
    /// Your "yes" was recorded; the other participant has not answered.
    ContinuationWaiting { room_id: RoomId },
    RoomKept { room_id: RoomId },
    RoomEnded { room_id: RoomId, reason: String },
    RoomClosed {
        room_id: RoomId,
        force_close: bool,
        timestamp: i64,
    },

    VoiceCallInitiated {
        #[serde(rename = "callId")]
        call_id: CallId,
        callee_id: UserId,
    },
    VoiceCallIncoming {
        #[serde(rename = "callId")]
        call_id: CallId,
        caller: PublicProfile,
        room_id: RoomId,
    },
    VoiceCallAccepted {
        #[serde(rename = "callId")]
        call_id: CallId,
        callee_id: UserId,
    },
    VoiceCallStartWebrtc {
        #[serde(rename = "callId")]
        call_id: CallId,
        role: CallRole,
    },
    VoiceCallRejected {
        #[serde(rename = "callId")]
        call_id: CallId,
        reason: String,
    },
    VoiceCallEnded {
        #[serde(rename = "callId")]
        call_id: CallId,
        reason: String,
        duration: u64,
        ended_by: Option<UserId>,
        room_closed: bool,
    },
    WebrtcOffer {
        #[serde(rename = "callId")]
        call_id: CallId,
        offer: Value,
        from: UserId,
    },
    WebrtcAnswer {
        #[serde(rename = "callId")]
        call_id: CallId,
        answer: Value,
        from: UserId,
    },
    IceCandidate {
        #[serde(rename = "callId")]
        call_id: CallId,
        candidate: Value,
        from: UserId,
    },

    Typing { user_id: UserId, username: String },
    StopTyping { user_id: UserId },
    Message {
        message_id: MessageId,
        room_id: RoomId,
        user_id: UserId,
        username: String,
        content: String,
        timestamp: i64,
    },
    RevealLevel { room_id: RoomId, level: u8 },
}

impl ServerEvent {
    /// Bounded name used as a log field and metrics label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connection { .. } => "connection",
            ServerEvent::ConnectionReplaced { .. } => "connection_replaced",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Heartbeat { .. } => "heartbeat",
            ServerEvent::SearchQueued { .. } => "search_queued",
            ServerEvent::SearchRejected { .. } => "search_rejected",
            ServerEvent::SearchCancelled => "search_cancelled",
            ServerEvent::SearchExpired => "search_expired",
            ServerEvent::MatchFound { .. } => "match_found",
            ServerEvent::RoomJoined { .. } => "room_joined",
            ServerEvent::CountdownStart { .. } => "countdown_start",
            ServerEvent::CountdownUpdate { .. } => "countdown_update",
            ServerEvent::NotificationShow { .. } => "notification_show",
            ServerEvent::NotificationUpdate { .. } => "notification_update",
            ServerEvent::ContinuationWaiting { .. } => "continuation_waiting",
            ServerEvent::RoomKept { .. } => "room_kept",
            ServerEvent::RoomEnded { .. } => "room_ended",
            ServerEvent::RoomClosed { .. } => "room_closed",
            ServerEvent::VoiceCallInitiated { .. } => "voice_call_initiated",
            ServerEvent::VoiceCallIncoming { .. } => "voice_call_incoming",
            ServerEvent::VoiceCallAccepted { .. } => "voice_call_accepted",
            ServerEvent::VoiceCallStartWebrtc { .. } => "voice_call_start_webrtc",
            ServerEvent::VoiceCallRejected { .. } => "voice_call_rejected",
            ServerEvent::VoiceCallEnded { .. } => "voice_call_ended",
            ServerEvent::WebrtcOffer { .. } => "webrtc_offer",
            ServerEvent::WebrtcAnswer { .. } => "webrtc_answer",
            ServerEvent::IceCandidate { .. } => "ice_candidate",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::StopTyping { .. } => "stop_typing",
            ServerEvent::Message { .. } => "message",
            ServerEvent::RevealLevel { .. } => "reveal_level",
        }
    }

    /// Build an `error` event from a wire code and client-safe message.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Events received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Heartbeat,

    Search {
        #[serde(default)]
        mode: EntryMode,
        #[serde(default)]
        preference: MatchPreference,
    },
    CancelSearch,

    JoinRoom { room_id: RoomId },
    LeaveRoom,
    Message { content: String },
    Typing,
    StopTyping,
    LikeResponse { response: Vote },

    StartCountdown {
        #[serde(default)]
        duration: Option<u64>,
    },
    ContinuationResponse { response: Vote },
    KeepRoom,
    EndRoom,

    VoiceCallInitiate { callee_id: UserId },
    VoiceCallAccept {
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    VoiceCallReject {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default)]
        reason: Option<String>,
    },
    VoiceCallEnd {
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    WebrtcOffer {
        #[serde(rename = "callId")]
        call_id: CallId,
        offer: Value,
    },
    WebrtcAnswer {
        #[serde(rename = "callId")]
        call_id: CallId,
        answer: Value,
    },
    IceCandidate {
        #[serde(rename = "callId")]
        call_id: CallId,
        candidate: Value,
    },
}

impl ClientEvent {
    /// Bounded name used as a log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::Heartbeat => "heartbeat",
            ClientEvent::Search { .. } => "search",
            ClientEvent::CancelSearch => "cancel_search",
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::LeaveRoom => "leave_room",
            ClientEvent::Message { .. } => "message",
            ClientEvent::Typing => "typing",
            ClientEvent::StopTyping => "stop_typing",
            ClientEvent::LikeResponse { .. } => "like_response",
            ClientEvent::StartCountdown { .. } => "start_countdown",
            ClientEvent::ContinuationResponse { .. } => "continuation_response",
            ClientEvent::KeepRoom => "keep_room",
            ClientEvent::EndRoom => "end_room",
            ClientEvent::VoiceCallInitiate { .. } => "voice_call_initiate",
            ClientEvent::VoiceCallAccept { .. } => "voice_call_accept",
            ClientEvent::VoiceCallReject { .. } => "voice_call_reject",
            ClientEvent::VoiceCallEnd { .. } => "voice_call_end",
            ClientEvent::WebrtcOffer { .. } => "webrtc_offer",
            ClientEvent::WebrtcAnswer { .. } => "webrtc_answer",
            ClientEvent::IceCandidate { .. } => "ice_candidate",
        }
    }

    /// Whether the event acts on the connection's joined room.
    #[must_use]
    pub fn is_room_scoped(&self) -> bool {
        !matches!(
            self,
            ClientEvent::Heartbeat
                | ClientEvent::Search { .. }
                | ClientEvent::CancelSearch
                | ClientEvent::JoinRoom { .. }
        )
    }
}
