//! Rendezvous error types.
//!
//! Errors map to wire codes sent in `error` events. Internal details are
//! logged server-side but never exposed to clients.

use thiserror::Error;

/// Errors surfaced by a `Store` implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend operation failed (connection, query, serialization).
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A record the operation depends on does not exist.
    #[error("Store record not found: {0}")]
    NotFound(String),
}

/// Voice-call error taxonomy.
///
/// `code()` is the stable wire identifier clients switch on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Caller and callee are the same user")]
    CannotCallSelf,

    #[error("Caller is already in a call")]
    UserAlreadyInCall,

    #[error("Callee is already in a call")]
    TargetUserBusy,

    #[error("User not found or unavailable")]
    UserNotFound,

    #[error("Users are not both present in the room")]
    UsersNotInSameRoom,

    #[error("Room has ended")]
    RoomEnded,

    #[error("Callee has call notifications disabled")]
    CallNotificationsDisabled,

    #[error("Invalid call state: {0}")]
    InvalidCallState(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl CallError {
    /// Returns the wire code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CallError::CannotCallSelf => "CANNOT_CALL_SELF",
            CallError::UserAlreadyInCall => "USER_ALREADY_IN_CALL",
            CallError::TargetUserBusy => "TARGET_USER_BUSY",
            CallError::UserNotFound => "USER_NOT_FOUND",
            CallError::UsersNotInSameRoom => "USERS_NOT_IN_SAME_ROOM",
            CallError::RoomEnded => "ROOM_ENDED",
            CallError::CallNotificationsDisabled => "CALL_NOTIFICATIONS_DISABLED",
            CallError::InvalidCallState(_) => "INVALID_CALL_STATE",
            CallError::SystemError(_) => "SYSTEM_ERROR",
        }
    }

    /// Returns a user-facing message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            CallError::CannotCallSelf => "You cannot call yourself",
            CallError::UserAlreadyInCall => "You are already in a call",
            CallError::TargetUserBusy => "The other user is currently in a call",
            CallError::UserNotFound => "User not found",
            CallError::UsersNotInSameRoom => "Both users must be in the same room to call",
            CallError::RoomEnded => "This chat room has ended",
            CallError::CallNotificationsDisabled => "This user has disabled call notifications",
            CallError::InvalidCallState(_) => "The call is not in a valid state for this action",
            CallError::SystemError(_) => "A system error occurred, please try again",
        }
    }
}

impl From<StoreError> for CallError {
    fn from(err: StoreError) -> Self {
        CallError::SystemError(err.to_string())
    }
}

/// Session orchestration error type.
///
/// Maps to wire codes:
/// - `Store`, `Internal`: `SYSTEM_ERROR`
/// - `Call`: the call taxonomy code
/// - `Unauthorized`: `UNAUTHORIZED`
/// - `PermissionDenied`: `FORBIDDEN`
/// - `NotFound`: `NOT_FOUND`
/// - `InvalidState`: `INVALID_STATE`
/// - `Validation`: `VALIDATION_ERROR`
/// - `ChannelClosed`: `CHANNEL_CLOSED`
#[derive(Debug, Error)]
pub enum SessionError {
    /// Persistence failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Voice-call operation failed.
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// Token missing, invalid, or not bound to a known user.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed (banned, not a room participant).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Room, user, or negotiation not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed or out-of-range client input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Outbound channel is gone or full.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Returns the wire code sent to clients in `error` events.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::Store(_) | SessionError::Internal(_) => "SYSTEM_ERROR",
            SessionError::Call(e) => e.code(),
            SessionError::Unauthorized(_) => "UNAUTHORIZED",
            SessionError::PermissionDenied(_) => "FORBIDDEN",
            SessionError::NotFound(_) => "NOT_FOUND",
            SessionError::InvalidState(_) => "INVALID_STATE",
            SessionError::Validation(_) => "VALIDATION_ERROR",
            SessionError::ChannelClosed(_) => "CHANNEL_CLOSED",
        }
    }

    /// Returns the HTTP status used when the error rejects a WebSocket upgrade.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            SessionError::Store(_)
            | SessionError::Internal(_)
            | SessionError::ChannelClosed(_)
            | SessionError::Call(CallError::SystemError(_)) => 500,
            SessionError::Call(CallError::UserNotFound) | SessionError::NotFound(_) => 404,
            SessionError::Call(_) | SessionError::InvalidState(_) => 409,
            SessionError::Unauthorized(_) => 401,
            SessionError::PermissionDenied(_) => 403,
            SessionError::Validation(_) => 400,
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SessionError::Store(_) => "store",
            SessionError::Call(_) => "call",
            SessionError::Unauthorized(_) => "unauthorized",
            SessionError::PermissionDenied(_) => "permission_denied",
            SessionError::NotFound(_) => "not_found",
            SessionError::InvalidState(_) => "invalid_state",
            SessionError::Validation(_) => "validation",
            SessionError::ChannelClosed(_) => "channel_closed",
            SessionError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SessionError::Store(_) | SessionError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            SessionError::Call(e) => e.client_message().to_string(),
            SessionError::Unauthorized(_) => "Invalid or expired token".to_string(),
            SessionError::ChannelClosed(_) => "Connection is closing".to_string(),
            SessionError::PermissionDenied(msg)
            | SessionError::NotFound(msg)
            | SessionError::InvalidState(msg)
            | SessionError::Validation(msg) => msg.clone(),
        }
    }
}
