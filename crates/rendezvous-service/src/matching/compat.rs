//! Pairwise compatibility rules for two search tickets.

use chrono::{DateTime, Utc};

use super::SearchTicket;
use crate::models::{EntryMode, MatchPreference, UserRecord};

/// Why a head pair could not be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incompatibility {
    ModeMismatch,
    SelfMatch,
    Banned,
    GenderPreference,
    AlreadyInRoom,
}

impl Incompatibility {
    /// Bounded label for logs and `rv_matching_head_blocked_total`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Incompatibility::ModeMismatch => "mode_mismatch",
            Incompatibility::SelfMatch => "self_match",
            Incompatibility::Banned => "banned",
            Incompatibility::GenderPreference => "gender_preference",
            Incompatibility::AlreadyInRoom => "already_in_room",
        }
    }
}

/// Modes must be equal unless either side accepts any mode.
#[must_use]
pub fn modes_compatible(a: &SearchTicket, b: &SearchTicket) -> bool {
    a.mode == b.mode
        || a.preference == MatchPreference::Any
        || b.preference == MatchPreference::Any
}

/// Entry mode for a room built from `older` and `newer`.
///
/// The side that insisted on its mode wins. If both accept any mode, the
/// older ticket's mode is used.
#[must_use]
pub fn resolve_entry_mode(older: &SearchTicket, newer: &SearchTicket) -> EntryMode {
    match (older.preference, newer.preference) {
        (MatchPreference::Any, MatchPreference::SameMode) => newer.mode,
        _ => older.mode,
    }
}

/// Checks run against freshly fetched user records.
pub fn check(a: &UserRecord, b: &UserRecord, now: DateTime<Utc>) -> Result<(), Incompatibility> {
    if a.id == b.id {
        return Err(Incompatibility::SelfMatch);
    }
    if a.is_banned(now) || b.is_banned(now) {
        return Err(Incompatibility::Banned);
    }
    if !a.accepts_gender_of(b) || !b.accepts_gender_of(a) {
        return Err(Incompatibility::GenderPreference);
    }
    if a.current_room_id.is_some() || b.current_room_id.is_some() {
        return Err(Incompatibility::AlreadyInRoom);
    }
    Ok(())
}
