//! One-shot timers that report back to the session hub.
//!
//! A timer never acts on its own. When it fires it posts a [`TimerEvent`]
//! and the hub re-checks live state before doing anything. Cancelling the
//! owning token (call ended, room ended, shutdown) stops it silently.

use common::types::{CallId, RoomId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the hub's timer event queue.
pub const TIMER_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Callee never answered.
    RingTimeout { call_id: CallId },
    /// Accepted call never reached active.
    ConnectTimeout { call_id: CallId },
    /// Active call hit the caller's duration ceiling.
    MaxDuration { call_id: CallId },
    /// Continuation vote window closed.
    NegotiationExpired { room_id: RoomId, generation: u64 },
}

pub type TimerSender = mpsc::Sender<TimerEvent>;
pub type TimerReceiver = mpsc::Receiver<TimerEvent>;

#[must_use]
pub fn channel() -> (TimerSender, TimerReceiver) {
    mpsc::channel(TIMER_EVENT_BUFFER)
}

/// Post `event` after `after` unless `token` is cancelled first.
pub fn arm(token: CancellationToken, after: Duration, event: TimerEvent, tx: TimerSender) {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = token.cancelled() => {}
            () = tokio::time::sleep(after) => {
                if tx.send(event).await.is_err() {
                    debug!(target: "rv.hub", ?event, "Timer fired after hub stopped");
                }
            }
        }
    });
}
