//! `ClientChannel` - the outbound half of one live client connection.
//!
//! The registry only ever holds a `ClientChannel`. The transport task owns
//! the matching [`ChannelReceiver`] and writes whatever it yields to the
//! socket.
//!
//! # Lifecycle
//!
//! 1. Created when a connection authenticates (child of the hub token)
//! 2. Events are queued with [`ClientChannel::deliver`] (non-blocking) or
//!    [`ClientChannel::deliver_timeout`] (bounded wait, used for signaling)
//! 3. [`ClientChannel::sever`] stops new deliveries; the receiver flushes
//!    what is already queued, then yields a single `Close`

use common::types::{ConnectionId, UserId};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::protocol::ServerEvent;

/// Outbound buffer per connection.
pub const CHANNEL_BUFFER: usize = 256;

/// Item handed to the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    Close { reason: String },
}

/// Why an event could not be queued.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Channel was severed or its receiver is gone.
    #[error("channel closed")]
    Closed,
    /// Outbound buffer is full.
    #[error("channel full")]
    Full,
    /// Buffer stayed full for the whole send timeout.
    #[error("send timed out")]
    TimedOut,
}

/// Handle to one connection's outbound queue.
#[derive(Clone, Debug)]
pub struct ClientChannel {
    sender: mpsc::Sender<Outbound>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
    user_id: UserId,
}

impl ClientChannel {
    /// Create a channel whose lifetime is bounded by `parent`.
    #[must_use]
    pub fn new(user_id: UserId, parent: &CancellationToken) -> (Self, ChannelReceiver) {
        let (sender, receiver) = mpsc::channel(CHANNEL_BUFFER);
        let cancel_token = parent.child_token();
        let channel = Self {
            sender,
            cancel_token: cancel_token.clone(),
            connection_id: ConnectionId::new(),
            user_id,
        };
        let receiver = ChannelReceiver {
            receiver,
            cancel_token,
            finished: false,
        };
        (channel, receiver)
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Token cancelled when the channel is severed.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Whether events can still be delivered.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.cancel_token.is_cancelled() && !self.sender.is_closed()
    }

    /// Queue an event without waiting.
    pub fn deliver(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        if self.cancel_token.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.sender
            .try_send(Outbound::Event(event))
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Full,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Queue an event, waiting at most `timeout` for buffer space.
    pub async fn deliver_timeout(
        &self,
        event: ServerEvent,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        if self.cancel_token.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.sender
            .send_timeout(Outbound::Event(event), timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DeliveryError::TimedOut,
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Stop accepting events and ask the transport to close.
    ///
    /// Events queued before this call are still written.
    pub fn sever(&self, reason: &str) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        // A full buffer is fine: the receiver synthesizes the close.
        let _ = self.sender.try_send(Outbound::Close {
            reason: reason.to_string(),
        });
        self.cancel_token.cancel();
    }
}

/// Transport-side end of a [`ClientChannel`].
#[derive(Debug)]
pub struct ChannelReceiver {
    receiver: mpsc::Receiver<Outbound>,
    cancel_token: CancellationToken,
    finished: bool,
}

impl ChannelReceiver {
    /// Next item to write, or `None` once the close has been yielded.
    pub async fn recv(&mut self) -> Option<Outbound> {
        if self.finished {
            return None;
        }

        let item = tokio::select! {
            biased;
            item = self.receiver.recv() => item,
            () = self.cancel_token.cancelled() => {
                self.receiver.try_recv().ok().or_else(|| Some(Outbound::Close {
                    reason: "severed".to_string(),
                }))
            }
        };

        match item {
            Some(Outbound::Close { .. }) | None => self.finished = true,
            Some(Outbound::Event(_)) => {}
        }
        item
    }

    /// Next item if one is ready now, without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        if self.finished {
            return None;
        }

        let item = match self.receiver.try_recv() {
            Ok(item) => Some(item),
            Err(_) if self.cancel_token.is_cancelled() => Some(Outbound::Close {
                reason: "severed".to_string(),
            }),
            Err(_) => None,
        };

        if matches!(item, Some(Outbound::Close { .. })) {
            self.finished = true;
        }
        item
    }

    /// Token cancelled when the channel is severed.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}
