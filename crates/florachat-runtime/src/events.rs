//! Session events
//!
//! Everything the presentation layer may want to react to outside of room
//! snapshots: status changes, auth rejection, failed sends, unavailable
//! history. Delivered over a broadcast channel; slow receivers lose the oldest
//! events rather than stalling the session.

use florachat_core::{ConnectionStatus, CorrelationId, MessageId, RoomId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

pub type SessionEventSender = broadcast::Sender<SessionEvent>;
pub type SessionEventReceiver = broadcast::Receiver<SessionEvent>;

/// Notifications published by a [`crate::ChatSession`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// Credential refused; the session stays disconnected until `connect`
    AuthRejected { reason: String },
    RoomJoined { room_id: RoomId, generation: u64 },
    RoomLeft { room_id: RoomId },
    SendConfirmed {
        room_id: RoomId,
        correlation_id: CorrelationId,
        message_id: MessageId,
    },
    /// No echo before the deadline; the entry is `Failed` and may be resent
    SendFailed {
        room_id: RoomId,
        correlation_id: CorrelationId,
    },
    /// An echo arrived for a send that had already failed
    ReconciliationMismatch {
        room_id: RoomId,
        correlation_id: CorrelationId,
        message_id: MessageId,
    },
    HistoryLoaded {
        room_id: RoomId,
        inserted: usize,
        next_cursor: Option<String>,
    },
    /// History could not be loaded; live messages keep flowing
    HistoryUnavailable { room_id: RoomId, reason: String },
    ServerError { code: String, message: String },
}

impl SessionEvent {
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            SessionEvent::RoomJoined { room_id, .. }
            | SessionEvent::RoomLeft { room_id }
            | SessionEvent::SendConfirmed { room_id, .. }
            | SessionEvent::SendFailed { room_id, .. }
            | SessionEvent::ReconciliationMismatch { room_id, .. }
            | SessionEvent::HistoryLoaded { room_id, .. }
            | SessionEvent::HistoryUnavailable { room_id, .. } => Some(room_id),
            SessionEvent::StatusChanged { .. }
            | SessionEvent::AuthRejected { .. }
            | SessionEvent::ServerError { .. } => None,
        }
    }
}

pub fn create_event_channel(buffer_size: usize) -> SessionEventSender {
    let (sender, _receiver) = broadcast::channel(buffer_size);
    sender
}

/// Publish an event; having no receivers is not an error
pub(crate) fn publish(sender: &SessionEventSender, event: SessionEvent) {
    if sender.send(event).is_err() {
        trace!("no session event receivers");
    }
}
