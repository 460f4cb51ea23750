//! Chat message types
//!
//! A [`Message`] is either a local optimistic entry (`Pending`, later `Failed`)
//! or a server-confirmed entry. [`ConfirmedMessage`] is the authoritative server
//! view received over the transport or from the history API.

use crate::types::{CorrelationId, MessageId, RoomId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Sender Role
// ----------------------------------------------------------------------------

/// Role of the account that authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Admin,
    User,
    Florist,
    Organizer,
    Venue,
    System,
    #[serde(other)]
    Unknown,
}

// ----------------------------------------------------------------------------
// Message Status
// ----------------------------------------------------------------------------

/// Delivery status of a message as seen by this session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Rendered optimistically, awaiting the server echo
    Pending,
    /// Authoritative server copy
    Confirmed,
    /// No echo within the send timeout; eligible for resend
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Confirmed | MessageStatus::Failed)
    }
}

// ----------------------------------------------------------------------------
// Draft
// ----------------------------------------------------------------------------

/// User-submitted content before it becomes a pending message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_role: SenderRole,
    pub content: String,
}

impl Draft {
    pub fn new<C: Into<String>>(
        room_id: RoomId,
        sender_id: UserId,
        sender_role: SenderRole,
        content: C,
    ) -> Self {
        Self {
            room_id,
            sender_id,
            sender_role,
            content: content.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Confirmed Message
// ----------------------------------------------------------------------------

/// Server-confirmed message as delivered by the transport or the history API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedMessage {
    pub id: MessageId,
    /// Echo of the client correlation id, when the server supplies it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_role: SenderRole,
    pub content: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub read: bool,
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// Entry of a room's ordered message log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server id, absent until confirmed
    pub id: Option<MessageId>,
    /// Client correlation id, absent for messages authored elsewhere
    pub correlation_id: Option<CorrelationId>,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_role: SenderRole,
    pub content: String,
    pub created_at: Timestamp,
    pub status: MessageStatus,
    pub read: bool,
    /// Failed send this entry was resent from
    pub supersedes: Option<CorrelationId>,
}

impl Message {
    /// Create a pending entry from a draft
    pub fn pending(draft: Draft, correlation_id: CorrelationId, created_at: Timestamp) -> Self {
        Self {
            id: None,
            correlation_id: Some(correlation_id),
            room_id: draft.room_id,
            sender_id: draft.sender_id,
            sender_role: draft.sender_role,
            content: draft.content,
            created_at,
            status: MessageStatus::Pending,
            read: true,
            supersedes: None,
        }
    }

    /// Create a confirmed entry from the server view
    pub fn confirmed(message: ConfirmedMessage) -> Self {
        Self {
            id: Some(message.id),
            correlation_id: message.correlation_id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            sender_role: message.sender_role,
            content: message.content,
            created_at: message.created_at,
            status: MessageStatus::Confirmed,
            read: message.read,
            supersedes: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == MessageStatus::Confirmed
    }

    pub fn is_failed(&self) -> bool {
        self.status == MessageStatus::Failed
    }

    /// Ordering key for confirmed messages
    pub fn order_key(&self) -> Option<(Timestamp, MessageId)> {
        match (self.status, self.id) {
            (MessageStatus::Confirmed, Some(id)) => Some((self.created_at, id)),
            _ => None,
        }
    }
}
