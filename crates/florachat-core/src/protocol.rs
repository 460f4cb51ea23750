//! Wire protocol for the room-addressed pub/sub transport
//!
//! Frames are JSON objects tagged by `type`. The client issues `join`, `leave`
//! and `send`; the server broadcasts `message` to every joined member of a room,
//! the sender included. The sender's own echo drives reconciliation.

use crate::errors::Result;
use crate::message::ConfirmedMessage;
use crate::types::{CorrelationId, RoomId};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Client → Server
// ----------------------------------------------------------------------------

/// Commands sent from the session to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        room_id: RoomId,
    },
    Leave {
        room_id: RoomId,
    },
    Send {
        room_id: RoomId,
        content: String,
        correlation_id: CorrelationId,
    },
}

impl ClientFrame {
    pub fn room_id(&self) -> &RoomId {
        match self {
            ClientFrame::Join { room_id }
            | ClientFrame::Leave { room_id }
            | ClientFrame::Send { room_id, .. } => room_id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ----------------------------------------------------------------------------
// Server → Client
// ----------------------------------------------------------------------------

/// Events broadcast by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A confirmed message for one room
    Message { message: ConfirmedMessage },
    /// Server-side error report; informational only
    Error { code: String, message: String },
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
