//! Error types for the FloraChat session layer
//!
//! Connection-level errors (`Auth`, `Network`) feed the single global status
//! indicator. History and per-room errors are scoped to their room.

use crate::connection_state::{ConnectionStatus, StateTransitionError};
use crate::types::{CorrelationId, RoomId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Handshake rejected the presented credential. Fatal for the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Credential rejected by server (status {status})")]
    Rejected { status: u16 },
    #[error("Credential is missing or malformed: {reason}")]
    InvalidCredential { reason: String },
}

/// Transport could not be established or was lost. Retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Failed to establish transport to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },
    #[error("Transport handshake timed out after {duration_ms}ms")]
    HandshakeTimeout { duration_ms: u64 },
    #[error("Transport link closed: {reason}")]
    LinkClosed { reason: String },
    #[error("Invalid endpoint: {url}")]
    InvalidEndpoint { url: String },
}

/// Failure while loading a page of room history
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryFetchError {
    #[error("History request for room {room_id} failed (retryable): {reason}")]
    Retryable { room_id: RoomId, reason: String },
    #[error("History for room {room_id} unavailable after {attempts} attempts: {reason}")]
    Permanent {
        room_id: RoomId,
        attempts: u32,
        reason: String,
    },
    #[error("History request for room {room_id} cancelled")]
    Cancelled { room_id: RoomId },
    #[error("History response for room {room_id} could not be decoded: {reason}")]
    Decode { room_id: RoomId, reason: String },
}

impl HistoryFetchError {
    /// Whether the loader should try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, HistoryFetchError::Retryable { .. })
    }

    pub fn room_id(&self) -> &RoomId {
        match self {
            HistoryFetchError::Retryable { room_id, .. }
            | HistoryFetchError::Permanent { room_id, .. }
            | HistoryFetchError::Cancelled { room_id }
            | HistoryFetchError::Decode { room_id, .. } => room_id,
        }
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error type for the FloraChat session layer
#[derive(Debug, thiserror::Error)]
pub enum FlorachatError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Sends are refused outright while the connection is not usable
    #[error("Not connected (status: {status})")]
    NotConnected { status: ConnectionStatus },

    #[error("Room {room_id} is not joined")]
    RoomNotJoined { room_id: RoomId },

    #[error("Invalid message content: {reason}")]
    InvalidContent { reason: String },

    #[error("History error: {0}")]
    HistoryFetch(#[from] HistoryFetchError),

    #[error("Send {correlation_id} was not confirmed in time")]
    SendTimeout { correlation_id: CorrelationId },

    #[error("No message {correlation_id} in room {room_id}")]
    UnknownMessage {
        room_id: RoomId,
        correlation_id: CorrelationId,
    },

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel communication error between session tasks
    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl FlorachatError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        FlorachatError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        FlorachatError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an invalid content error with a reason
    pub fn invalid_content<T: Into<String>>(reason: T) -> Self {
        FlorachatError::InvalidContent {
            reason: reason.into(),
        }
    }

    /// Create a not connected error for the given status
    pub fn not_connected(status: ConnectionStatus) -> Self {
        FlorachatError::NotConnected { status }
    }

    /// Create a transport connection failed error
    pub fn connect_failed<E: Into<String>, R: Into<String>>(endpoint: E, reason: R) -> Self {
        FlorachatError::Network(NetworkError::ConnectFailed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        })
    }

    /// Whether this error should force the session to terminate
    pub fn is_fatal(&self) -> bool {
        matches!(self, FlorachatError::Auth(_))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, FlorachatError>;
pub type FlorachatResult<T> = Result<T>;
