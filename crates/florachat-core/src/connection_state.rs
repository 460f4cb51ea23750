//! Connection State Machine
//!
//! The session's single connection moves through four states only:
//!
//! ```text
//! Disconnected --Connect--> Connecting --HandshakeSucceeded--> Connected
//! Connecting --HandshakeFailed--> Disconnected
//! Connected --LinkDropped--> Reconnecting --HandshakeSucceeded--> Connected
//! Reconnecting --AttemptsExhausted | CredentialRejected--> Disconnected
//! Connecting | Connected | Reconnecting --Disconnect--> Disconnected
//! ```
//!
//! Any other pair of state and event is rejected with a
//! [`StateTransitionError`] and leaves the state untouched.

use crate::types::Timestamp;
use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Connection Status
// ----------------------------------------------------------------------------

/// Observable status of the session connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No connection; terminal until a manual connect
    Disconnected,
    /// First handshake in progress
    Connecting,
    /// Link established and every joined room replayed
    Connected,
    /// Link lost, backoff-driven recovery in progress
    Reconnecting,
}

impl ConnectionStatus {
    /// Whether sends may be issued in this state
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Reconnecting => "Reconnecting",
        }
    }

    /// Process an event and compute the next status
    pub fn transition(self, event: ConnectionEvent) -> Result<Self, StateTransitionError> {
        use ConnectionEvent::*;
        use ConnectionStatus::*;

        let next = match (self, event) {
            (Disconnected, Connect) => Connecting,
            (Connecting, HandshakeSucceeded) => Connected,
            (Connecting, HandshakeFailed) => Disconnected,
            (Connecting, CredentialRejected) => Disconnected,
            (Connected, LinkDropped) => Reconnecting,
            (Reconnecting, HandshakeSucceeded) => Connected,
            // A failed attempt keeps backing off until the budget runs out
            (Reconnecting, HandshakeFailed) => Reconnecting,
            (Reconnecting, AttemptsExhausted) => Disconnected,
            (Reconnecting, CredentialRejected) => Disconnected,
            (Connecting | Connected | Reconnecting, Disconnect) => Disconnected,
            (from, event) => {
                return Err(StateTransitionError::InvalidTransition {
                    from,
                    event: event.event_name(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

// ----------------------------------------------------------------------------
// State Transition Events
// ----------------------------------------------------------------------------

/// Events that drive connection status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Manual connect requested
    Connect,
    /// Transport handshake completed and rooms were replayed
    HandshakeSucceeded,
    /// Transport could not be established
    HandshakeFailed,
    /// Handshake rejected the credential
    CredentialRejected,
    /// Established link went away
    LinkDropped,
    /// Reconnect attempt budget exhausted
    AttemptsExhausted,
    /// Manual disconnect requested
    Disconnect,
}

impl ConnectionEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connect => "Connect",
            ConnectionEvent::HandshakeSucceeded => "HandshakeSucceeded",
            ConnectionEvent::HandshakeFailed => "HandshakeFailed",
            ConnectionEvent::CredentialRejected => "CredentialRejected",
            ConnectionEvent::LinkDropped => "LinkDropped",
            ConnectionEvent::AttemptsExhausted => "AttemptsExhausted",
            ConnectionEvent::Disconnect => "Disconnect",
        }
    }
}

// ----------------------------------------------------------------------------
// Audit Trail
// ----------------------------------------------------------------------------

/// Record of one applied transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub from_state: ConnectionStatus,
    pub to_state: ConnectionStatus,
    pub event: ConnectionEvent,
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition {
        from: ConnectionStatus,
        event: &'static str,
    },
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent::*;
    use ConnectionStatus::*;

    #[test]
    fn test_happy_path() {
        let status = Disconnected.transition(Connect).unwrap();
        assert_eq!(status, Connecting);
        let status = status.transition(HandshakeSucceeded).unwrap();
        assert_eq!(status, Connected);
        assert!(status.can_send());
    }

    #[test]
    fn test_drop_and_recover() {
        let status = Connected.transition(LinkDropped).unwrap();
        assert_eq!(status, Reconnecting);
        assert!(!status.can_send());
        assert_eq!(status.transition(HandshakeFailed).unwrap(), Reconnecting);
        assert_eq!(status.transition(HandshakeSucceeded).unwrap(), Connected);
        assert_eq!(status.transition(AttemptsExhausted).unwrap(), Disconnected);
        assert_eq!(status.transition(CredentialRejected).unwrap(), Disconnected);
    }

    #[test]
    fn test_disconnect_from_any_live_state() {
        for status in [Connecting, Connected, Reconnecting] {
            assert_eq!(status.transition(Disconnect).unwrap(), Disconnected);
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(Disconnected.transition(Disconnect).is_err());
        assert!(Disconnected.transition(LinkDropped).is_err());
        assert!(Connected.transition(Connect).is_err());
        assert!(Connecting.transition(LinkDropped).is_err());
        assert!(Connected.transition(AttemptsExhausted).is_err());

        let err = Connected.transition(Connect).unwrap_err();
        assert_eq!(
            err,
            StateTransitionError::InvalidTransition {
                from: Connected,
                event: "Connect"
            }
        );
    }

    #[test]
    fn test_only_four_states_reachable() {
        let events = [
            Connect,
            HandshakeSucceeded,
            HandshakeFailed,
            CredentialRejected,
            LinkDropped,
            AttemptsExhausted,
            Disconnect,
        ];
        let mut seen = vec![Disconnected];
        let mut frontier = vec![Disconnected];
        while let Some(status) = frontier.pop() {
            for event in events {
                if let Ok(next) = status.transition(event) {
                    if !seen.contains(&next) {
                        seen.push(next);
                        frontier.push(next);
                    }
                }
            }
        }
        assert_eq!(seen.len(), 4);
    }
}
