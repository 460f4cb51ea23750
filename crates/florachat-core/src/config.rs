//! Centralized Configuration Management
//!
//! All tunables of the session layer live here. Durations are expressed in
//! milliseconds so configuration files stay readable. `SessionConfig::load`
//! layers defaults, an optional TOML file and `FLORACHAT_*` environment
//! variables (nested keys separated by `__`, e.g. `FLORACHAT_OUTBOUND__SEND_TIMEOUT_MS`).

use crate::errors::{FlorachatError, Result};
use core::time::Duration;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ----------------------------------------------------------------------------
// Backoff Configuration
// ----------------------------------------------------------------------------

/// Bounded exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay_ms: u64,
    /// Number of attempts before giving up
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::reconnect()
    }
}

impl BackoffConfig {
    /// Defaults for connection recovery: 1s, doubling, capped at 30s, 5 attempts
    pub fn reconnect() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }

    /// Defaults for history retries: 500ms, doubling, capped at 5s, 3 attempts
    pub fn history() -> Self {
        Self {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            max_attempts: 3,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(FlorachatError::config_error(format!(
                "{section}.initial_delay_ms must be greater than zero"
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(FlorachatError::config_error(format!(
                "{section}.max_delay_ms must be at least initial_delay_ms"
            )));
        }
        if !(self.multiplier >= 1.0) {
            return Err(FlorachatError::config_error(format!(
                "{section}.multiplier must be at least 1.0"
            )));
        }
        if self.max_attempts == 0 {
            return Err(FlorachatError::config_error(format!(
                "{section}.max_attempts must be greater than zero"
            )));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Configuration for the persistent transport connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound for one transport handshake
    pub handshake_timeout_ms: u64,
    /// Number of status transitions kept in the audit trail
    pub audit_trail_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            audit_trail_len: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Outbound Configuration
// ----------------------------------------------------------------------------

/// Configuration for optimistic sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Time allowed for a confirming echo before a send is marked failed
    pub send_timeout_ms: u64,
    /// Maximum content length in characters
    pub max_content_length: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            max_content_length: 4_000,
        }
    }
}

impl OutboundConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// History Configuration
// ----------------------------------------------------------------------------

/// Configuration for paginated history loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Retry policy for non-success responses
    pub retry: BackoffConfig,
    /// Upper bound for one REST request
    pub request_timeout_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retry: BackoffConfig::history(),
            request_timeout_ms: 15_000,
        }
    }
}

impl HistoryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Message Store Configuration
// ----------------------------------------------------------------------------

/// Configuration for the per-room message store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageStoreConfig {
    /// Maximum messages kept per room; oldest confirmed entries go first
    pub max_messages_per_room: usize,
    /// Left rooms whose cache is retained for fast re-entry (LRU)
    pub retained_rooms: usize,
    /// Window for the sender/content fallback match during reconciliation
    pub fuzzy_match_window_ms: u64,
}

impl Default for MessageStoreConfig {
    fn default() -> Self {
        Self {
            max_messages_per_room: 2_000,
            retained_rooms: 8,
            fuzzy_match_window_ms: 5_000,
        }
    }
}

impl MessageStoreConfig {
    pub fn fuzzy_match_window(&self) -> Duration {
        Duration::from_millis(self.fuzzy_match_window_ms)
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the channels between session tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Commands into the connection driver
    pub command_buffer_size: usize,
    /// Frames from the driver to the transport
    pub outbound_frame_buffer_size: usize,
    /// Frames from the transport to the driver
    pub inbound_frame_buffer_size: usize,
    /// Session events broadcast to the UI
    pub session_event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 64,
            outbound_frame_buffer_size: 128,
            inbound_frame_buffer_size: 256,
            session_event_buffer_size: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for one chat session
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub reconnect: BackoffConfig,
    pub outbound: OutboundConfig,
    pub history: HistoryConfig,
    pub store: MessageStoreConfig,
    pub channels: ChannelConfig,
}

impl SessionConfig {
    /// Configuration with short timers for tests
    pub fn testing() -> Self {
        Self {
            connection: ConnectionConfig {
                handshake_timeout_ms: 1_000,
                audit_trail_len: 16,
            },
            reconnect: BackoffConfig {
                initial_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: 100,
                max_attempts: 3,
            },
            outbound: OutboundConfig::default(),
            history: HistoryConfig {
                retry: BackoffConfig {
                    initial_delay_ms: 10,
                    multiplier: 2.0,
                    max_delay_ms: 50,
                    max_attempts: 2,
                },
                request_timeout_ms: 1_000,
            },
            store: MessageStoreConfig::default(),
            channels: ChannelConfig::default(),
        }
    }

    /// Load configuration: defaults, then the TOML file (if given), then environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(SessionConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path.as_ref()));
        }
        let config: SessionConfig = figment
            .merge(Env::prefixed("FLORACHAT_").split("__"))
            .extract()
            .map_err(|e| FlorachatError::config_error(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document layered over defaults
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: SessionConfig = Figment::from(Serialized::defaults(SessionConfig::default()))
            .merge(Toml::string(document))
            .extract()
            .map_err(|e| FlorachatError::config_error(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break the bounded-time guarantees
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate("reconnect")?;
        self.history.retry.validate("history.retry")?;
        if self.outbound.send_timeout_ms == 0 {
            return Err(FlorachatError::config_error(
                "outbound.send_timeout_ms must be greater than zero",
            ));
        }
        if self.outbound.max_content_length == 0 {
            return Err(FlorachatError::config_error(
                "outbound.max_content_length must be greater than zero",
            ));
        }
        if self.connection.handshake_timeout_ms == 0 {
            return Err(FlorachatError::config_error(
                "connection.handshake_timeout_ms must be greater than zero",
            ));
        }
        if self.store.max_messages_per_room == 0 {
            return Err(FlorachatError::config_error(
                "store.max_messages_per_room must be greater than zero",
            ));
        }
        let channels = &self.channels;
        if channels.command_buffer_size == 0
            || channels.outbound_frame_buffer_size == 0
            || channels.inbound_frame_buffer_size == 0
            || channels.session_event_buffer_size == 0
        {
            return Err(FlorachatError::config_error(
                "channel buffer sizes must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
