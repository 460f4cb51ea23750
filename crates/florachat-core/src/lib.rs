//! FloraChat Core
//!
//! Sans-IO building blocks of the FloraChat real-time messaging session layer:
//! identifiers, the optimistic per-room message store, room membership tracking,
//! outbound send tracking, the connection state machine and the wire protocol.
//!
//! Nothing in this crate performs I/O or spawns tasks. The `florachat-runtime`
//! crate drives these types from async tasks.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod backoff;
pub mod config;
pub mod connection_state;
pub mod errors;
pub mod history;
pub mod message;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use backoff::Backoff;
pub use config::{
    BackoffConfig, ChannelConfig, ConnectionConfig, HistoryConfig, MessageStoreConfig,
    OutboundConfig, SessionConfig,
};
pub use connection_state::{AuditEntry, ConnectionEvent, ConnectionStatus, StateTransitionError};
pub use errors::{
    AuthError, FlorachatError, FlorachatResult, HistoryFetchError, NetworkError, Result,
};
pub use history::{HistoryPage, MergeReport};
pub use message::{ConfirmedMessage, Draft, Message, MessageStatus, SenderRole};
pub use outbound::{OutboundStatistics, OutboundTracker, SendOutcome, TrackedSend};
pub use protocol::{ClientFrame, ServerFrame};
pub use registry::{JoinOutcome, LeaveOutcome, RegistryStats, RoomRegistry};
pub use store::{
    MatchKind, MessageStore, MessageStoreStats, ReconcileOutcome, Snapshot, SnapshotCallback,
    SubscriptionId,
};
pub use types::{
    CorrelationId, MessageId, RoomId, SystemTimeSource, TimeSource, Timestamp, UserId,
};
