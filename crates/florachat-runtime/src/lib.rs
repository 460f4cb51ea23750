//! FloraChat Runtime
//!
//! Async engine around the sans-IO core: a connection driver task that owns
//! the transport link, the optimistic outbound queue, the history loader and
//! the [`ChatSession`] that ties them together.
//!
//! ```text
//! UI ─send─▶ OutboundQueue ─▶ MessageStore (pending) ─▶ driver ─▶ server
//! server ─▶ driver ─▶ RoomRegistry (route) ─▶ MessageStore (reconcile) ─▶ UI
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod api;
pub mod builder;
pub mod connection;
pub mod events;
pub mod history;
pub mod outbound;
pub mod session;
pub mod state;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use api::{HistoryApi, RoomProvisioner};
pub use builder::SessionBuilder;
pub use connection::{ConnectionCommand, ConnectionHandle, ConnectionManager, ConnectionStatistics};
pub use events::{SessionEvent, SessionEventReceiver, SessionEventSender};
pub use history::HistoryLoader;
pub use outbound::{Identity, OutboundQueue};
pub use session::{ChatSession, SessionStatistics};
pub use state::{SessionState, SharedState};
pub use transport::{
    create_link, AuthToken, FrameReceiver, FrameSender, Transport, TransportEnds, TransportLink,
};
