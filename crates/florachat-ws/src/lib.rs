//! FloraChat network collaborators
//!
//! [`WsTransport`] speaks the room-addressed JSON frame protocol over a
//! WebSocket; [`RestClient`] serves room history pages and provisions direct
//! conversations over HTTP. Both plug into a
//! [`SessionBuilder`](florachat_runtime::SessionBuilder) through
//! [`session_builder`].

pub mod endpoints;
pub mod rest;
pub mod transport;

pub use endpoints::{session_builder, Endpoints};
pub use rest::RestClient;
pub use transport::WsTransport;
