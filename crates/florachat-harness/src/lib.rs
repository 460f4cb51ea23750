//! FloraChat Harness
//!
//! Deterministic doubles for exercising a `ChatSession` without a network: a
//! scripted in-memory server reachable through [`FakeTransport`], in-memory
//! REST collaborators, a manual clock and test log initialisation.

pub mod clock;
pub mod fake_server;
pub mod fixtures;
pub mod rest;

pub use clock::ManualTimeSource;
pub use fake_server::{FakeServer, FakeTransport};
pub use fixtures::{confirmed_message, init_test_logging};
pub use rest::{InMemoryHistoryApi, InMemoryProvisioner};
