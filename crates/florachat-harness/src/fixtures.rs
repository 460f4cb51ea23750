//! Shared test fixtures

use florachat_core::{ConfirmedMessage, MessageId, RoomId, SenderRole, Timestamp, UserId};
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber writing through the test harness
///
/// Safe to call from every test; only the first call installs anything.
/// Honors `RUST_LOG`, defaulting to `debug` for the FloraChat crates.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("florachat_core=debug,florachat_runtime=debug,florachat_ws=debug")
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// Confirmed message authored by a regular user
pub fn confirmed_message(
    id: u64,
    room_id: &RoomId,
    sender: &str,
    content: &str,
    created_at: u64,
) -> ConfirmedMessage {
    ConfirmedMessage {
        id: MessageId::new(id),
        correlation_id: None,
        room_id: room_id.clone(),
        sender_id: UserId::new(sender),
        sender_role: SenderRole::User,
        content: content.to_string(),
        created_at: Timestamp::new(created_at),
        read: false,
    }
}
