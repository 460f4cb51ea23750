//! Helpers shared by the session integration tests

#![allow(dead_code)]

use florachat_core::{ConnectionStatus, RoomId, SenderRole, SessionConfig, UserId};
use florachat_harness::{init_test_logging, FakeServer, InMemoryHistoryApi, InMemoryProvisioner};
use florachat_runtime::{AuthToken, ChatSession, SessionBuilder, SessionEvent, SessionEventReceiver};
use std::time::Duration;
use tokio::time::timeout;

pub const ADMIN: &str = "admin-1";

/// Upper bound for anything a test waits on; tokio time is paused so this
/// only trips when the awaited thing never happens
pub const WAIT: Duration = Duration::from_secs(60);

pub fn room(name: &str) -> RoomId {
    RoomId::new(name)
}

pub fn token() -> AuthToken {
    AuthToken::new("admin-token")
}

pub fn session_with(server: &FakeServer, history: &InMemoryHistoryApi) -> ChatSession {
    init_test_logging();
    SessionBuilder::new(UserId::new(ADMIN), SenderRole::Admin)
        .with_config(SessionConfig::testing())
        .with_transport(server.transport())
        .with_history_api(history.clone())
        .with_provisioner(InMemoryProvisioner::new(UserId::new(ADMIN)))
        .build()
        .expect("session builds")
}

pub fn session(server: &FakeServer) -> ChatSession {
    session_with(server, &InMemoryHistoryApi::new())
}

/// Connected session with the given rooms joined
pub async fn joined_session(server: &FakeServer, rooms: &[&RoomId]) -> ChatSession {
    let session = session(server);
    session.connect(token()).await.expect("connect");
    for room_id in rooms {
        session.join_room(room_id).await.expect("join");
    }
    session
}

/// Next event matching `predicate`, skipping everything else
pub async fn next_event<F>(events: &mut SessionEventReceiver, mut predicate: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(error) => panic!("event stream ended: {error}"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Wait for a `StatusChanged` event into `status`
pub async fn wait_for_status(events: &mut SessionEventReceiver, status: ConnectionStatus) {
    next_event(events, |event| {
        matches!(event, SessionEvent::StatusChanged { to, .. } if *to == status)
    })
    .await;
}
