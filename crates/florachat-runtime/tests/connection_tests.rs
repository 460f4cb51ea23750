//! Connection lifecycle: handshake, reconnect with replay, credential handling

mod common;

use common::*;
use florachat_core::{
    ClientFrame, ConnectionEvent, ConnectionStatus, FlorachatError, JoinOutcome, RoomId,
    ServerFrame, UserId,
};
use florachat_harness::{confirmed_message, FakeServer};
use florachat_runtime::SessionEvent;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test(start_paused = true)]
async fn test_connect_moves_through_connecting() {
    let server = FakeServer::new();
    let session = session(&server);
    let mut events = session.events();
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    session.connect(token()).await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert!(server.is_connected());

    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::StatusChanged {
            from: ConnectionStatus::Disconnected,
            to: ConnectionStatus::Connecting,
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::StatusChanged {
            from: ConnectionStatus::Connecting,
            to: ConnectionStatus::Connected,
        }
    );

    let audit = session.audit_trail().await.unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[1].event, ConnectionEvent::HandshakeSucceeded);
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_is_noop() {
    let server = FakeServer::new();
    let session = session(&server);
    session.connect(token()).await.unwrap();
    session.connect(token()).await.unwrap();
    assert_eq!(server.open_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_end_disconnected() {
    let server = FakeServer::new();
    server.require_token("someone-else");
    let session = session(&server);
    let mut events = session.events();

    let result = session.connect(token()).await;
    assert!(matches!(result, Err(FlorachatError::Auth(_))));
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    next_event(&mut events, |e| matches!(e, SessionEvent::AuthRejected { .. })).await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_handshake_can_be_retried_manually() {
    let server = FakeServer::new();
    server.fail_next_opens(1);
    let session = session(&server);

    let result = session.connect(token()).await;
    assert!(matches!(result, Err(FlorachatError::Network(_))));
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    session.connect(token()).await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Connected);
}

// ----------------------------------------------------------------------------
// Reconnect
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_joins_before_connected() {
    let server = FakeServer::new();
    let first = room("admin:1:user:2");
    let second = room("admin:1:user:3");
    let session = joined_session(&server, &[&first, &second]).await;
    server.wait_for_frames(2).await;
    server.clear_received();
    let mut events = session.events();

    server.drop_connection();
    wait_for_status(&mut events, ConnectionStatus::Reconnecting).await;
    wait_for_status(&mut events, ConnectionStatus::Connected).await;

    let frames = server.wait_for_frames(2).await;
    assert_eq!(
        frames,
        vec![
            ClientFrame::Join {
                room_id: first.clone()
            },
            ClientFrame::Join {
                room_id: second.clone()
            },
        ]
    );
    assert_eq!(server.joined_rooms(), HashSet::from([first, second]));

    let stats = session.statistics().await.unwrap();
    assert_eq!(stats.connection.link_drops, 1);
    assert_eq!(stats.connection.reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delivers_inbound_only_after_rejoin() {
    let server = FakeServer::new();
    let first = room("admin:1:user:2");
    let second = room("admin:1:user:3");
    let session = joined_session(&server, &[&first, &second]).await;
    server.wait_for_frames(2).await;
    server.clear_received();

    // Status as seen by the subscriber when the message lands
    let status = session.status_watch();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    session
        .subscribe(
            &first,
            Box::new(move |snapshot| {
                if !snapshot.is_empty() {
                    let _ = seen_tx.send(*status.borrow());
                }
            }),
        )
        .await;

    server.queue_on_next_connection(ServerFrame::Message {
        message: confirmed_message(7, &first, "user-2", "while you were away", 1_000),
    });
    server.drop_connection();

    let status_at_delivery = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(status_at_delivery, ConnectionStatus::Connected);

    let frames = server.wait_for_frames(2).await;
    assert_eq!(
        frames[..2],
        [
            ClientFrame::Join {
                room_id: first.clone()
            },
            ClientFrame::Join { room_id: second },
        ]
    );
    assert_eq!(session.snapshot(&first).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let server = FakeServer::new();
    let session = joined_session(&server, &[&room("admin:1:user:2")]).await;
    let mut events = session.events();

    server.fail_next_opens(10);
    server.drop_connection();
    wait_for_status(&mut events, ConnectionStatus::Reconnecting).await;
    wait_for_status(&mut events, ConnectionStatus::Disconnected).await;

    // One initial handshake plus three reconnect attempts
    assert_eq!(server.open_attempts(), 4);
    let stats = session.statistics().await.unwrap();
    assert_eq!(stats.connection.reconnect_attempts, 3);
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_after_transient_failures() {
    let server = FakeServer::new();
    let session = joined_session(&server, &[&room("admin:1:user:2")]).await;
    let mut events = session.events();

    server.fail_next_opens(2);
    server.drop_connection();
    wait_for_status(&mut events, ConnectionStatus::Connected).await;
    assert_eq!(server.open_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_credential_rejected_during_reconnect_stops_retrying() {
    let server = FakeServer::new();
    let session = joined_session(&server, &[]).await;
    let mut events = session.events();

    server.reject_credentials(true);
    server.drop_connection();
    next_event(&mut events, |e| matches!(e, SessionEvent::AuthRejected { .. })).await;
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert_eq!(server.open_attempts(), 2);
}

// ----------------------------------------------------------------------------
// Offline Behavior
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_is_rejected() {
    let server = FakeServer::new();
    let session = session(&server);
    let lobby = room("admin:1:user:2");
    session.join_room(&lobby).await.unwrap();

    let result = session.send(&lobby, "hello").await;
    assert!(matches!(
        result,
        Err(FlorachatError::NotConnected {
            status: ConnectionStatus::Disconnected
        })
    ));
    assert!(session.snapshot(&lobby).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_validation() {
    let server = FakeServer::new();
    let lobby = room("admin:1:user:2");
    let session = joined_session(&server, &[&lobby]).await;

    let unjoined = session.send(&room("admin:1:user:9"), "hello").await;
    assert!(matches!(unjoined, Err(FlorachatError::RoomNotJoined { .. })));

    let blank = session.send(&lobby, "   ").await;
    assert!(matches!(blank, Err(FlorachatError::InvalidContent { .. })));

    let oversized = session.send(&lobby, &"x".repeat(4_001)).await;
    assert!(matches!(oversized, Err(FlorachatError::InvalidContent { .. })));

    assert!(session.snapshot(&lobby).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offline_join_is_replayed_on_connect() {
    let server = FakeServer::new();
    let session = session(&server);
    let lobby = room("admin:1:user:2");

    let outcome = session.join_room(&lobby).await.unwrap();
    assert!(matches!(outcome, JoinOutcome::Joined { .. }));
    assert!(session.is_joined(&lobby).await);

    session.connect(token()).await.unwrap();
    server.wait_for_frames(1).await;
    assert_eq!(server.joined_rooms(), HashSet::from([lobby]));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_keeps_rooms_and_is_idempotent() {
    let server = FakeServer::new();
    let lobby = room("admin:1:user:2");
    let session = joined_session(&server, &[&lobby]).await;

    session.disconnect().await.unwrap();
    session.disconnect().await.unwrap();
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert_eq!(session.joined_rooms().await, vec![lobby.clone()]);

    server.clear_received();
    session.connect(token()).await.unwrap();
    let frames = server.wait_for_frames(1).await;
    assert_eq!(frames, vec![ClientFrame::Join { room_id: lobby }]);
}

#[tokio::test(start_paused = true)]
async fn test_joining_twice_sends_one_frame() {
    let server = FakeServer::new();
    let lobby = room("admin:1:user:2");
    let session = joined_session(&server, &[&lobby]).await;

    let again = session.join_room(&lobby).await.unwrap();
    assert!(matches!(again, JoinOutcome::AlreadyJoined { .. }));
    session.leave_room(&lobby).await.unwrap();

    let frames = server.wait_for_frames(2).await;
    assert_eq!(
        frames,
        vec![
            ClientFrame::Join {
                room_id: lobby.clone()
            },
            ClientFrame::Leave { room_id: lobby },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_conversation_joins_direct_room() {
    let server = FakeServer::new();
    let session = joined_session(&server, &[]).await;
    let participant = UserId::new("user-7");

    let room_id = session.open_conversation(&participant).await.unwrap();
    assert_eq!(room_id, RoomId::direct(&UserId::new(ADMIN), &participant));
    assert!(session.is_joined(&room_id).await);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_driver() {
    let server = FakeServer::new();
    let session = joined_session(&server, &[]).await;
    let status = session.status_watch();

    session.shutdown().await;
    assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
}
