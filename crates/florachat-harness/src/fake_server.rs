//! Scripted in-memory chat server
//!
//! [`FakeServer`] behaves like the real room-addressed pub/sub endpoint: it
//! tracks joined rooms per connection and, when auto-echo is on, answers every
//! `send` with a confirmed `message` broadcast to the sender. Tests script
//! failures (rejected credentials, refused handshakes, dropped links) and push
//! arbitrary frames to simulate traffic from other participants.

use async_trait::async_trait;
use florachat_core::{
    AuthError, ChannelConfig, ClientFrame, ConfirmedMessage, MessageId, NetworkError, Result,
    RoomId, SenderRole, ServerFrame, SystemTimeSource, TimeSource, UserId,
};
use florachat_runtime::{create_link, AuthToken, Transport, TransportLink};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

// ----------------------------------------------------------------------------
// Server State
// ----------------------------------------------------------------------------

struct ActiveConnection {
    id: u64,
    to_client: mpsc::Sender<ServerFrame>,
    reader: JoinHandle<()>,
    joined: HashSet<RoomId>,
}

struct ServerState {
    valid_token: Option<String>,
    reject_all: bool,
    failures_remaining: u32,
    auto_echo: bool,
    echo_correlation: bool,
    sender_id: UserId,
    sender_role: SenderRole,
    next_message_id: u64,
    next_connection_id: u64,
    open_attempts: u32,
    connection: Option<ActiveConnection>,
    /// Frames written to the client as soon as its next link opens
    greeting: Vec<ServerFrame>,
    received: Vec<ClientFrame>,
}

/// Scripted stand-in for the chat server
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    frames_arrived: Arc<Notify>,
    clock: Arc<dyn TimeSource>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemTimeSource))
    }

    /// Stamp echoed messages with the given clock
    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                valid_token: None,
                reject_all: false,
                failures_remaining: 0,
                auto_echo: true,
                echo_correlation: true,
                sender_id: UserId::new("admin-1"),
                sender_role: SenderRole::Admin,
                next_message_id: 1,
                next_connection_id: 0,
                open_attempts: 0,
                connection: None,
                greeting: Vec::new(),
                received: Vec::new(),
            })),
            frames_arrived: Arc::new(Notify::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport connecting to this server
    pub fn transport(&self) -> FakeTransport {
        FakeTransport {
            server: self.clone(),
            channels: ChannelConfig::default(),
        }
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Only accept this bearer token
    pub fn require_token(&self, token: &str) {
        self.lock().valid_token = Some(token.to_string());
    }

    /// Reject every handshake with 401
    pub fn reject_credentials(&self, reject: bool) {
        self.lock().reject_all = reject;
    }

    /// Refuse the next `count` handshakes with a network error
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Answer sends with a confirmed echo
    pub fn set_auto_echo(&self, enabled: bool) {
        self.lock().auto_echo = enabled;
    }

    /// Include the client correlation id in echoes
    pub fn set_echo_correlation(&self, enabled: bool) {
        self.lock().echo_correlation = enabled;
    }

    /// Identity the credential maps to
    pub fn set_identity(&self, user_id: UserId, role: SenderRole) {
        let mut state = self.lock();
        state.sender_id = user_id;
        state.sender_role = role;
    }

    /// Id the next echoed or generated message receives
    pub fn set_next_message_id(&self, id: u64) {
        self.lock().next_message_id = id;
    }

    /// Sever the current link from the server side
    pub fn drop_connection(&self) {
        if let Some(connection) = self.lock().connection.take() {
            debug!(connection = connection.id, "fake server dropping connection");
            connection.reader.abort();
        }
    }

    /// Deliver a frame to the client regardless of room membership
    ///
    /// Models a frame already in flight when the client changed rooms.
    pub fn push(&self, frame: ServerFrame) -> bool {
        let state = self.lock();
        match &state.connection {
            Some(connection) => connection.to_client.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Broadcast a message into a room; only delivered if the client joined it
    pub fn broadcast(&self, message: ConfirmedMessage) -> bool {
        let state = self.lock();
        match &state.connection {
            Some(connection) if connection.joined.contains(&message.room_id) => connection
                .to_client
                .try_send(ServerFrame::Message { message })
                .is_ok(),
            _ => false,
        }
    }

    /// Have the next accepted link start with `frame` already in flight
    ///
    /// The frame is queued before the client can write anything, like traffic
    /// the server flushes right after the handshake.
    pub fn queue_on_next_connection(&self, frame: ServerFrame) {
        self.lock().greeting.push(frame);
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn received_frames(&self) -> Vec<ClientFrame> {
        self.lock().received.clone()
    }

    pub fn sent_messages(&self) -> Vec<ClientFrame> {
        self.lock()
            .received
            .iter()
            .filter(|f| matches!(f, ClientFrame::Send { .. }))
            .cloned()
            .collect()
    }

    pub fn clear_received(&self) {
        self.lock().received.clear();
    }

    /// Rooms joined on the current connection
    pub fn joined_rooms(&self) -> HashSet<RoomId> {
        self.lock()
            .connection
            .as_ref()
            .map(|c| c.joined.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    /// Wait until at least `count` client frames have arrived
    pub async fn wait_for_frames(&self, count: usize) -> Vec<ClientFrame> {
        loop {
            let arrived = self.frames_arrived.notified();
            {
                let state = self.lock();
                if state.received.len() >= count {
                    return state.received.clone();
                }
            }
            arrived.await;
        }
    }

    // ------------------------------------------------------------------------
    // Connection handling
    // ------------------------------------------------------------------------

    fn accept(&self, token: &AuthToken, channels: &ChannelConfig) -> Result<TransportLink> {
        let mut state = self.lock();
        state.open_attempts += 1;

        let token_ok = state
            .valid_token
            .as_deref()
            .map(|valid| valid == token.expose())
            .unwrap_or(true);
        if state.reject_all || !token_ok {
            return Err(AuthError::Rejected { status: 401 }.into());
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(NetworkError::ConnectFailed {
                endpoint: "fake://server".into(),
                reason: "connection refused".into(),
            }
            .into());
        }

        if let Some(previous) = state.connection.take() {
            previous.reader.abort();
        }

        let (link, ends) = create_link(channels);
        for frame in state.greeting.drain(..) {
            if ends.inbound.try_send(frame).is_err() {
                debug!("greeting frame did not fit the inbound buffer");
            }
        }
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let server = self.clone();
        let mut from_client = ends.outbound;
        let reader = tokio::spawn(async move {
            while let Some(frame) = from_client.recv().await {
                server.handle_client_frame(id, frame);
            }
            server.connection_closed(id);
        });
        state.connection = Some(ActiveConnection {
            id,
            to_client: ends.inbound,
            reader,
            joined: HashSet::new(),
        });
        debug!(connection = id, "fake server accepted connection");
        Ok(link)
    }

    fn handle_client_frame(&self, connection_id: u64, frame: ClientFrame) {
        {
            let mut state = self.lock();
            state.received.push(frame.clone());
            let now = self.clock.now();
            let ServerState {
                connection,
                auto_echo,
                echo_correlation,
                sender_id,
                sender_role,
                next_message_id,
                ..
            } = &mut *state;

            if let Some(connection) = connection.as_mut().filter(|c| c.id == connection_id) {
                match frame {
                    ClientFrame::Join { room_id } => {
                        connection.joined.insert(room_id);
                    }
                    ClientFrame::Leave { room_id } => {
                        connection.joined.remove(&room_id);
                    }
                    ClientFrame::Send {
                        room_id,
                        content,
                        correlation_id,
                    } if *auto_echo && connection.joined.contains(&room_id) => {
                        let message = ConfirmedMessage {
                            id: MessageId::new(*next_message_id),
                            correlation_id: echo_correlation.then_some(correlation_id),
                            room_id,
                            sender_id: sender_id.clone(),
                            sender_role: *sender_role,
                            content,
                            created_at: now,
                            read: false,
                        };
                        *next_message_id += 1;
                        let _ = connection
                            .to_client
                            .try_send(ServerFrame::Message { message });
                    }
                    ClientFrame::Send { .. } => {}
                }
            }
        }
        self.frames_arrived.notify_waiters();
    }

    fn connection_closed(&self, connection_id: u64) {
        let mut state = self.lock();
        if state
            .connection
            .as_ref()
            .map(|c| c.id == connection_id)
            .unwrap_or(false)
        {
            state.connection = None;
        }
    }
}

// ----------------------------------------------------------------------------
// Fake Transport
// ----------------------------------------------------------------------------

/// [`Transport`] connecting to a [`FakeServer`]
pub struct FakeTransport {
    server: FakeServer,
    channels: ChannelConfig,
}

impl FakeTransport {
    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&mut self, token: &AuthToken) -> Result<TransportLink> {
        self.server.accept(token, &self.channels)
    }

    fn endpoint(&self) -> String {
        "fake://server".to_string()
    }
}
