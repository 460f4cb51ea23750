//! Connection manager
//!
//! A single driver task owns the transport link. Everything that must touch
//! the link (connect, disconnect, joins, leaves, outbound frames) arrives as a
//! [`ConnectionCommand`] over an mpsc channel and is applied strictly in order.
//! The driver also reads inbound frames, routes them through the room registry
//! into the message store, and runs reconnection with bounded backoff.
//!
//! After a reconnect the driver re-issues `join` for every joined room, in join
//! order, before it publishes `Connected` and before it reads another inbound
//! frame.

use crate::events::{publish, SessionEvent, SessionEventSender};
use crate::state::SharedState;
use crate::transport::{AuthToken, Transport, TransportLink};
use florachat_core::{
    AuditEntry, Backoff, BackoffConfig, ClientFrame, ConfirmedMessage, ConnectionConfig,
    ConnectionEvent, ConnectionStatus, FlorachatError, JoinOutcome, LeaveOutcome, NetworkError,
    ReconcileOutcome, Result, RoomId, SendOutcome, ServerFrame, SessionConfig, TimeSource,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Requests handled by the connection driver
#[derive(Debug)]
pub enum ConnectionCommand {
    Connect {
        token: AuthToken,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Join {
        room_id: RoomId,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Leave {
        room_id: RoomId,
        reply: oneshot::Sender<LeaveOutcome>,
    },
    /// Leave and join as one step; no inbound frame is handled in between
    Switch {
        from: Option<RoomId>,
        to: RoomId,
        reply: oneshot::Sender<(LeaveOutcome, JoinOutcome)>,
    },
    /// Fire-and-forget frame; dropped unless connected
    Emit { frame: ClientFrame },
    Statistics {
        reply: oneshot::Sender<ConnectionStatistics>,
    },
    AuditTrail {
        reply: oneshot::Sender<Vec<AuditEntry>>,
    },
    Shutdown,
}

/// Counters kept by the connection driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    pub connect_attempts: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
    pub link_drops: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    /// Inbound frames for rooms that are not joined
    pub frames_dropped_unjoined: u64,
    /// Outbound frames discarded while not connected
    pub frames_dropped_offline: u64,
    /// Sends discarded because their room was left before they went out
    pub frames_dropped_left_room: u64,
    pub invalid_transitions: u64,
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable front end of the connection driver
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<ConnectionCommand>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> ConnectionCommand,
    ) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| FlorachatError::channel_error("connection driver has stopped"))?;
        response
            .await
            .map_err(|_| FlorachatError::channel_error("connection driver dropped the request"))
    }

    /// Establish the connection; no-op when already connected or connecting
    pub async fn connect(&self, token: AuthToken) -> Result<()> {
        self.request(|reply| ConnectionCommand::Connect { token, reply })
            .await?
    }

    /// Close the link and cancel any pending reconnect; idempotent
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| ConnectionCommand::Disconnect { reply })
            .await
    }

    pub async fn join(&self, room_id: RoomId) -> Result<JoinOutcome> {
        self.request(|reply| ConnectionCommand::Join { room_id, reply })
            .await
    }

    pub async fn leave(&self, room_id: RoomId) -> Result<LeaveOutcome> {
        self.request(|reply| ConnectionCommand::Leave { room_id, reply })
            .await
    }

    pub async fn switch(
        &self,
        from: Option<RoomId>,
        to: RoomId,
    ) -> Result<(LeaveOutcome, JoinOutcome)> {
        self.request(|reply| ConnectionCommand::Switch { from, to, reply })
            .await
    }

    pub async fn emit(&self, frame: ClientFrame) -> Result<()> {
        self.commands
            .send(ConnectionCommand::Emit { frame })
            .await
            .map_err(|_| FlorachatError::channel_error("connection driver has stopped"))
    }

    pub async fn statistics(&self) -> Result<ConnectionStatistics> {
        self.request(|reply| ConnectionCommand::Statistics { reply })
            .await
    }

    pub async fn audit_trail(&self) -> Result<Vec<AuditEntry>> {
        self.request(|reply| ConnectionCommand::AuditTrail { reply })
            .await
    }

    pub async fn shutdown(&self) {
        if self.commands.send(ConnectionCommand::Shutdown).await.is_err() {
            debug!("connection driver already stopped");
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

/// Driver task owning the transport link
pub struct ConnectionManager<T: Transport> {
    transport: T,
    connection_config: ConnectionConfig,
    reconnect_config: BackoffConfig,
    state: SharedState,
    events: SessionEventSender,
    time_source: Arc<dyn TimeSource>,
    commands: mpsc::Receiver<ConnectionCommand>,
    status_tx: watch::Sender<ConnectionStatus>,
    status: ConnectionStatus,
    link: Option<TransportLink>,
    token: Option<AuthToken>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    audit_trail: VecDeque<AuditEntry>,
    stats: ConnectionStatistics,
}

impl<T: Transport> ConnectionManager<T> {
    /// Spawn the driver task and return its handle
    pub fn spawn(
        transport: T,
        config: &SessionConfig,
        state: SharedState,
        events: SessionEventSender,
        time_source: Arc<dyn TimeSource>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.channels.command_buffer_size);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let manager = Self {
            transport,
            connection_config: config.connection.clone(),
            reconnect_config: config.reconnect.clone(),
            state,
            events,
            time_source,
            commands: command_rx,
            status_tx,
            status: ConnectionStatus::Disconnected,
            link: None,
            token: None,
            backoff: Backoff::new(config.reconnect.clone()),
            reconnect_at: None,
            audit_trail: VecDeque::new(),
            stats: ConnectionStatistics::default(),
        };
        let task = tokio::spawn(manager.run());
        (
            ConnectionHandle {
                commands: command_tx,
                status: status_rx,
            },
            task,
        )
    }

    /// Main driver loop
    pub async fn run(mut self) {
        info!(endpoint = %self.transport.endpoint(), "connection driver started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                frame = next_frame(&mut self.link) => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => self.handle_link_dropped("inbound channel closed"),
                },
                _ = reconnect_timer(self.reconnect_at) => self.attempt_reconnect().await,
            }
        }

        self.disconnect();
        info!("connection driver stopped");
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect { token, reply } => {
                let result = self.connect(token).await;
                let _ = reply.send(result);
            }
            ConnectionCommand::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            ConnectionCommand::Join { room_id, reply } => {
                let outcome = self.join(room_id).await;
                let _ = reply.send(outcome);
            }
            ConnectionCommand::Leave { room_id, reply } => {
                let outcome = self.leave(room_id).await;
                let _ = reply.send(outcome);
            }
            ConnectionCommand::Switch { from, to, reply } => {
                let outcome = self.switch(from, to).await;
                let _ = reply.send(outcome);
            }
            ConnectionCommand::Emit { frame } => self.emit(frame).await,
            ConnectionCommand::Statistics { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            ConnectionCommand::AuditTrail { reply } => {
                let _ = reply.send(self.audit_trail.iter().cloned().collect());
            }
            // Handled by the run loop
            ConnectionCommand::Shutdown => {}
        }
    }

    async fn connect(&mut self, token: AuthToken) -> Result<()> {
        match self.status {
            ConnectionStatus::Connected | ConnectionStatus::Connecting => {
                debug!(status = %self.status, "connect ignored, already connected");
                return Ok(());
            }
            ConnectionStatus::Reconnecting => {
                // Next attempt uses the fresh credential
                self.token = Some(token);
                return Ok(());
            }
            ConnectionStatus::Disconnected => {}
        }

        self.token = Some(token.clone());
        self.stats.connect_attempts += 1;
        self.apply(ConnectionEvent::Connect);

        match self.open_and_replay(&token).await {
            Ok(()) => {
                self.backoff.reset();
                self.apply(ConnectionEvent::HandshakeSucceeded);
                Ok(())
            }
            Err(FlorachatError::Auth(auth_error)) => {
                self.reject_credential(auth_error.to_string());
                Err(FlorachatError::Auth(auth_error))
            }
            Err(error) => {
                error!(endpoint = %self.transport.endpoint(), %error, "connect failed");
                self.link = None;
                self.apply(ConnectionEvent::HandshakeFailed);
                Err(error)
            }
        }
    }

    fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.link = None;
        self.backoff.reset();
        if self.status != ConnectionStatus::Disconnected {
            self.apply(ConnectionEvent::Disconnect);
        }
    }

    async fn join(&mut self, room_id: RoomId) -> JoinOutcome {
        let outcome = {
            let mut state = self.state.lock().await;
            let outcome = state.registry.join_room(&room_id);
            state.store.activate_room(&room_id);
            outcome
        };
        if outcome.needs_frame() {
            publish(
                &self.events,
                SessionEvent::RoomJoined {
                    room_id: room_id.clone(),
                    generation: outcome.generation(),
                },
            );
            // While offline the replay after connecting covers it
            if self.status == ConnectionStatus::Connected {
                self.send_frame(ClientFrame::Join { room_id }).await;
            }
        }
        outcome
    }

    async fn leave(&mut self, room_id: RoomId) -> LeaveOutcome {
        let outcome = {
            let mut state = self.state.lock().await;
            let outcome = state.registry.leave_room(&room_id);
            if outcome == LeaveOutcome::Left {
                state.store.retire_room(&room_id);
            }
            outcome
        };
        if outcome == LeaveOutcome::Left {
            publish(
                &self.events,
                SessionEvent::RoomLeft {
                    room_id: room_id.clone(),
                },
            );
            if self.status == ConnectionStatus::Connected {
                self.send_frame(ClientFrame::Leave { room_id }).await;
            }
        }
        outcome
    }

    async fn switch(&mut self, from: Option<RoomId>, to: RoomId) -> (LeaveOutcome, JoinOutcome) {
        let (left, joined) = {
            let mut state = self.state.lock().await;
            let (left, joined) = state.registry.switch_room(from.as_ref(), &to);
            if let (LeaveOutcome::Left, Some(from)) = (left, from.as_ref()) {
                state.store.retire_room(from);
            }
            state.store.activate_room(&to);
            (left, joined)
        };

        if let (LeaveOutcome::Left, Some(from)) = (left, from) {
            publish(
                &self.events,
                SessionEvent::RoomLeft {
                    room_id: from.clone(),
                },
            );
            if self.status == ConnectionStatus::Connected {
                self.send_frame(ClientFrame::Leave { room_id: from }).await;
            }
        }
        if joined.needs_frame() {
            publish(
                &self.events,
                SessionEvent::RoomJoined {
                    room_id: to.clone(),
                    generation: joined.generation(),
                },
            );
            if self.status == ConnectionStatus::Connected {
                self.send_frame(ClientFrame::Join { room_id: to }).await;
            }
        }
        (left, joined)
    }

    async fn emit(&mut self, frame: ClientFrame) {
        if self.status != ConnectionStatus::Connected {
            self.stats.frames_dropped_offline += 1;
            debug!(status = %self.status, room_id = %frame.room_id(), "dropping frame while offline");
            return;
        }
        if let ClientFrame::Send { room_id, .. } = &frame {
            // The room may have been left after the send was accepted
            if !self.state.lock().await.registry.is_joined(room_id) {
                self.stats.frames_dropped_left_room += 1;
                debug!(room_id = %room_id, "dropping send for a room that was left");
                return;
            }
        }
        self.send_frame(frame).await;
    }

    // ------------------------------------------------------------------------
    // Link management
    // ------------------------------------------------------------------------

    async fn open_link(&mut self, token: &AuthToken) -> Result<TransportLink> {
        let limit = self.connection_config.handshake_timeout();
        match timeout(limit, self.transport.open(token)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::HandshakeTimeout {
                duration_ms: self.connection_config.handshake_timeout_ms,
            }
            .into()),
        }
    }

    /// Open a link and re-issue joins for every joined room, in join order
    async fn open_and_replay(&mut self, token: &AuthToken) -> Result<()> {
        let link = self.open_link(token).await?;
        let rooms = self.state.lock().await.registry.joined_rooms();
        self.link = Some(link);
        for room_id in rooms {
            debug!(room_id = %room_id, "replaying join");
            if !self.write_frame(ClientFrame::Join { room_id }).await {
                return Err(NetworkError::LinkClosed {
                    reason: "link closed while replaying joins".into(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Write a frame; `false` if the link is gone
    async fn write_frame(&mut self, frame: ClientFrame) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match link.outbound.send(frame).await {
            Ok(()) => {
                self.stats.frames_sent += 1;
                true
            }
            Err(_) => {
                self.link = None;
                false
            }
        }
    }

    /// Write a frame while connected, treating a failed write as a drop
    async fn send_frame(&mut self, frame: ClientFrame) {
        if !self.write_frame(frame).await {
            self.handle_link_dropped("outbound write failed");
        }
    }

    fn handle_link_dropped(&mut self, reason: &str) {
        self.link = None;
        if self.status != ConnectionStatus::Connected {
            return;
        }
        warn!(reason, "connection lost");
        self.stats.link_drops += 1;
        self.apply(ConnectionEvent::LinkDropped);
        self.backoff.reset();
        if !self.schedule_reconnect() {
            self.apply(ConnectionEvent::AttemptsExhausted);
        }
    }

    fn schedule_reconnect(&mut self) -> bool {
        match self.backoff.next_delay() {
            Some(delay) => {
                debug!(
                    attempt = self.backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.reconnect_at = Some(Instant::now() + delay);
                true
            }
            None => false,
        }
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        if self.status != ConnectionStatus::Reconnecting {
            return;
        }
        let Some(token) = self.token.clone() else {
            self.apply(ConnectionEvent::AttemptsExhausted);
            return;
        };

        self.stats.reconnect_attempts += 1;
        info!(
            attempt = self.backoff.attempts(),
            max_attempts = self.reconnect_config.max_attempts,
            "reconnecting"
        );

        match self.open_and_replay(&token).await {
            Ok(()) => {
                self.backoff.reset();
                self.stats.reconnects += 1;
                self.apply(ConnectionEvent::HandshakeSucceeded);
            }
            Err(FlorachatError::Auth(auth_error)) => {
                self.reject_credential(auth_error.to_string());
            }
            Err(error) => {
                self.link = None;
                warn!(%error, attempt = self.backoff.attempts(), "reconnect attempt failed");
                if self.schedule_reconnect() {
                    self.apply(ConnectionEvent::HandshakeFailed);
                } else {
                    warn!("reconnect attempts exhausted, giving up");
                    self.apply(ConnectionEvent::AttemptsExhausted);
                }
            }
        }
    }

    fn reject_credential(&mut self, reason: String) {
        error!(reason = %reason, "credential rejected");
        self.link = None;
        self.token = None;
        self.reconnect_at = None;
        self.apply(ConnectionEvent::CredentialRejected);
        publish(&self.events, SessionEvent::AuthRejected { reason });
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn handle_frame(&mut self, frame: ServerFrame) {
        self.stats.frames_received += 1;
        match frame {
            ServerFrame::Message { message } => self.deliver(message).await,
            ServerFrame::Error { code, message } => {
                warn!(code = %code, message = %message, "server reported an error");
                publish(&self.events, SessionEvent::ServerError { code, message });
            }
        }
    }

    /// Route a confirmed message to its room and settle the matching send
    async fn deliver(&mut self, message: ConfirmedMessage) {
        let now = self.time_source.now();
        let mut state = self.state.lock().await;
        if !state.registry.route(&message.room_id) {
            self.stats.frames_dropped_unjoined += 1;
            return;
        }

        let room_id = message.room_id.clone();
        let message_id = message.id;
        let echoed = message.correlation_id;
        let settled = match state.store.reconcile(message) {
            ReconcileOutcome::Replaced { correlation_id, .. } => Some(correlation_id),
            ReconcileOutcome::Appended | ReconcileOutcome::Duplicate => echoed,
            ReconcileOutcome::Mismatch { correlation_id } => {
                publish(
                    &self.events,
                    SessionEvent::ReconciliationMismatch {
                        room_id,
                        correlation_id,
                        message_id,
                    },
                );
                return;
            }
        };

        if let Some(correlation_id) = settled {
            if state
                .tracker
                .resolve(&correlation_id, SendOutcome::Confirmed, now)
                .is_some()
            {
                debug!(room_id = %room_id, correlation_id = %correlation_id, "send confirmed");
                publish(
                    &self.events,
                    SessionEvent::SendConfirmed {
                        room_id,
                        correlation_id,
                        message_id,
                    },
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    fn apply(&mut self, event: ConnectionEvent) {
        let from = self.status;
        match from.transition(event) {
            Ok(to) => {
                self.status = to;
                self.record_audit(from, to, event);
                if from != to {
                    self.status_tx.send_replace(to);
                    info!(from = %from, to = %to, event = event.event_name(), "connection status changed");
                    publish(&self.events, SessionEvent::StatusChanged { from, to });
                }
            }
            Err(error) => {
                self.stats.invalid_transitions += 1;
                warn!(%error, "ignoring invalid connection transition");
            }
        }
    }

    fn record_audit(&mut self, from: ConnectionStatus, to: ConnectionStatus, event: ConnectionEvent) {
        if self.connection_config.audit_trail_len == 0 {
            return;
        }
        if self.audit_trail.len() >= self.connection_config.audit_trail_len {
            self.audit_trail.pop_front();
        }
        self.audit_trail.push_back(AuditEntry {
            timestamp: self.time_source.now(),
            from_state: from,
            to_state: to,
            event,
        });
    }
}

async fn next_frame(link: &mut Option<TransportLink>) -> Option<ServerFrame> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
