//! Chat session
//!
//! Explicit owner of one connection, its room registry, message store, outbound
//! queue and history loader. The presentation layer holds a `ChatSession` and
//! observes it through room snapshots, the status watch and session events.

use crate::api::RoomProvisioner;
use crate::connection::{ConnectionHandle, ConnectionStatistics};
use crate::events::{SessionEventReceiver, SessionEventSender};
use crate::history::HistoryLoader;
use crate::outbound::{Identity, OutboundQueue};
use crate::state::SharedState;
use crate::transport::AuthToken;
use florachat_core::{
    AuditEntry, ConnectionStatus, CorrelationId, FlorachatError, JoinOutcome, LeaveOutcome,
    MergeReport, MessageId, MessageStoreStats, OutboundStatistics, RegistryStats, Result, RoomId,
    Snapshot, SnapshotCallback, SubscriptionId, UserId,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Aggregated counters across the session components
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    pub connection: ConnectionStatistics,
    pub registry: RegistryStats,
    pub store: MessageStoreStats,
    pub outbound: OutboundStatistics,
}

/// Real-time messaging session
pub struct ChatSession {
    connection: ConnectionHandle,
    state: SharedState,
    outbound: OutboundQueue,
    history: HistoryLoader,
    provisioner: Option<Arc<dyn RoomProvisioner>>,
    events: SessionEventSender,
    driver: JoinHandle<()>,
}

impl ChatSession {
    pub(crate) fn new(
        connection: ConnectionHandle,
        state: SharedState,
        outbound: OutboundQueue,
        history: HistoryLoader,
        provisioner: Option<Arc<dyn RoomProvisioner>>,
        events: SessionEventSender,
        driver: JoinHandle<()>,
    ) -> Self {
        Self {
            connection,
            state,
            outbound,
            history,
            provisioner,
            events,
            driver,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.outbound.identity()
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    pub async fn connect(&self, token: AuthToken) -> Result<()> {
        self.connection.connect(token).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Watch channel carrying every status change
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.status_watch()
    }

    pub async fn audit_trail(&self) -> Result<Vec<AuditEntry>> {
        self.connection.audit_trail().await
    }

    // ------------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------------

    pub async fn join_room(&self, room_id: &RoomId) -> Result<JoinOutcome> {
        self.connection.join(room_id.clone()).await
    }

    /// Leave a room and abort its history fetches
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<LeaveOutcome> {
        self.history.cancel(room_id).await;
        self.connection.leave(room_id.clone()).await
    }

    /// Move from one room to another in a single step
    pub async fn switch_room(
        &self,
        from: Option<&RoomId>,
        to: &RoomId,
    ) -> Result<(LeaveOutcome, JoinOutcome)> {
        if let Some(from) = from.filter(|from| *from != to) {
            self.history.cancel(from).await;
        }
        self.connection.switch(from.cloned(), to.clone()).await
    }

    /// Provision the conversation with a participant and join it
    pub async fn open_conversation(&self, participant_id: &UserId) -> Result<RoomId> {
        let provisioner = self
            .provisioner
            .as_ref()
            .ok_or_else(|| FlorachatError::config_error("no room provisioner configured"))?;
        let room_id = provisioner.open_room(participant_id).await?;
        info!(room_id = %room_id, participant = %participant_id, "conversation opened");
        self.join_room(&room_id).await?;
        Ok(room_id)
    }

    pub async fn is_joined(&self, room_id: &RoomId) -> bool {
        self.state.lock().await.registry.is_joined(room_id)
    }

    pub async fn joined_rooms(&self) -> Vec<RoomId> {
        self.state.lock().await.registry.joined_rooms()
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    pub async fn send(&self, room_id: &RoomId, content: &str) -> Result<CorrelationId> {
        self.outbound.send(room_id, content).await
    }

    pub async fn resend(
        &self,
        room_id: &RoomId,
        correlation_id: &CorrelationId,
    ) -> Result<CorrelationId> {
        self.outbound.resend(room_id, correlation_id).await
    }

    pub async fn snapshot(&self, room_id: &RoomId) -> Snapshot {
        self.state.lock().await.store.get_snapshot(room_id)
    }

    /// Register a snapshot callback for a room
    ///
    /// Callbacks run while the session state is locked and must not call back
    /// into the session.
    pub async fn subscribe(&self, room_id: &RoomId, callback: SnapshotCallback) -> SubscriptionId {
        self.state.lock().await.store.subscribe(room_id, callback)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().await.store.unsubscribe(id)
    }

    pub async fn load_history(
        &self,
        room_id: &RoomId,
        cursor: Option<String>,
    ) -> Result<MergeReport> {
        self.history.fetch_page(room_id, cursor).await
    }

    pub async fn mark_read(&self, room_id: &RoomId, id: MessageId) -> bool {
        self.state.lock().await.store.mark_read(room_id, id)
    }

    pub async fn mark_room_read(&self, room_id: &RoomId) -> usize {
        self.state.lock().await.store.mark_room_read(room_id)
    }

    pub async fn unread_count(&self, room_id: &RoomId) -> usize {
        self.state.lock().await.store.unread_count(room_id)
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn events(&self) -> SessionEventReceiver {
        self.events.subscribe()
    }

    pub async fn statistics(&self) -> Result<SessionStatistics> {
        let connection = self.connection.statistics().await?;
        let state = self.state.lock().await;
        Ok(SessionStatistics {
            connection,
            registry: state.registry.stats().clone(),
            store: state.store.stats().clone(),
            outbound: state.tracker.statistics().clone(),
        })
    }

    /// Disconnect and stop the connection driver
    pub async fn shutdown(self) {
        self.connection.shutdown().await;
        if let Err(error) = self.driver.await {
            error!(%error, "connection driver ended abnormally");
        }
        info!("chat session shut down");
    }
}
