//! Session Builder API
//!
//! Wires a transport, the REST collaborators, the local identity and a
//! [`SessionConfig`] into a running [`ChatSession`].

use crate::api::{HistoryApi, RoomProvisioner};
use crate::connection::ConnectionManager;
use crate::events::create_event_channel;
use crate::history::HistoryLoader;
use crate::outbound::{Identity, OutboundQueue};
use crate::session::ChatSession;
use crate::state::{shared, SessionState};
use crate::transport::Transport;
use florachat_core::{
    FlorachatError, Result, SenderRole, SessionConfig, SystemTimeSource, TimeSource, UserId,
};
use std::sync::Arc;
use tracing::info;

// ----------------------------------------------------------------------------
// Session Builder
// ----------------------------------------------------------------------------

/// Builder for a [`ChatSession`]
pub struct SessionBuilder {
    identity: Identity,
    config: SessionConfig,
    transport: Option<Box<dyn Transport>>,
    history_api: Option<Arc<dyn HistoryApi>>,
    provisioner: Option<Arc<dyn RoomProvisioner>>,
    time_source: Arc<dyn TimeSource>,
}

impl SessionBuilder {
    /// Create a builder for the given local account
    pub fn new(user_id: UserId, role: SenderRole) -> Self {
        Self {
            identity: Identity::new(user_id, role),
            config: SessionConfig::default(),
            transport: None,
            history_api: None,
            provisioner: None,
            time_source: Arc::new(SystemTimeSource),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn with_history_api<H: HistoryApi>(mut self, api: H) -> Self {
        self.history_api = Some(Arc::new(api));
        self
    }

    pub fn with_provisioner<P: RoomProvisioner>(mut self, provisioner: P) -> Self {
        self.provisioner = Some(Arc::new(provisioner));
        self
    }

    /// Clock used to stamp local messages and send deadlines
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Validate the configuration and start the connection driver
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<ChatSession> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| FlorachatError::config_error("a transport is required"))?;
        let history_api = self
            .history_api
            .ok_or_else(|| FlorachatError::config_error("a history API is required"))?;

        info!(
            user_id = %self.identity.user_id,
            endpoint = %transport.endpoint(),
            "building chat session"
        );

        let state = shared(SessionState::new(
            self.config.store.clone(),
            self.config.outbound.clone(),
            self.time_source.clone(),
        ));
        let events = create_event_channel(self.config.channels.session_event_buffer_size);

        let (connection, driver) = ConnectionManager::spawn(
            transport,
            &self.config,
            state.clone(),
            events.clone(),
            self.time_source.clone(),
        );
        let outbound = OutboundQueue::new(
            connection.clone(),
            state.clone(),
            events.clone(),
            self.identity,
            self.time_source,
            self.config.outbound.send_timeout(),
        );
        let history = HistoryLoader::new(
            history_api,
            state.clone(),
            events.clone(),
            self.config.history.clone(),
        );

        Ok(ChatSession::new(
            connection,
            state,
            outbound,
            history,
            self.provisioner,
            events,
            driver,
        ))
    }
}
