//! Outbound queue
//!
//! Accepts user sends, renders them optimistically and emits them through the
//! connection driver. Every accepted send is armed with a timer; if no echo
//! settles it before the deadline the entry turns `Failed` and a `SendFailed`
//! event is published. Sends are refused outright while not connected.

use crate::connection::ConnectionHandle;
use crate::events::{publish, SessionEvent, SessionEventSender};
use crate::state::SharedState;
use florachat_core::{
    ClientFrame, CorrelationId, Draft, FlorachatError, MessageStatus, Result, RoomId, SendOutcome,
    SenderRole, TimeSource, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Local author of outbound messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: SenderRole,
}

impl Identity {
    pub fn new(user_id: UserId, role: SenderRole) -> Self {
        Self { user_id, role }
    }
}

/// Optimistic send path
#[derive(Clone)]
pub struct OutboundQueue {
    connection: ConnectionHandle,
    state: SharedState,
    events: SessionEventSender,
    identity: Identity,
    time_source: Arc<dyn TimeSource>,
    send_timeout: Duration,
}

impl OutboundQueue {
    pub fn new(
        connection: ConnectionHandle,
        state: SharedState,
        events: SessionEventSender,
        identity: Identity,
        time_source: Arc<dyn TimeSource>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            state,
            events,
            identity,
            time_source,
            send_timeout,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn ensure_connected(&self) -> Result<()> {
        let status = self.connection.status();
        if status.can_send() {
            Ok(())
        } else {
            Err(FlorachatError::not_connected(status))
        }
    }

    /// Submit a message to a joined room and return its correlation id
    pub async fn send(&self, room_id: &RoomId, content: &str) -> Result<CorrelationId> {
        self.ensure_connected()?;

        let correlation_id = {
            let mut state = self.state.lock().await;
            if !state.registry.is_joined(room_id) {
                return Err(FlorachatError::RoomNotJoined {
                    room_id: room_id.clone(),
                });
            }
            state.tracker.validate_content(content)?;
            let draft = Draft::new(
                room_id.clone(),
                self.identity.user_id.clone(),
                self.identity.role,
                content,
            );
            let correlation_id = state.store.insert_pending(draft);
            state
                .tracker
                .track(correlation_id, room_id.clone(), self.time_source.now(), None);
            correlation_id
        };

        debug!(room_id = %room_id, correlation_id = %correlation_id, "send accepted");
        self.dispatch(room_id, content.to_string(), correlation_id)
            .await?;
        Ok(correlation_id)
    }

    /// Retry a failed send in place; returns the new correlation id
    pub async fn resend(
        &self,
        room_id: &RoomId,
        correlation_id: &CorrelationId,
    ) -> Result<CorrelationId> {
        self.ensure_connected()?;

        let (resent, content) = {
            let mut state = self.state.lock().await;
            if !state.registry.is_joined(room_id) {
                return Err(FlorachatError::RoomNotJoined {
                    room_id: room_id.clone(),
                });
            }
            let resent = state.store.replace_failed(room_id, correlation_id)?;
            let content = state
                .store
                .get_snapshot(room_id)
                .find_by_correlation(&resent)
                .map(|m| m.content.clone())
                .ok_or_else(|| FlorachatError::UnknownMessage {
                    room_id: room_id.clone(),
                    correlation_id: resent,
                })?;
            state.tracker.track(
                resent,
                room_id.clone(),
                self.time_source.now(),
                Some(*correlation_id),
            );
            (resent, content)
        };

        debug!(
            room_id = %room_id,
            correlation_id = %resent,
            supersedes = %correlation_id,
            "resend accepted"
        );
        self.dispatch(room_id, content, resent).await?;
        Ok(resent)
    }

    async fn dispatch(
        &self,
        room_id: &RoomId,
        content: String,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        let frame = ClientFrame::Send {
            room_id: room_id.clone(),
            content,
            correlation_id,
        };
        if let Err(error) = self.connection.emit(frame).await {
            self.expire(room_id, correlation_id).await;
            return Err(error);
        }
        self.arm_timeout(room_id.clone(), correlation_id);
        Ok(())
    }

    fn arm_timeout(&self, room_id: RoomId, correlation_id: CorrelationId) {
        let queue = self.clone();
        let delay = self.send_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.expire(&room_id, correlation_id).await;
        });
    }

    /// Settle a send whose deadline passed
    ///
    /// A history page may have confirmed the entry without going through the
    /// tracker, so the store decides which outcome applies.
    async fn expire(&self, room_id: &RoomId, correlation_id: CorrelationId) {
        let now = self.time_source.now();
        let mut state = self.state.lock().await;
        match state.store.status_of(room_id, &correlation_id) {
            Some(MessageStatus::Pending) => {
                state.store.mark_failed(room_id, &correlation_id);
                if state
                    .tracker
                    .resolve(&correlation_id, SendOutcome::Failed, now)
                    .is_some()
                {
                    warn!(
                        room_id = %room_id,
                        correlation_id = %correlation_id,
                        error = %FlorachatError::SendTimeout { correlation_id },
                        "send failed"
                    );
                    publish(
                        &self.events,
                        SessionEvent::SendFailed {
                            room_id: room_id.clone(),
                            correlation_id,
                        },
                    );
                }
            }
            Some(MessageStatus::Confirmed) => {
                state
                    .tracker
                    .resolve(&correlation_id, SendOutcome::Confirmed, now);
            }
            Some(MessageStatus::Failed) | None => {
                state
                    .tracker
                    .resolve(&correlation_id, SendOutcome::Failed, now);
            }
        }
    }
}
