//! Shared session state
//!
//! Registry, store and send tracker live behind one async mutex. The lock is
//! only held for synchronous critical sections, never across I/O.

use florachat_core::{
    MessageStore, MessageStoreConfig, OutboundConfig, OutboundTracker, RoomRegistry, TimeSource,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Domain state touched by the driver, the outbound queue and the history loader
#[derive(Debug)]
pub struct SessionState {
    pub registry: RoomRegistry,
    pub store: MessageStore,
    pub tracker: OutboundTracker,
}

impl SessionState {
    pub fn new(
        store_config: MessageStoreConfig,
        outbound_config: OutboundConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            registry: RoomRegistry::new(),
            store: MessageStore::with_time_source(store_config, time_source),
            tracker: OutboundTracker::new(outbound_config),
        }
    }
}

pub type SharedState = Arc<Mutex<SessionState>>;

pub fn shared(state: SessionState) -> SharedState {
    Arc::new(Mutex::new(state))
}
