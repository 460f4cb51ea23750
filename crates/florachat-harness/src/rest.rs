//! In-memory REST collaborators

use async_trait::async_trait;
use florachat_core::{HistoryFetchError, HistoryPage, Result, RoomId, UserId};
use florachat_runtime::{HistoryApi, RoomProvisioner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// ----------------------------------------------------------------------------
// History
// ----------------------------------------------------------------------------

#[derive(Default)]
struct HistoryState {
    pages: HashMap<(RoomId, Option<String>), HistoryPage>,
    retryable_failures: u32,
    permanent_failure: Option<String>,
    latency: Option<Duration>,
    calls: Vec<(RoomId, Option<String>)>,
}

/// History API serving scripted pages
#[derive(Clone, Default)]
pub struct InMemoryHistoryApi {
    state: Arc<Mutex<HistoryState>>,
}

impl InMemoryHistoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HistoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve `page` for `(room_id, cursor)`
    pub fn insert_page(&self, room_id: &RoomId, cursor: Option<&str>, page: HistoryPage) {
        self.lock()
            .pages
            .insert((room_id.clone(), cursor.map(str::to_string)), page);
    }

    /// Answer the next `count` calls with a retryable error
    pub fn fail_next(&self, count: u32) {
        self.lock().retryable_failures = count;
    }

    /// Answer every call with a non-retryable error
    pub fn fail_permanently(&self, reason: &str) {
        self.lock().permanent_failure = Some(reason.to_string());
    }

    /// Delay every response
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls(&self) -> Vec<(RoomId, Option<String>)> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl HistoryApi for InMemoryHistoryApi {
    async fn fetch_page(
        &self,
        room_id: &RoomId,
        cursor: Option<&str>,
    ) -> core::result::Result<HistoryPage, HistoryFetchError> {
        let latency = {
            let mut state = self.lock();
            state
                .calls
                .push((room_id.clone(), cursor.map(str::to_string)));
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if let Some(reason) = &state.permanent_failure {
            return Err(HistoryFetchError::Decode {
                room_id: room_id.clone(),
                reason: reason.clone(),
            });
        }
        if state.retryable_failures > 0 {
            state.retryable_failures -= 1;
            return Err(HistoryFetchError::Retryable {
                room_id: room_id.clone(),
                reason: "HTTP 503".into(),
            });
        }
        Ok(state
            .pages
            .get(&(room_id.clone(), cursor.map(str::to_string)))
            .cloned()
            .unwrap_or_default())
    }
}

// ----------------------------------------------------------------------------
// Provisioning
// ----------------------------------------------------------------------------

/// Provisioner opening direct admin/participant rooms
#[derive(Clone)]
pub struct InMemoryProvisioner {
    admin: UserId,
    opened: Arc<Mutex<Vec<UserId>>>,
}

impl InMemoryProvisioner {
    pub fn new(admin: UserId) -> Self {
        Self {
            admin,
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Participants a room was opened for, in call order
    pub fn opened(&self) -> Vec<UserId> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RoomProvisioner for InMemoryProvisioner {
    async fn open_room(&self, participant_id: &UserId) -> Result<RoomId> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(participant_id.clone());
        Ok(RoomId::direct(&self.admin, participant_id))
    }
}
