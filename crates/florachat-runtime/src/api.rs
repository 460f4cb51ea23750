//! REST collaborators
//!
//! History pages and room provisioning come from the platform's REST API. The
//! session consumes them through these traits so tests can swap in in-memory
//! doubles.

use async_trait::async_trait;
use florachat_core::{HistoryFetchError, HistoryPage, Result, RoomId, UserId};

/// Paged access to a room's past messages
#[async_trait]
pub trait HistoryApi: Send + Sync + 'static {
    /// Fetch one page, oldest first; `cursor` is `None` for the newest page
    async fn fetch_page(
        &self,
        room_id: &RoomId,
        cursor: Option<&str>,
    ) -> core::result::Result<HistoryPage, HistoryFetchError>;
}

/// Creates (or looks up) the conversation room with a participant
#[async_trait]
pub trait RoomProvisioner: Send + Sync + 'static {
    async fn open_room(&self, participant_id: &UserId) -> Result<RoomId>;
}
