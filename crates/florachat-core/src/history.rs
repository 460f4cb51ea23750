//! Room history pages
//!
//! Shape of one page returned by the history API and the report produced when
//! a page is merged into a room's message log.

use crate::message::ConfirmedMessage;
use serde::{Deserialize, Serialize};

/// One ordered page of past messages, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<ConfirmedMessage>,
    /// Cursor for the next (older) page, `None` at the beginning of the room
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl HistoryPage {
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Outcome of merging a history page into a room
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Messages that were not present before
    pub inserted: usize,
    /// Messages already present (arrived live or in an earlier page)
    pub duplicates: usize,
    /// Local pending entries resolved by a history copy
    pub reconciled: usize,
    /// Cursor to request the next page with
    pub next_cursor: Option<String>,
}
