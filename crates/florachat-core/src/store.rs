//! Optimistic Per-Room Message Store
//!
//! Single source of truth handed to the presentation layer. Each room keeps an
//! ordered log mixing confirmed server messages with local optimistic entries:
//!
//! - confirmed entries are totally ordered by `(created_at, id)` and never change
//!   except for their read flag;
//! - pending entries are appended in submission order and later replaced in
//!   place by their confirmed echo, so a send never shows up twice;
//! - confirmed messages are deduplicated by server id.
//!
//! Mutations notify the room's subscribers with a fresh immutable [`Snapshot`].

use crate::config::MessageStoreConfig;
use crate::errors::{FlorachatError, Result};
use crate::history::{HistoryPage, MergeReport};
use crate::message::{ConfirmedMessage, Draft, Message, MessageStatus};
use crate::types::{CorrelationId, MessageId, RoomId, SystemTimeSource, TimeSource};
use core::fmt;
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Immutable, ordered view of a room at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    room_id: RoomId,
    version: u64,
    messages: Arc<[Message]>,
}

impl Snapshot {
    fn empty(room_id: RoomId) -> Self {
        Self {
            room_id,
            version: 0,
            messages: Arc::from(Vec::new()),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Increases with every mutation of the room
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn find_by_correlation(&self, correlation_id: &CorrelationId) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.correlation_id.as_ref() == Some(correlation_id))
    }

    pub fn find_by_id(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == Some(id))
    }
}

// ----------------------------------------------------------------------------
// Reconciliation Outcome
// ----------------------------------------------------------------------------

/// How a pending entry was matched to its confirmed echo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// The server echoed our correlation id
    CorrelationId,
    /// Fallback on sender, content and a short time window
    SenderContent,
}

/// Result of applying one confirmed message to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A pending entry was replaced by its confirmed copy
    Replaced {
        index: usize,
        matched_by: MatchKind,
        correlation_id: CorrelationId,
    },
    /// No local counterpart; appended as a new message
    Appended,
    /// Already present by server id
    Duplicate,
    /// Echo for a send that had already failed; kept as a best-effort duplicate
    Mismatch { correlation_id: CorrelationId },
}

// ----------------------------------------------------------------------------
// Subscriptions
// ----------------------------------------------------------------------------

/// Handle returned by [`MessageStore::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback receiving a room's snapshot after every change
pub type SnapshotCallback = Box<dyn Fn(&Snapshot) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    callback: SnapshotCallback,
}

// ----------------------------------------------------------------------------
// Room Log
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RoomLog {
    entries: Vec<Message>,
    ids: HashSet<MessageId>,
    /// Failed sends whose late echo has not been seen yet
    failed: HashSet<CorrelationId>,
    version: u64,
    cached: Option<Snapshot>,
    active: bool,
    last_access: u64,
}

impl RoomLog {
    fn changed(&mut self) {
        self.version += 1;
        self.cached = None;
    }

    fn snapshot(&mut self, room_id: &RoomId) -> Snapshot {
        if let Some(cached) = &self.cached {
            return cached.clone();
        }
        let snapshot = Snapshot {
            room_id: room_id.clone(),
            version: self.version,
            messages: Arc::from(self.entries.clone()),
        };
        self.cached = Some(snapshot.clone());
        snapshot
    }

    fn pending_index_by_correlation(&self, correlation_id: &CorrelationId) -> Option<usize> {
        self.entries.iter().position(|m| {
            m.status == MessageStatus::Pending && m.correlation_id.as_ref() == Some(correlation_id)
        })
    }

    fn index_by_correlation(&self, correlation_id: &CorrelationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|m| m.correlation_id.as_ref() == Some(correlation_id))
    }

    /// Oldest pending entry from the same sender with the same content near `created_at`
    fn pending_index_by_content(
        &self,
        confirmed: &ConfirmedMessage,
        window: core::time::Duration,
    ) -> Option<usize> {
        self.entries.iter().position(|m| {
            m.status == MessageStatus::Pending
                && m.sender_id == confirmed.sender_id
                && m.content == confirmed.content
                && m.created_at.abs_diff(confirmed.created_at) <= window
        })
    }

    /// Oldest failed entry still awaiting a late echo from the same sender
    /// with the same content near `created_at`
    fn failed_index_by_content(
        &self,
        confirmed: &ConfirmedMessage,
        window: core::time::Duration,
    ) -> Option<usize> {
        self.entries.iter().position(|m| {
            m.status == MessageStatus::Failed
                && m.correlation_id.is_some_and(|c| self.failed.contains(&c))
                && m.sender_id == confirmed.sender_id
                && m.content == confirmed.content
                && m.created_at.abs_diff(confirmed.created_at) <= window
        })
    }

    /// Forget failed correlation ids no longer referenced by any entry
    fn prune_failed(&mut self) {
        let entries = &self.entries;
        self.failed.retain(|c| {
            entries
                .iter()
                .any(|m| m.correlation_id.as_ref() == Some(c) || m.supersedes.as_ref() == Some(c))
        });
    }

    /// Insert a confirmed message at its ordered position
    ///
    /// Goes before the first confirmed entry with a greater key, otherwise at the
    /// tail (after any pending entries).
    fn insert_ordered(&mut self, message: Message) -> usize {
        let key = message.order_key();
        if let Some(id) = message.id {
            self.ids.insert(id);
        }
        let position = key.and_then(|key| {
            self.entries
                .iter()
                .position(|m| m.order_key().map(|k| k > key).unwrap_or(false))
        });
        match position {
            Some(index) => {
                self.entries.insert(index, message);
                index
            }
            None => {
                self.entries.push(message);
                self.entries.len() - 1
            }
        }
    }

    /// Whether the confirmed entry at `index` respects `(created_at, id)` order
    fn is_ordered_at(&self, index: usize) -> bool {
        let Some(key) = self.entries[index].order_key() else {
            return true;
        };
        let before_ok = self.entries[..index]
            .iter()
            .filter_map(Message::order_key)
            .all(|k| k <= key);
        let after_ok = self.entries[index + 1..]
            .iter()
            .filter_map(Message::order_key)
            .all(|k| k >= key);
        before_ok && after_ok
    }

    /// Replace the entry at `index` with its confirmed copy
    fn replace_with_confirmed(&mut self, index: usize, confirmed: ConfirmedMessage) -> usize {
        let previous = &self.entries[index];
        let correlation_id = confirmed.correlation_id.or(previous.correlation_id);
        let supersedes = previous.supersedes;

        let mut message = Message::confirmed(confirmed);
        message.correlation_id = correlation_id;
        message.supersedes = supersedes;
        // Our own message, already seen by the sender
        message.read = true;

        if let Some(id) = message.id {
            self.ids.insert(id);
        }
        self.entries[index] = message;

        if self.is_ordered_at(index) {
            index
        } else {
            let message = self.entries.remove(index);
            self.insert_ordered(message)
        }
    }

    /// Drop the oldest confirmed entries beyond `max` messages
    fn enforce_capacity(&mut self, max: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max {
            let Some(index) = self.entries.iter().position(Message::is_confirmed) else {
                break;
            };
            let removed = self.entries.remove(index);
            if let Some(id) = removed.id {
                self.ids.remove(&id);
            }
            evicted += 1;
        }
        if evicted > 0 {
            self.prune_failed();
        }
        evicted
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStoreStats {
    pub pending_inserted: u64,
    pub reconciled_by_correlation: u64,
    pub reconciled_by_content: u64,
    pub history_reconciled_by_correlation: u64,
    pub history_reconciled_by_content: u64,
    pub appended: u64,
    pub duplicates: u64,
    pub mismatches: u64,
    pub failed: u64,
    pub resent: u64,
    pub evicted_messages: u64,
    pub evicted_rooms: u64,
}

// ----------------------------------------------------------------------------
// Message Store
// ----------------------------------------------------------------------------

/// Per-room ordered message logs with optimistic insertion and reconciliation
pub struct MessageStore {
    rooms: HashMap<RoomId, RoomLog>,
    subscribers: HashMap<RoomId, Vec<Subscriber>>,
    config: MessageStoreConfig,
    time_source: Arc<dyn TimeSource>,
    next_subscription: u64,
    access_clock: u64,
    stats: MessageStoreStats,
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStore")
            .field("rooms", &self.rooms.len())
            .field(
                "subscribers",
                &self.subscribers.values().map(Vec::len).sum::<usize>(),
            )
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl MessageStore {
    /// Create new empty message store with default configuration
    pub fn new() -> Self {
        Self::with_config(MessageStoreConfig::default())
    }

    /// Create new empty message store with specified configuration
    pub fn with_config(config: MessageStoreConfig) -> Self {
        Self::with_time_source(config, Arc::new(SystemTimeSource))
    }

    /// Create a store stamping local messages with the given clock
    pub fn with_time_source(config: MessageStoreConfig, time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            rooms: HashMap::default(),
            subscribers: HashMap::default(),
            config,
            time_source,
            next_subscription: 0,
            access_clock: 0,
            stats: MessageStoreStats::default(),
        }
    }

    /// Fetch or create a room log, bumping its access time
    fn room_log<'a>(
        rooms: &'a mut HashMap<RoomId, RoomLog>,
        access_clock: &mut u64,
        room_id: &RoomId,
    ) -> &'a mut RoomLog {
        *access_clock += 1;
        let log = rooms.entry(room_id.clone()).or_insert_with(|| RoomLog {
            active: true,
            ..RoomLog::default()
        });
        log.last_access = *access_clock;
        log
    }

    fn notify(&mut self, room_id: &RoomId) {
        let snapshot = match self.rooms.get_mut(room_id) {
            Some(log) => log.snapshot(room_id),
            None => Snapshot::empty(room_id.clone()),
        };
        if let Some(subscribers) = self.subscribers.get(room_id) {
            for subscriber in subscribers {
                (subscriber.callback)(&snapshot);
            }
        }
    }

    fn enforce_capacity(&mut self, room_id: &RoomId) {
        let max = self.config.max_messages_per_room;
        if let Some(log) = self.rooms.get_mut(room_id) {
            let evicted = log.enforce_capacity(max);
            self.stats.evicted_messages += evicted as u64;
        }
    }

    // ------------------------------------------------------------------------
    // Local sends
    // ------------------------------------------------------------------------

    /// Append a pending message for a draft and return its correlation id
    pub fn insert_pending(&mut self, draft: Draft) -> CorrelationId {
        let correlation_id = CorrelationId::generate();
        let room_id = draft.room_id.clone();
        let now = self.time_source.now();
        let log = Self::room_log(&mut self.rooms, &mut self.access_clock, &room_id);
        log.entries
            .push(Message::pending(draft, correlation_id, now));
        log.changed();
        self.stats.pending_inserted += 1;
        self.enforce_capacity(&room_id);
        self.notify(&room_id);
        correlation_id
    }

    /// Move a pending send to `Failed`; no-op unless it is still pending
    pub fn mark_failed(&mut self, room_id: &RoomId, correlation_id: &CorrelationId) -> bool {
        let Some(log) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(index) = log.pending_index_by_correlation(correlation_id) else {
            return false;
        };
        log.entries[index].status = MessageStatus::Failed;
        log.failed.insert(*correlation_id);
        log.changed();
        self.stats.failed += 1;
        self.notify(room_id);
        true
    }

    /// Replace a failed entry in place with a fresh pending attempt
    ///
    /// The new entry gets a new correlation id and records the failed one in
    /// `supersedes`, so the failed send keeps its single terminal outcome.
    pub fn replace_failed(
        &mut self,
        room_id: &RoomId,
        correlation_id: &CorrelationId,
    ) -> Result<CorrelationId> {
        let now = self.time_source.now();
        let unknown = || FlorachatError::UnknownMessage {
            room_id: room_id.clone(),
            correlation_id: *correlation_id,
        };
        let log = self.rooms.get_mut(room_id).ok_or_else(unknown)?;
        let index = log
            .index_by_correlation(correlation_id)
            .filter(|&i| log.entries[i].is_failed())
            .ok_or_else(unknown)?;

        let new_id = CorrelationId::generate();
        let entry = &mut log.entries[index];
        entry.correlation_id = Some(new_id);
        entry.supersedes = Some(*correlation_id);
        entry.status = MessageStatus::Pending;
        entry.created_at = now;
        log.changed();
        self.stats.resent += 1;
        self.notify(room_id);
        Ok(new_id)
    }

    // ------------------------------------------------------------------------
    // Confirmed messages
    // ------------------------------------------------------------------------

    /// Apply a confirmed message, replacing its pending counterpart if one exists
    pub fn reconcile(&mut self, confirmed: ConfirmedMessage) -> ReconcileOutcome {
        let room_id = confirmed.room_id.clone();
        let window = self.config.fuzzy_match_window();
        let log = Self::room_log(&mut self.rooms, &mut self.access_clock, &room_id);

        if log.ids.contains(&confirmed.id) {
            // A history page may have delivered the copy before the echo did
            let superseded = confirmed
                .correlation_id
                .and_then(|c| log.pending_index_by_correlation(&c));
            self.stats.duplicates += 1;
            if let Some(index) = superseded {
                log.entries.remove(index);
                log.changed();
                self.notify(&room_id);
            }
            return ReconcileOutcome::Duplicate;
        }

        let (matched, late_for) = match confirmed.correlation_id {
            Some(correlation_id) => match log.pending_index_by_correlation(&correlation_id) {
                Some(index) => (Some((index, MatchKind::CorrelationId)), None),
                None => (None, log.failed.contains(&correlation_id).then_some(correlation_id)),
            },
            None => match log.pending_index_by_content(&confirmed, window) {
                Some(index) => (Some((index, MatchKind::SenderContent)), None),
                None => (
                    None,
                    log.failed_index_by_content(&confirmed, window)
                        .and_then(|index| log.entries[index].correlation_id),
                ),
            },
        };

        if let Some(correlation_id) = late_for {
            warn!(
                room_id = %room_id,
                correlation_id = %correlation_id,
                message_id = %confirmed.id,
                "reconciliation mismatch: echo arrived for a failed send, keeping duplicate"
            );
            log.failed.remove(&correlation_id);
            log.insert_ordered(Message::confirmed(confirmed));
            log.changed();
            self.stats.mismatches += 1;
            self.enforce_capacity(&room_id);
            self.notify(&room_id);
            return ReconcileOutcome::Mismatch { correlation_id };
        }

        let outcome = match matched {
            Some((index, matched_by)) => {
                if matched_by == MatchKind::SenderContent {
                    debug!(
                        room_id = %room_id,
                        message_id = %confirmed.id,
                        "reconciled pending message by sender and content"
                    );
                    self.stats.reconciled_by_content += 1;
                } else {
                    self.stats.reconciled_by_correlation += 1;
                }
                let correlation_id = log.entries[index].correlation_id;
                let index = log.replace_with_confirmed(index, confirmed);
                match correlation_id {
                    Some(correlation_id) => ReconcileOutcome::Replaced {
                        index,
                        matched_by,
                        correlation_id,
                    },
                    None => ReconcileOutcome::Appended,
                }
            }
            None => {
                log.insert_ordered(Message::confirmed(confirmed));
                self.stats.appended += 1;
                ReconcileOutcome::Appended
            }
        };
        log.changed();
        self.enforce_capacity(&room_id);
        self.notify(&room_id);
        outcome
    }

    /// Append a message with no local counterpart; deduplicates by id
    pub fn append(&mut self, confirmed: ConfirmedMessage) -> bool {
        let room_id = confirmed.room_id.clone();
        let log = Self::room_log(&mut self.rooms, &mut self.access_clock, &room_id);
        if log.ids.contains(&confirmed.id) {
            self.stats.duplicates += 1;
            return false;
        }
        log.insert_ordered(Message::confirmed(confirmed));
        log.changed();
        self.stats.appended += 1;
        self.enforce_capacity(&room_id);
        self.notify(&room_id);
        true
    }

    /// Merge a page of history into a room without duplicating live messages
    ///
    /// Matches by server id first. Local entries that have no id yet are matched
    /// on sender and content with `created_at` inside the fuzzy window; a hit
    /// resolves the pending entry instead of adding a second copy.
    pub fn merge_history(&mut self, room_id: &RoomId, page: HistoryPage) -> MergeReport {
        let window = self.config.fuzzy_match_window();
        let mut report = MergeReport {
            next_cursor: page.next_cursor,
            ..MergeReport::default()
        };
        let log = Self::room_log(&mut self.rooms, &mut self.access_clock, room_id);

        let mut by_correlation = 0u64;
        for mut confirmed in page.messages {
            if confirmed.room_id != *room_id {
                warn!(
                    room_id = %room_id,
                    message_room = %confirmed.room_id,
                    "history page contained a message for another room, skipping"
                );
                continue;
            }
            if log.ids.contains(&confirmed.id) {
                report.duplicates += 1;
                continue;
            }
            let local = confirmed
                .correlation_id
                .and_then(|c| log.pending_index_by_correlation(&c))
                .map(|index| (index, MatchKind::CorrelationId))
                .or_else(|| {
                    log.pending_index_by_content(&confirmed, window)
                        .map(|index| (index, MatchKind::SenderContent))
                });
            match local {
                Some((index, matched_by)) => {
                    // History copies of our own messages are already read
                    confirmed.read = true;
                    log.replace_with_confirmed(index, confirmed);
                    report.reconciled += 1;
                    if matched_by == MatchKind::CorrelationId {
                        by_correlation += 1;
                    }
                }
                None => {
                    log.insert_ordered(Message::confirmed(confirmed));
                    report.inserted += 1;
                }
            }
        }

        self.stats.duplicates += report.duplicates as u64;
        self.stats.appended += report.inserted as u64;
        self.stats.history_reconciled_by_correlation += by_correlation;
        self.stats.history_reconciled_by_content += report.reconciled as u64 - by_correlation;
        if report.inserted > 0 || report.reconciled > 0 {
            if let Some(log) = self.rooms.get_mut(room_id) {
                log.changed();
            }
            self.enforce_capacity(room_id);
            self.notify(room_id);
        }
        report
    }

    // ------------------------------------------------------------------------
    // Read flags
    // ------------------------------------------------------------------------

    /// Set the read flag of a confirmed message
    pub fn mark_read(&mut self, room_id: &RoomId, id: MessageId) -> bool {
        let Some(log) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(entry) = log.entries.iter_mut().find(|m| m.id == Some(id)) else {
            return false;
        };
        if entry.read {
            return false;
        }
        entry.read = true;
        log.changed();
        self.notify(room_id);
        true
    }

    /// Mark every message of a room as read, returning how many changed
    pub fn mark_room_read(&mut self, room_id: &RoomId) -> usize {
        let Some(log) = self.rooms.get_mut(room_id) else {
            return 0;
        };
        let mut changed = 0;
        for entry in log.entries.iter_mut().filter(|m| !m.read) {
            entry.read = true;
            changed += 1;
        }
        if changed > 0 {
            log.changed();
            self.notify(room_id);
        }
        changed
    }

    pub fn unread_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map(|log| log.entries.iter().filter(|m| !m.read).count())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Immutable ordered view of a room
    ///
    /// Reading counts as use, so a viewed room stays in the retained cache.
    pub fn get_snapshot(&mut self, room_id: &RoomId) -> Snapshot {
        match self.rooms.get_mut(room_id) {
            Some(log) => {
                self.access_clock += 1;
                log.last_access = self.access_clock;
                log.snapshot(room_id)
            }
            None => Snapshot::empty(room_id.clone()),
        }
    }

    /// Current status of a send
    pub fn status_of(
        &self,
        room_id: &RoomId,
        correlation_id: &CorrelationId,
    ) -> Option<MessageStatus> {
        let log = self.rooms.get(room_id)?;
        log.index_by_correlation(correlation_id)
            .map(|i| log.entries[i].status)
    }

    pub fn pending_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map(|log| log.entries.iter().filter(|m| m.is_pending()).count())
            .unwrap_or(0)
    }

    pub fn message_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map(|log| log.entries.len()).unwrap_or(0)
    }

    pub fn contains_room(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn stats(&self) -> &MessageStoreStats {
        &self.stats
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Register a callback invoked with the room's snapshot after every change
    pub fn subscribe(&mut self, room_id: &RoomId, callback: SnapshotCallback) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscribers
            .entry(room_id.clone())
            .or_default()
            .push(Subscriber { id, callback });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for subscribers in self.subscribers.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != id);
            removed |= subscribers.len() != before;
        }
        self.subscribers.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.subscribers.get(room_id).map(Vec::len).unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Room lifecycle
    // ------------------------------------------------------------------------

    /// Mark a room as in use (joined)
    pub fn activate_room(&mut self, room_id: &RoomId) {
        Self::room_log(&mut self.rooms, &mut self.access_clock, room_id).active = true;
    }

    /// Keep a left room's cache for fast re-entry, evicting the least recently
    /// used retained rooms beyond the configured capacity
    pub fn retire_room(&mut self, room_id: &RoomId) {
        if let Some(log) = self.rooms.get_mut(room_id) {
            log.active = false;
        }
        loop {
            let retired: Vec<(&RoomId, u64)> = self
                .rooms
                .iter()
                .filter(|(_, log)| !log.active)
                .map(|(id, log)| (id, log.last_access))
                .collect();
            if retired.len() <= self.config.retained_rooms {
                break;
            }
            let Some(oldest) = retired
                .into_iter()
                .min_by_key(|(_, access)| *access)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            self.evict_room(&oldest);
        }
    }

    /// Drop a room's log entirely
    pub fn evict_room(&mut self, room_id: &RoomId) -> bool {
        if self.rooms.remove(room_id).is_some() {
            debug!(room_id = %room_id, "evicted room cache");
            self.stats.evicted_rooms += 1;
            true
        } else {
            false
        }
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SenderRole;
    use crate::types::{Timestamp, UserId};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FixedClock(AtomicU64);

    impl TimeSource for FixedClock {
        fn now(&self) -> Timestamp {
            Timestamp::new(self.0.load(Ordering::SeqCst))
        }
    }

    fn store_at(millis: u64) -> (MessageStore, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock(AtomicU64::new(millis)));
        let store = MessageStore::with_time_source(MessageStoreConfig::default(), clock.clone());
        (store, clock)
    }

    fn room() -> RoomId {
        RoomId::new("admin:1:user:2")
    }

    fn draft(content: &str) -> Draft {
        Draft::new(room(), UserId::new("admin-1"), SenderRole::Admin, content)
    }

    fn confirmed(id: u64, sender: &str, content: &str, at: u64) -> ConfirmedMessage {
        ConfirmedMessage {
            id: MessageId::new(id),
            correlation_id: None,
            room_id: room(),
            sender_id: UserId::new(sender),
            sender_role: SenderRole::User,
            content: content.into(),
            created_at: Timestamp::new(at),
            read: false,
        }
    }

    #[test]
    fn test_pending_then_echo_replaces_in_place() {
        let (mut store, _) = store_at(1_000);
        store.append(confirmed(1, "user-2", "hi admin", 500));
        let correlation_id = store.insert_pending(draft("hello"));
        assert_eq!(store.pending_count(&room()), 1);

        let mut echo = confirmed(42, "admin-1", "hello", 1_010);
        echo.correlation_id = Some(correlation_id);
        let outcome = store.reconcile(echo);
        assert_eq!(
            outcome,
            ReconcileOutcome::Replaced {
                index: 1,
                matched_by: MatchKind::CorrelationId,
                correlation_id,
            }
        );

        let snapshot = store.get_snapshot(&room());
        assert_eq!(snapshot.len(), 2);
        let message = snapshot.find_by_correlation(&correlation_id).unwrap();
        assert_eq!(message.id, Some(MessageId::new(42)));
        assert_eq!(message.status, MessageStatus::Confirmed);
    }

    #[test]
    fn test_fuzzy_fallback_matches_oldest_pending() {
        let (mut store, clock) = store_at(1_000);
        let first = store.insert_pending(draft("same"));
        clock.0.store(1_100, Ordering::SeqCst);
        let second = store.insert_pending(draft("same"));

        let outcome = store.reconcile(confirmed(7, "admin-1", "same", 1_050));
        assert!(matches!(
            outcome,
            ReconcileOutcome::Replaced {
                index: 0,
                matched_by: MatchKind::SenderContent,
                ..
            }
        ));
        assert_eq!(
            store.status_of(&room(), &first),
            Some(MessageStatus::Confirmed)
        );
        assert_eq!(store.status_of(&room(), &second), Some(MessageStatus::Pending));
    }

    #[test]
    fn test_fuzzy_fallback_respects_window() {
        let (mut store, _) = store_at(1_000);
        store.insert_pending(draft("late"));
        let outcome = store.reconcile(confirmed(7, "admin-1", "late", 60_000));
        assert_eq!(outcome, ReconcileOutcome::Appended);
        assert_eq!(store.message_count(&room()), 2);
    }

    #[test]
    fn test_append_deduplicates_by_id() {
        let mut store = MessageStore::new();
        assert!(store.append(confirmed(5, "u", "a", 10)));
        assert!(!store.append(confirmed(5, "u", "a", 10)));
        assert_eq!(store.reconcile(confirmed(5, "u", "a", 10)), ReconcileOutcome::Duplicate);
        assert_eq!(store.message_count(&room()), 1);
        assert_eq!(store.stats().duplicates, 2);
    }

    #[test]
    fn test_confirmed_messages_stay_ordered() {
        let mut store = MessageStore::new();
        store.append(confirmed(3, "u", "c", 300));
        store.append(confirmed(1, "u", "a", 100));
        store.append(confirmed(2, "u", "b", 300));
        let ids: Vec<u64> = store
            .get_snapshot(&room())
            .iter()
            .filter_map(|m| m.id.map(|id| id.value()))
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_replacement_moves_when_order_would_break() {
        let (mut store, _) = store_at(1_000);
        let correlation_id = store.insert_pending(draft("mine"));
        store.append(confirmed(2, "user-2", "theirs", 2_000));

        // Server stamped our message after theirs
        let mut echo = confirmed(3, "admin-1", "mine", 3_000);
        echo.correlation_id = Some(correlation_id);
        let outcome = store.reconcile(echo);
        assert!(matches!(outcome, ReconcileOutcome::Replaced { index: 1, .. }));
        let snapshot = store.get_snapshot(&room());
        let contents: Vec<&str> = snapshot.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["theirs", "mine"]);
    }

    #[test]
    fn test_failed_then_late_echo_is_mismatch() {
        let (mut store, _) = store_at(1_000);
        let correlation_id = store.insert_pending(draft("slow"));
        assert!(store.mark_failed(&room(), &correlation_id));
        assert!(!store.mark_failed(&room(), &correlation_id));

        let mut echo = confirmed(9, "admin-1", "slow", 1_000);
        echo.correlation_id = Some(correlation_id);
        assert_eq!(
            store.reconcile(echo),
            ReconcileOutcome::Mismatch { correlation_id }
        );
        assert_eq!(store.status_of(&room(), &correlation_id), Some(MessageStatus::Failed));
        assert_eq!(store.message_count(&room()), 2);
        assert_eq!(store.stats().mismatches, 1);
    }

    #[test]
    fn test_failed_then_uncorrelated_late_echo_is_mismatch() {
        let (mut store, _) = store_at(1_000);
        let correlation_id = store.insert_pending(draft("hello"));
        store.mark_failed(&room(), &correlation_id);

        let echo = confirmed(42, "admin-1", "hello", 1_000);
        assert_eq!(
            store.reconcile(echo),
            ReconcileOutcome::Mismatch { correlation_id }
        );
        assert_eq!(store.stats().mismatches, 1);
        assert_eq!(store.stats().appended, 0);
        let statuses: Vec<MessageStatus> =
            store.get_snapshot(&room()).iter().map(|m| m.status).collect();
        assert_eq!(statuses, vec![MessageStatus::Failed, MessageStatus::Confirmed]);

        // The failed send is settled; an identical later message is just new
        let again = confirmed(43, "admin-1", "hello", 1_500);
        assert_eq!(store.reconcile(again), ReconcileOutcome::Appended);
        assert_eq!(store.stats().mismatches, 1);
    }

    #[test]
    fn test_failed_ids_forgotten_after_late_echo() {
        let (mut store, _) = store_at(1_000);
        let correlation_id = store.insert_pending(draft("once"));
        store.mark_failed(&room(), &correlation_id);

        let mut echo = confirmed(9, "admin-1", "once", 1_000);
        echo.correlation_id = Some(correlation_id);
        assert!(matches!(store.reconcile(echo), ReconcileOutcome::Mismatch { .. }));
        assert!(store.rooms[&room()].failed.is_empty());
    }

    #[test]
    fn test_failed_ids_pruned_with_evicted_entries() {
        let config = MessageStoreConfig {
            max_messages_per_room: 2,
            ..MessageStoreConfig::default()
        };
        let mut store = MessageStore::with_config(config);
        let correlation_id = store.insert_pending(draft("lost"));
        store.mark_failed(&room(), &correlation_id);
        let resent = store.replace_failed(&room(), &correlation_id).unwrap();
        let mut echo = confirmed(1, "admin-1", "lost", 0);
        echo.correlation_id = Some(resent);
        store.reconcile(echo);
        assert_eq!(store.rooms[&room()].failed.len(), 1);

        // The confirmed resend ages out of the room, taking its lineage along
        store.append(confirmed(2, "u", "a", 10));
        store.append(confirmed(3, "u", "b", 20));
        assert!(store.rooms[&room()].failed.is_empty());
    }

    #[test]
    fn test_resend_replaces_failed_entry() {
        let (mut store, _) = store_at(1_000);
        let original = store.insert_pending(draft("retry me"));
        store.mark_failed(&room(), &original);

        let resent = store.replace_failed(&room(), &original).unwrap();
        assert_ne!(resent, original);
        let snapshot = store.get_snapshot(&room());
        assert_eq!(snapshot.len(), 1);
        let entry = &snapshot.messages()[0];
        assert_eq!(entry.status, MessageStatus::Pending);
        assert_eq!(entry.supersedes, Some(original));

        // Only failed entries can be resent
        assert!(store.replace_failed(&room(), &resent).is_err());
    }

    #[test]
    fn test_merge_history_skips_live_duplicates() {
        let mut store = MessageStore::new();
        store.append(confirmed(21, "u", "live", 2_100));
        let page = HistoryPage {
            messages: (1..=21).map(|i| confirmed(i, "u", "old", i * 100)).collect(),
            next_cursor: Some("c1".into()),
        };
        let report = store.merge_history(&room(), page);
        assert_eq!(report.inserted, 20);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.next_cursor.as_deref(), Some("c1"));
        assert_eq!(store.message_count(&room()), 21);
    }

    #[test]
    fn test_merge_history_resolves_pending_without_id() {
        let (mut store, _) = store_at(5_000);
        let correlation_id = store.insert_pending(draft("from history"));
        let page = HistoryPage {
            messages: vec![confirmed(77, "admin-1", "from history", 5_000)],
            next_cursor: None,
        };
        let report = store.merge_history(&room(), page);
        assert_eq!(report.reconciled, 1);
        assert_eq!(store.message_count(&room()), 1);
        assert_eq!(
            store.status_of(&room(), &correlation_id),
            Some(MessageStatus::Confirmed)
        );
    }

    #[test]
    fn test_merge_history_counts_match_kinds_separately() {
        let (mut store, _) = store_at(5_000);
        let by_id = store.insert_pending(draft("tagged"));
        store.insert_pending(draft("untagged"));

        let mut tagged = confirmed(1, "admin-1", "tagged", 5_000);
        tagged.correlation_id = Some(by_id);
        let page = HistoryPage {
            messages: vec![tagged, confirmed(2, "admin-1", "untagged", 5_000)],
            next_cursor: None,
        };
        assert_eq!(store.merge_history(&room(), page).reconciled, 2);

        let stats = store.stats();
        assert_eq!(stats.history_reconciled_by_correlation, 1);
        assert_eq!(stats.history_reconciled_by_content, 1);
        assert_eq!(stats.reconciled_by_content, 0);
    }

    #[test]
    fn test_echo_after_history_copy_drops_pending() {
        let (mut store, _) = store_at(5_000);
        let correlation_id = store.insert_pending(draft("x"));
        // History delivered the server copy but without the correlation id and
        // outside the fuzzy window, so it could not resolve the pending entry
        store.append(confirmed(8, "admin-1", "x", 50_000));
        let mut echo = confirmed(8, "admin-1", "x", 50_000);
        echo.correlation_id = Some(correlation_id);
        assert_eq!(store.reconcile(echo), ReconcileOutcome::Duplicate);
        assert_eq!(store.message_count(&room()), 1);
        assert_eq!(store.pending_count(&room()), 0);
    }

    #[test]
    fn test_subscribers_notified_per_room() {
        let mut store = MessageStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = store.subscribe(
            &room(),
            Box::new(move |snapshot| {
                assert_eq!(snapshot.room_id(), &RoomId::new("admin:1:user:2"));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.append(confirmed(1, "u", "a", 1));
        let mut other = confirmed(2, "u", "b", 2);
        other.room_id = RoomId::new("project:9");
        store.append(other);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(store.unsubscribe(id));
        store.append(confirmed(3, "u", "c", 3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(&room()), 0);
    }

    #[test]
    fn test_snapshot_versions_increase() {
        let mut store = MessageStore::new();
        let before = store.get_snapshot(&room()).version();
        store.append(confirmed(1, "u", "a", 1));
        let after = store.get_snapshot(&room());
        assert!(after.version() > before);
        // Cached until the next change
        assert_eq!(store.get_snapshot(&room()).version(), after.version());
    }

    #[test]
    fn test_read_flags() {
        let mut store = MessageStore::new();
        store.append(confirmed(1, "u", "a", 1));
        store.append(confirmed(2, "u", "b", 2));
        assert_eq!(store.unread_count(&room()), 2);
        assert!(store.mark_read(&room(), MessageId::new(1)));
        assert!(!store.mark_read(&room(), MessageId::new(1)));
        assert_eq!(store.unread_count(&room()), 1);
        assert_eq!(store.mark_room_read(&room()), 1);
        assert_eq!(store.unread_count(&room()), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest_confirmed() {
        let config = MessageStoreConfig {
            max_messages_per_room: 3,
            ..MessageStoreConfig::default()
        };
        let mut store = MessageStore::with_config(config);
        for i in 1..=5 {
            store.append(confirmed(i, "u", "m", i * 10));
        }
        let ids: Vec<u64> = store
            .get_snapshot(&room())
            .iter()
            .filter_map(|m| m.id.map(|id| id.value()))
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(store.stats().evicted_messages, 2);
        // Evicted ids are no longer considered duplicates
        assert!(store.append(confirmed(1, "u", "m", 10)));
    }

    #[test]
    fn test_retired_rooms_are_lru_evicted() {
        let config = MessageStoreConfig {
            retained_rooms: 1,
            ..MessageStoreConfig::default()
        };
        let mut store = MessageStore::with_config(config);
        let a = RoomId::new("a");
        let b = RoomId::new("b");
        let mut message = confirmed(1, "u", "m", 1);
        message.room_id = a.clone();
        store.append(message);
        let mut message = confirmed(2, "u", "m", 2);
        message.room_id = b.clone();
        store.append(message);

        store.retire_room(&a);
        assert!(store.contains_room(&a));
        store.retire_room(&b);
        assert!(!store.contains_room(&a));
        assert!(store.contains_room(&b));

        store.activate_room(&b);
        assert_eq!(store.message_count(&b), 1);
    }

    #[test]
    fn test_viewing_a_retired_room_keeps_it_cached() {
        let config = MessageStoreConfig {
            retained_rooms: 2,
            ..MessageStoreConfig::default()
        };
        let mut store = MessageStore::with_config(config);
        let rooms: Vec<RoomId> = ["a", "b", "c"].into_iter().map(RoomId::new).collect();
        for (i, room_id) in rooms.iter().enumerate() {
            let mut message = confirmed(i as u64 + 1, "u", "m", 1);
            message.room_id = room_id.clone();
            store.append(message);
        }
        store.retire_room(&rooms[0]);
        store.retire_room(&rooms[1]);

        // Room "a" is older by mutation but was just looked at
        store.get_snapshot(&rooms[0]);
        store.retire_room(&rooms[2]);

        assert!(store.contains_room(&rooms[0]));
        assert!(!store.contains_room(&rooms[1]));
        assert!(store.contains_room(&rooms[2]));
    }

    #[test]
    fn test_evict_room_drops_log() {
        let mut store = MessageStore::new();
        store.append(confirmed(1, "u", "m", 1));
        assert!(store.evict_room(&room()));
        assert!(!store.evict_room(&room()));
        assert!(store.get_snapshot(&room()).is_empty());
        assert_eq!(store.stats().evicted_rooms, 1);
    }
}
