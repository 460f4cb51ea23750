//! Outbound send tracking
//!
//! Keeps one record per in-flight send until it reaches exactly one terminal
//! outcome: confirmed by its echo, or failed on timeout. Once resolved a record
//! is gone, so a second resolution for the same key is a no-op.
//!
//! The tracker is keyed generically so the same bookkeeping serves chat sends
//! (keyed by [`CorrelationId`]) and any other request/echo flow.

use crate::config::OutboundConfig;
use crate::errors::{FlorachatError, Result};
use crate::types::{CorrelationId, RoomId, Timestamp};
use core::hash::Hash;
use hashbrown::HashMap;

// ----------------------------------------------------------------------------
// Tracked Send
// ----------------------------------------------------------------------------

/// An in-flight send awaiting its echo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSend<K> {
    pub key: K,
    pub room_id: RoomId,
    pub started_at: Timestamp,
    /// Point after which the send counts as failed
    pub deadline: Timestamp,
    /// 1 for the first attempt, 2 for a resend
    pub attempt: u32,
    /// Key of the failed send this one replaces
    pub supersedes: Option<K>,
}

impl<K> TrackedSend<K> {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.deadline
    }
}

/// Terminal outcome of a tracked send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed,
    Failed,
}

/// Send tracking counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundStatistics {
    pub tracked: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub resends: u64,
    /// Sum of confirmation latencies, for averaging
    pub total_latency_ms: u64,
}

impl OutboundStatistics {
    /// Mean time from submission to echo
    pub fn average_latency_ms(&self) -> Option<u64> {
        if self.confirmed == 0 {
            None
        } else {
            Some(self.total_latency_ms / self.confirmed)
        }
    }
}

// ----------------------------------------------------------------------------
// Outbound Tracker
// ----------------------------------------------------------------------------

/// Tracks in-flight sends and resolves each one exactly once
#[derive(Debug)]
pub struct OutboundTracker<K = CorrelationId>
where
    K: Eq + Hash + Clone,
{
    config: OutboundConfig,
    in_flight: HashMap<K, TrackedSend<K>>,
    stats: OutboundStatistics,
}

impl<K> OutboundTracker<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: OutboundConfig) -> Self {
        Self {
            config,
            in_flight: HashMap::default(),
            stats: OutboundStatistics::default(),
        }
    }

    pub fn config(&self) -> &OutboundConfig {
        &self.config
    }

    /// Reject content the server would not accept
    pub fn validate_content(&self, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(FlorachatError::invalid_content("message is empty"));
        }
        let length = content.chars().count();
        if length > self.config.max_content_length {
            return Err(FlorachatError::invalid_content(format!(
                "message is {} characters, limit is {}",
                length, self.config.max_content_length
            )));
        }
        Ok(())
    }

    /// Start tracking a send submitted at `now`; returns its deadline
    pub fn track(
        &mut self,
        key: K,
        room_id: RoomId,
        now: Timestamp,
        supersedes: Option<K>,
    ) -> Timestamp {
        let attempt = match &supersedes {
            Some(_) => {
                self.stats.resends += 1;
                2
            }
            None => 1,
        };
        let deadline = now + self.config.send_timeout_ms;
        self.in_flight.insert(
            key.clone(),
            TrackedSend {
                key,
                room_id,
                started_at: now,
                deadline,
                attempt,
                supersedes,
            },
        );
        self.stats.tracked += 1;
        deadline
    }

    /// Settle a send; `None` if it was not in flight (already resolved or unknown)
    pub fn resolve(
        &mut self,
        key: &K,
        outcome: SendOutcome,
        now: Timestamp,
    ) -> Option<TrackedSend<K>> {
        let tracked = self.in_flight.remove(key)?;
        match outcome {
            SendOutcome::Confirmed => {
                self.stats.confirmed += 1;
                self.stats.total_latency_ms += now - tracked.started_at;
            }
            SendOutcome::Failed => self.stats.failed += 1,
        }
        Some(tracked)
    }

    /// Keys of sends whose deadline has passed
    pub fn expired(&self, now: Timestamp) -> Vec<K> {
        self.in_flight
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.key.clone())
            .collect()
    }

    pub fn get(&self, key: &K) -> Option<&TrackedSend<K>> {
        self.in_flight.get(key)
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_for_room(&self, room_id: &RoomId) -> usize {
        self.in_flight
            .values()
            .filter(|t| &t.room_id == room_id)
            .count()
    }

    pub fn statistics(&self) -> &OutboundStatistics {
        &self.stats
    }
}

impl<K> Default for OutboundTracker<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(OutboundConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> OutboundTracker {
        OutboundTracker::new(OutboundConfig {
            send_timeout_ms: 10_000,
            max_content_length: 10,
        })
    }

    #[test]
    fn test_each_send_resolves_once() {
        let mut tracker = tracker();
        let key = CorrelationId::generate();
        let deadline = tracker.track(key, RoomId::new("r"), Timestamp::new(1_000), None);
        assert_eq!(deadline, Timestamp::new(11_000));

        let resolved = tracker
            .resolve(&key, SendOutcome::Confirmed, Timestamp::new(1_250))
            .unwrap();
        assert_eq!(resolved.attempt, 1);
        assert!(tracker
            .resolve(&key, SendOutcome::Failed, Timestamp::new(11_000))
            .is_none());

        let stats = tracker.statistics();
        assert_eq!(stats.confirmed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.average_latency_ms(), Some(250));
    }

    #[test]
    fn test_expired_sweep() {
        let mut tracker = tracker();
        let early = CorrelationId::generate();
        let late = CorrelationId::generate();
        tracker.track(early, RoomId::new("r"), Timestamp::new(0), None);
        tracker.track(late, RoomId::new("r"), Timestamp::new(5_000), None);

        assert!(tracker.expired(Timestamp::new(9_999)).is_empty());
        assert_eq!(tracker.expired(Timestamp::new(10_000)), vec![early]);
        assert_eq!(tracker.in_flight_for_room(&RoomId::new("r")), 2);
    }

    #[test]
    fn test_resend_records_lineage() {
        let mut tracker = tracker();
        let original = CorrelationId::generate();
        let resent = CorrelationId::generate();
        tracker.track(original, RoomId::new("r"), Timestamp::new(0), None);
        tracker.resolve(&original, SendOutcome::Failed, Timestamp::new(10_000));
        tracker.track(resent, RoomId::new("r"), Timestamp::new(12_000), Some(original));

        let tracked = tracker.get(&resent).unwrap();
        assert_eq!(tracked.supersedes, Some(original));
        assert_eq!(tracked.attempt, 2);
        assert_eq!(tracker.statistics().resends, 1);
        assert!(!tracker.is_in_flight(&original));
    }

    #[test]
    fn test_content_validation() {
        let tracker = tracker();
        assert!(tracker.validate_content("hello").is_ok());
        assert!(matches!(
            tracker.validate_content("   "),
            Err(FlorachatError::InvalidContent { .. })
        ));
        assert!(tracker.validate_content("far too long for this").is_err());
        // Limit counts characters, not bytes
        assert!(tracker.validate_content("ééééééééé").is_ok());
    }

    #[test]
    fn test_generic_key() {
        let mut tracker: OutboundTracker<u32> = OutboundTracker::default();
        tracker.track(7, RoomId::new("r"), Timestamp::new(0), None);
        assert!(tracker.is_in_flight(&7));
        assert_eq!(tracker.in_flight_count(), 1);
    }
}
