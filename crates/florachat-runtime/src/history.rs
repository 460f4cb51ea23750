//! History loader
//!
//! Fetches pages of past messages and merges them into the store. Retryable
//! failures are retried with bounded backoff; when the budget runs out the
//! failure is published as `HistoryUnavailable` and the room keeps working for
//! live traffic.
//!
//! Each fetch runs as its own task. Leaving a room aborts its fetch, and a
//! result that comes back for an older join generation is discarded. A caller
//! that stops waiting for a page aborts the fetch behind it.

use crate::api::HistoryApi;
use crate::events::{publish, SessionEvent, SessionEventSender};
use crate::state::SharedState;
use florachat_core::{
    Backoff, FlorachatError, HistoryConfig, HistoryFetchError, HistoryPage, MergeReport, Result,
    RoomId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

// ----------------------------------------------------------------------------
// In-flight fetches
// ----------------------------------------------------------------------------

/// Abort handles of running fetches, per room
#[derive(Debug, Default)]
struct InFlight {
    next_ticket: u64,
    fetches: HashMap<RoomId, Vec<(u64, AbortHandle)>>,
}

impl InFlight {
    fn register(&mut self, room_id: RoomId, handle: AbortHandle) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.fetches.entry(room_id).or_default().push((ticket, handle));
        ticket
    }

    fn release(&mut self, room_id: &RoomId, ticket: u64) {
        if let Some(fetches) = self.fetches.get_mut(room_id) {
            fetches.retain(|(t, _)| *t != ticket);
            if fetches.is_empty() {
                self.fetches.remove(room_id);
            }
        }
    }

    fn cancel(&mut self, room_id: &RoomId) -> usize {
        let fetches = self.fetches.remove(room_id).unwrap_or_default();
        for (_, handle) in &fetches {
            handle.abort();
        }
        fetches.len()
    }

    fn count(&self, room_id: &RoomId) -> usize {
        self.fetches.get(room_id).map(Vec::len).unwrap_or(0)
    }
}

/// Critical sections never await, so a plain mutex is enough
fn lock_in_flight(in_flight: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases a fetch's slot however the waiting caller finishes
struct FetchGuard {
    in_flight: Arc<Mutex<InFlight>>,
    room_id: RoomId,
    ticket: u64,
    abort: AbortHandle,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        // No-op when the task already finished
        self.abort.abort();
        lock_in_flight(&self.in_flight).release(&self.room_id, self.ticket);
    }
}

// ----------------------------------------------------------------------------
// History Loader
// ----------------------------------------------------------------------------

/// Loads and merges room history
#[derive(Clone)]
pub struct HistoryLoader {
    api: Arc<dyn HistoryApi>,
    state: SharedState,
    events: SessionEventSender,
    config: HistoryConfig,
    in_flight: Arc<Mutex<InFlight>>,
}

impl HistoryLoader {
    pub fn new(
        api: Arc<dyn HistoryApi>,
        state: SharedState,
        events: SessionEventSender,
        config: HistoryConfig,
    ) -> Self {
        Self {
            api,
            state,
            events,
            config,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    /// Fetch one page for a joined room and merge it into the store
    pub async fn fetch_page(&self, room_id: &RoomId, cursor: Option<String>) -> Result<MergeReport> {
        let generation = self
            .state
            .lock()
            .await
            .registry
            .generation(room_id)
            .ok_or_else(|| FlorachatError::RoomNotJoined {
                room_id: room_id.clone(),
            })?;

        let task = tokio::spawn(fetch_with_retry(
            self.api.clone(),
            self.config.clone(),
            room_id.clone(),
            cursor,
        ));
        let ticket = lock_in_flight(&self.in_flight).register(room_id.clone(), task.abort_handle());
        let guard = FetchGuard {
            in_flight: self.in_flight.clone(),
            room_id: room_id.clone(),
            ticket,
            abort: task.abort_handle(),
        };

        let outcome = task.await;
        drop(guard);

        let page = match outcome {
            Ok(Ok(page)) => page,
            Ok(Err(error)) => return Err(self.report_failure(error)),
            Err(join_error) if join_error.is_cancelled() => {
                debug!(room_id = %room_id, "history fetch cancelled");
                return Err(HistoryFetchError::Cancelled {
                    room_id: room_id.clone(),
                }
                .into());
            }
            Err(join_error) => {
                return Err(self.report_failure(HistoryFetchError::Permanent {
                    room_id: room_id.clone(),
                    attempts: 0,
                    reason: join_error.to_string(),
                }))
            }
        };

        let report = {
            let mut state = self.state.lock().await;
            if !state.registry.is_current(room_id, generation) {
                debug!(room_id = %room_id, generation, "discarding history for a stale join");
                return Err(HistoryFetchError::Cancelled {
                    room_id: room_id.clone(),
                }
                .into());
            }
            state.store.merge_history(room_id, page)
        };

        info!(
            room_id = %room_id,
            inserted = report.inserted,
            duplicates = report.duplicates,
            reconciled = report.reconciled,
            "history page merged"
        );
        publish(
            &self.events,
            SessionEvent::HistoryLoaded {
                room_id: room_id.clone(),
                inserted: report.inserted,
                next_cursor: report.next_cursor.clone(),
            },
        );
        Ok(report)
    }

    /// Abort every in-flight fetch for a room
    pub async fn cancel(&self, room_id: &RoomId) -> usize {
        let cancelled = lock_in_flight(&self.in_flight).cancel(room_id);
        if cancelled > 0 {
            debug!(room_id = %room_id, cancelled, "aborted history fetches");
        }
        cancelled
    }

    pub async fn in_flight_count(&self, room_id: &RoomId) -> usize {
        lock_in_flight(&self.in_flight).count(room_id)
    }

    fn report_failure(&self, error: HistoryFetchError) -> FlorachatError {
        if !matches!(error, HistoryFetchError::Cancelled { .. }) {
            warn!(room_id = %error.room_id(), %error, "history unavailable");
            publish(
                &self.events,
                SessionEvent::HistoryUnavailable {
                    room_id: error.room_id().clone(),
                    reason: error.to_string(),
                },
            );
        }
        error.into()
    }
}

/// Fetch a page, retrying retryable failures with backoff
async fn fetch_with_retry(
    api: Arc<dyn HistoryApi>,
    config: HistoryConfig,
    room_id: RoomId,
    cursor: Option<String>,
) -> core::result::Result<HistoryPage, HistoryFetchError> {
    let mut backoff = Backoff::new(config.retry.clone());
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let result = match timeout(
            config.request_timeout(),
            api.fetch_page(&room_id, cursor.as_deref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HistoryFetchError::Retryable {
                room_id: room_id.clone(),
                reason: format!("no response after {} ms", config.request_timeout_ms),
            }),
        };

        let error = match result {
            Ok(page) => return Ok(page),
            Err(error) if error.is_retryable() => error,
            Err(error) => return Err(error),
        };

        match backoff.next_delay() {
            Some(delay) => {
                debug!(
                    room_id = %room_id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "retrying history fetch"
                );
                sleep(delay).await;
            }
            None => {
                return Err(HistoryFetchError::Permanent {
                    room_id,
                    attempts,
                    reason: error.to_string(),
                })
            }
        }
    }
}
