//! Registry of requests currently being relayed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

struct Entry {
    seq: u64,
    cancel: CancellationToken,
    started: Instant,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<String, Entry>,
}

/// Handed to the task relaying a registered request.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub seq: u64,
    pub cancel: CancellationToken,
}

/// In-flight requests keyed by `request_id`.
///
/// At most one entry exists per id. Entries carry a registration sequence
/// number so a finishing task can only remove its own entry.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `request_id`. Returns `None` if it is already in flight.
    pub fn register(&self, request_id: &str) -> Option<Ticket> {
        let mut inner = self.lock();
        if inner.entries.contains_key(request_id) {
            return None;
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let cancel = CancellationToken::new();
        inner.entries.insert(
            request_id.to_string(),
            Entry {
                seq,
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );
        drop(inner);
        Some(Ticket { seq, cancel })
    }

    /// Remove the entry registered as `seq`. Returns how long it was in
    /// flight, or `None` if the entry is gone or belongs to a newer request.
    pub fn finish(&self, request_id: &str, seq: u64) -> Option<Duration> {
        let mut inner = self.lock();
        if inner.entries.get(request_id).is_none_or(|e| e.seq != seq) {
            return None;
        }
        inner
            .entries
            .remove(request_id)
            .map(|e| e.started.elapsed())
    }

    /// Cancel and remove every entry. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.lock().entries.drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        drained.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, request_id: &str) -> bool {
        self.lock().entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
