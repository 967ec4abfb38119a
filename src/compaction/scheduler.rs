//! Per-partition run state for the derivation stages.
//!
//! Each `(transition, engine, benchmark)` is either idle or running. A run
//! holds a [`RunGuard`]; dropping the guard (on success, error, panic or
//! cancellation) returns the partition to idle. Ingestion never touches
//! this state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::core::outcome::StreamId;
use crate::storage::layers::Transition;

type PartitionKey = (Transition, StreamId);

/// Tracks which partitions have a run in flight.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    running: Arc<Mutex<HashSet<PartitionKey>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a partition from idle to running.
    ///
    /// Returns `None` when a run is already in flight.
    pub fn try_begin(&self, transition: Transition, stream: &StreamId) -> Option<RunGuard> {
        let key = (transition, stream.clone());
        let mut running = self.running.lock().ok()?;
        if !running.insert(key.clone()) {
            tracing::debug!(%transition, %stream, "run already in flight");
            return None;
        }
        Some(RunGuard {
            running: Arc::clone(&self.running),
            key,
        })
    }

    pub fn is_running(&self, transition: Transition, stream: &StreamId) -> bool {
        self.running
            .lock()
            .map(|r| r.contains(&(transition, stream.clone())))
            .unwrap_or(false)
    }

    /// Number of runs in flight.
    pub fn in_flight(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }
}

/// Proof that a partition is running. Dropping it returns the partition
/// to idle.
#[derive(Debug)]
pub struct RunGuard {
    running: Arc<Mutex<HashSet<PartitionKey>>>,
    key: PartitionKey,
}

impl RunGuard {
    pub fn transition(&self) -> Transition {
        self.key.0
    }

    pub fn stream(&self) -> &StreamId {
        &self.key.1
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // A poisoned set is still usable for removal.
        let mut running = match self.running.lock() {
            Ok(running) => running,
            Err(poisoned) => poisoned.into_inner(),
        };
        running.remove(&self.key);
    }
}
