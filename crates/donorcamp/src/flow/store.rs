//! In-memory flow store with a per-flow turn guard and TTL eviction.
//!
//! The lock is never held across I/O. Callers check a flow out with
//! `begin_turn`, mutate their private copy, then `commit_turn` it back.
//! A second caller arriving while a turn is checked out gets
//! `ConcurrentModification` instead of silently interleaving.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::flow::FlowState;

struct FlowEntry {
    state: FlowState,
    in_flight: bool,
    touched: Instant,
}

/// Thread-safe store for active conversation flows.
pub struct FlowStore {
    inner: Mutex<HashMap<String, FlowEntry>>,
    ttl: Duration,
}

impl FlowStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Registers a freshly started flow.
    pub fn insert(&self, state: FlowState) {
        let mut flows = self.lock();
        flows.insert(
            state.id.clone(),
            FlowEntry {
                state,
                in_flight: false,
                touched: Instant::now(),
            },
        );
    }

    /// Read-only snapshot of a flow.
    pub fn get(&self, flow_id: &str) -> Result<FlowState> {
        let flows = self.lock();
        flows
            .get(flow_id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| EngineError::NotFound {
                entity: "flow",
                id: flow_id.to_string(),
            })
    }

    /// Checks a flow out for one turn. Fails if another turn is in flight.
    pub fn begin_turn(&self, flow_id: &str) -> Result<FlowState> {
        let mut flows = self.lock();
        let entry = flows.get_mut(flow_id).ok_or_else(|| EngineError::NotFound {
            entity: "flow",
            id: flow_id.to_string(),
        })?;
        if entry.in_flight {
            return Err(EngineError::ConcurrentModification(format!(
                "flow {} already has a turn in flight",
                flow_id
            )));
        }
        entry.in_flight = true;
        Ok(entry.state.clone())
    }

    /// Commits a completed turn: writes the state back, bumps the version
    /// and releases the guard.
    pub fn commit_turn(&self, mut state: FlowState) {
        let mut flows = self.lock();
        let id = state.id.clone();
        if let Some(entry) = flows.get_mut(&id) {
            state.version = entry.state.version + 1;
            entry.state = state;
            entry.in_flight = false;
            entry.touched = Instant::now();
        }
    }

    /// Releases the guard without applying changes, after a failed turn.
    pub fn abort_turn(&self, flow_id: &str) {
        let mut flows = self.lock();
        if let Some(entry) = flows.get_mut(flow_id) {
            entry.in_flight = false;
        }
    }

    pub fn remove(&self, flow_id: &str) {
        let mut flows = self.lock();
        flows.remove(flow_id);
    }

    /// Drops flows idle past the TTL. In-flight flows are spared: the
    /// active turn will commit and refresh them.
    pub fn sweep_expired(&self) -> usize {
        let mut flows = self.lock();
        let ttl = self.ttl;
        let before = flows.len();
        flows.retain(|_, entry| entry.in_flight || entry.touched.elapsed() < ttl);
        let evicted = before - flows.len();
        if evicted > 0 {
            log::debug!("Evicted {} expired flows", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, FlowEntry>> {
        // A poisoned flow map only ever holds ephemeral dialogue state,
        // so recover the inner map rather than wedging every caller.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
