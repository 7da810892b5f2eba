//! Concurrency-safe map of container id to tunnel state.
//!
//! Keys are the full ids the runtime reports; lookups and clears also accept
//! a prefix so callers holding a short id still hit the right entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::state::TunnelState;

/// Ordered snapshot of every known tunnel state; what subscribers receive.
pub type StateSnapshot = BTreeMap<String, TunnelState>;

#[derive(Default)]
pub struct TunnelStore {
    inner: Mutex<HashMap<String, TunnelState>>,
}

impl TunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a state, returning `true` iff it differs by value from the
    /// previous entry. Callers publish change events only on `true`.
    pub fn set(&self, container_id: &str, state: TunnelState) -> bool {
        let container_id = container_id.trim();
        if container_id.is_empty() {
            return false;
        }

        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(container_id) == Some(&state) {
            return false;
        }
        map.insert(container_id.to_string(), state);
        true
    }

    pub fn get(&self, container_id: &str) -> Option<TunnelState> {
        let container_id = container_id.trim();
        if container_id.is_empty() {
            return None;
        }

        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = map.get(container_id) {
            return Some(state.clone());
        }
        map.iter()
            .find(|(key, _)| ids_match(key, container_id))
            .map(|(_, state)| state.clone())
    }

    /// Remove every entry matching by id or prefix. Returns `true` when at
    /// least one entry was dropped.
    pub fn clear(&self, container_id: &str) -> bool {
        let container_id = container_id.trim();
        if container_id.is_empty() {
            return false;
        }
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|key, _| !ids_match(key, container_id));
        map.len() != before
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .map(|(key, state)| (key.clone(), state.clone()))
            .collect()
    }

    /// Drop entries whose container no longer appears in a listing pass.
    /// Returns `true` when anything was removed.
    pub fn prune(&self, known_ids: &[String]) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|key, _| known_ids.iter().any(|known| ids_match(key, known)));
        map.len() != before
    }
}

/// Case-insensitive id comparison tolerating short-vs-long ids.
pub fn ids_match(left: &str, right: &str) -> bool {
    let left = left.trim().to_lowercase();
    let right = right.trim().to_lowercase();
    if left.is_empty() || right.is_empty() {
        return false;
    }
    left == right || left.starts_with(&right) || right.starts_with(&left)
}
