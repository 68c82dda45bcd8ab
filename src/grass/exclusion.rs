//! Exclusion boxes suppressing grass placement.
//!
//! Any host object can register a world-space box under its owner handle.
//! Every mutation bumps a change tag so consumers can keep a cheap
//! [`ExclusionSnapshot`] per tile and only recompute intersections when the
//! tag moved. Owners that died without removing their box are purged lazily,
//! at most once per frame.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::OwnerHandle;
use crate::math::Aabb;

/// Thread-safe owner → box registry
#[derive(Debug)]
pub struct ExclusionRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug)]
struct RegistryState {
    boxes: HashMap<OwnerHandle, Aabb>,
    change_tag: u64,
    last_purge_frame: Option<u64>,
}

impl ExclusionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                boxes: HashMap::new(),
                // snapshots start at 0, so the first query always computes
                change_tag: 1,
                last_purge_frame: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace the box for `owner`.
    pub fn add(&self, owner: OwnerHandle, bounds: Aabb) {
        let mut state = self.lock();
        state.boxes.insert(owner, bounds);
        state.change_tag += 1;
    }

    pub fn remove(&self, owner: &OwnerHandle) {
        let mut state = self.lock();
        state.boxes.remove(owner);
        state.change_tag += 1;
    }

    pub fn remove_all(&self) {
        let mut state = self.lock();
        state.boxes.clear();
        state.change_tag += 1;
    }

    pub fn change_tag(&self) -> u64 {
        self.lock().change_tag
    }

    pub fn len(&self) -> usize {
        self.lock().boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().boxes.is_empty()
    }

    /// Remove boxes whose owner is gone. Runs at most once per `frame`.
    ///
    /// # Returns
    /// Number of boxes removed
    pub fn purge_stale(&self, frame: u64) -> usize {
        let mut state = self.lock();
        if state.last_purge_frame == Some(frame) {
            return 0;
        }
        state.last_purge_frame = Some(frame);

        let before = state.boxes.len();
        state.boxes.retain(|owner, _| owner.is_alive());
        let removed = before - state.boxes.len();
        if removed > 0 {
            state.change_tag += 1;
            log::debug!("Purged {} stale exclusion boxes", removed);
        }
        removed
    }

    /// All boxes intersecting `query`, without duplicates
    pub fn boxes_intersecting(&self, query: &Aabb) -> Vec<Aabb> {
        self.lock().intersecting(query)
    }

    /// Boxes intersecting `query`, recomputed only when the registry changed
    /// since `snapshot` was last refreshed. The tag and the boxes are read
    /// under one lock, so `snapshot.change_tag()` always describes the
    /// returned set.
    pub fn current_samples<'a>(&self, snapshot: &'a mut ExclusionSnapshot, query: &Aabb) -> &'a [Aabb] {
        let state = self.lock();
        if snapshot.change_tag != state.change_tag {
            snapshot.boxes = state.intersecting(query);
            snapshot.change_tag = state.change_tag;
        }
        &snapshot.boxes
    }

    /// Log every registered box with its owner state.
    pub fn dump(&self) {
        let state = self.lock();
        log::info!("Exclusion boxes: {} (change tag {})", state.boxes.len(), state.change_tag);
        for (owner, bounds) in &state.boxes {
            let stale = if owner.is_alive() { "" } else { " [stale]" };
            log::info!(
                "  owner {}: {:?} .. {:?}{}",
                owner.id().raw(), bounds.min, bounds.max, stale
            );
        }
    }
}

impl RegistryState {
    fn intersecting(&self, query: &Aabb) -> Vec<Aabb> {
        let mut out: Vec<Aabb> = Vec::new();
        for bounds in self.boxes.values() {
            if bounds.intersects(query) && !out.contains(bounds) {
                out.push(*bounds);
            }
        }
        out
    }
}

impl Default for ExclusionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached intersection result for one query region
#[derive(Clone, Debug, Default)]
pub struct ExclusionSnapshot {
    change_tag: u64,
    boxes: Vec<Aabb>,
}

impl ExclusionSnapshot {
    pub fn change_tag(&self) -> u64 {
        self.change_tag
    }

    pub fn boxes(&self) -> &[Aabb] {
        &self.boxes
    }
}
