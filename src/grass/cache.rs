//! Cache of grass batches keyed by tile, grass type, subsection and variety.
//!
//! Each [`BatchRecord`] tracks the live batch for one [`BatchKey`], an
//! optional previous batch kept visible during a rebuild, the exclusion boxes
//! it was built with and when it was last wanted. The scheduler owns the
//! cache and is the only thing that mutates it.

use std::collections::{HashMap, HashSet};

use crate::core::WeakHandle;
use crate::grass::sink::BatchId;
use crate::grass::tile::GrassTile;
use crate::grass::types::GrassType;
use crate::math::Aabb;

/// Identity of one batch. Tile and grass type compare by handle identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub tile: WeakHandle<GrassTile>,
    pub grass_type: WeakHandle<GrassType>,
    pub sqrt_subsections: u32,
    pub max_instances_per_batch: u32,
    pub subsection_x: u32,
    pub subsection_y: u32,
    pub num_varieties: u32,
    pub variety_index: u32,
}

impl BatchKey {
    /// Tile and grass type both still exist
    pub fn is_alive(&self) -> bool {
        self.tile.is_alive() && self.grass_type.is_alive()
    }
}

/// Lifecycle position of a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    /// First build in flight
    Pending,
    /// Built (possibly empty) and not being rebuilt
    Live,
    /// New build in flight while the previous batch stays visible
    Rebuilding,
}

#[derive(Clone, Debug)]
pub struct BatchRecord {
    pub key: BatchKey,
    /// Current batch; `None` once a build came back empty
    pub batch: Option<BatchId>,
    /// Batch being phased out by a rebuild
    pub previous_batch: Option<BatchId>,
    /// Exclusion boxes (world space) the current build used
    pub excluded_boxes: Vec<Aabb>,
    pub exclusion_change_tag: u64,
    pub last_used_frame: u64,
    pub last_used_time: f64,
    pub pending: bool,
    pub pending_removal_rebuild: bool,
}

impl BatchRecord {
    /// Fresh record with a build pending and no batch yet.
    ///
    /// # Arguments
    /// * `frame` - Frame the key was first requested
    /// * `time` - Clock seconds at that frame
    pub fn new(key: BatchKey, frame: u64, time: f64) -> Self {
        Self {
            key,
            batch: None,
            previous_batch: None,
            excluded_boxes: Vec::new(),
            exclusion_change_tag: 0,
            last_used_frame: frame,
            last_used_time: time,
            pending: true,
            pending_removal_rebuild: false,
        }
    }

    /// Mark the record as used this update.
    pub fn touch(&mut self, frame: u64, time: f64) {
        self.last_used_frame = frame;
        self.last_used_time = time;
    }

    /// Lifecycle state derived from the pending and rebuild flags.
    pub fn state(&self) -> BatchState {
        match (self.pending, self.previous_batch.is_some() || self.pending_removal_rebuild) {
            (true, true) => BatchState::Rebuilding,
            (true, false) => BatchState::Pending,
            (false, _) => BatchState::Live,
        }
    }
}

/// How long unused records survive. Both limits must be reached to evict.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetentionPolicy {
    pub min_frames: u64,
    pub min_seconds: f64,
}

impl RetentionPolicy {
    /// Whether `record` has gone unused long enough to evict.
    ///
    /// # Returns
    /// True when both the frame age and the time age reach their limits
    pub fn is_expired(&self, record: &BatchRecord, frame: u64, now: f64) -> bool {
        frame.saturating_sub(record.last_used_frame) >= self.min_frames
            && now - record.last_used_time >= self.min_seconds
    }
}

/// Key → record map
#[derive(Debug, Default)]
pub struct BatchCache {
    records: HashMap<BatchKey, BatchRecord>,
}

impl BatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BatchKey) -> Option<&BatchRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &BatchKey) -> Option<&mut BatchRecord> {
        self.records.get_mut(key)
    }

    pub fn contains(&self, key: &BatchKey) -> bool {
        self.records.contains_key(key)
    }

    /// Insert a record, replacing any record with the same key.
    ///
    /// # Returns
    /// The replaced record, if any
    pub fn insert(&mut self, record: BatchRecord) -> Option<BatchRecord> {
        self.records.insert(record.key.clone(), record)
    }

    /// Take the record out; its batches are the caller's to destroy.
    pub fn remove(&mut self, key: &BatchKey) -> Option<BatchRecord> {
        self.records.remove(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchRecord> {
        self.records.values()
    }

    /// Records still waiting for their build
    pub fn pending_count(&self) -> usize {
        self.records.values().filter(|r| r.pending).count()
    }

    /// Remove every record, returning them.
    pub fn clear(&mut self) -> Vec<BatchRecord> {
        self.records.drain().map(|(_, r)| r).collect()
    }

    /// Remove records matching `predicate`, returning them.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&BatchRecord) -> bool) -> Vec<BatchRecord> {
        let keys: Vec<BatchKey> = self.records
            .values()
            .filter(|r| predicate(r))
            .map(|r| r.key.clone())
            .collect();
        keys.iter().filter_map(|k| self.records.remove(k)).collect()
    }

    /// Remove records that are no longer worth keeping: dead tile or grass
    /// type, dead batch, or unused past both retention limits. Records with
    /// a build in flight always stay.
    pub fn evict(
        &mut self,
        frame: u64,
        now: f64,
        policy: RetentionPolicy,
        is_batch_alive: impl Fn(BatchId) -> bool,
    ) -> Vec<BatchRecord> {
        self.remove_where(|record| {
            !record.pending
                && (!record.key.is_alive()
                    || record.batch.is_some_and(|b| !is_batch_alive(b))
                    || policy.is_expired(record, frame, now))
        })
    }

    /// Every batch a record still references, current or previous
    pub fn still_used(&self) -> HashSet<BatchId> {
        self.records
            .values()
            .flat_map(|r| r.batch.into_iter().chain(r.previous_batch))
            .collect()
    }
}
