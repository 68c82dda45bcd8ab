//! Renderer-facing seam: where built batches go.
//!
//! The scheduler never renders. It creates, feeds and destroys opaque
//! batches through an [`InstanceSink`]. [`HeadlessSink`] keeps everything in
//! memory and records calls, for the simulation driver and tests.

use std::collections::HashMap;

use crate::core::types::Affine3A;
use crate::grass::cluster::ClusterNode;
use crate::grass::instance::InstanceBuffer;
use crate::grass::types::MeshId;

/// Opaque batch handle issued by a sink
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub u64);

/// Everything a sink needs to create a batch
#[derive(Clone, Debug, PartialEq)]
pub struct BatchDesc {
    pub mesh: MeshId,
    /// Tile-to-world transform; instance transforms are tile-local
    pub transform: Affine3A,
    pub min_lod: i32,
    pub random_seed: u32,
    pub cast_dynamic_shadow: bool,
    pub receives_decals: bool,
    pub keep_cpu_copy: bool,
}

pub trait InstanceSink {
    /// Create and register a new, empty batch.
    fn create_batch(&mut self, desc: &BatchDesc) -> BatchId;

    /// Detach and destroy a batch. Unknown ids are ignored.
    fn destroy_batch(&mut self, batch: BatchId);

    /// Whether the batch still exists on the sink side.
    fn is_alive(&self, batch: BatchId) -> bool;

    /// Start/end fade distances; `(0, 0)` disables distance culling.
    fn set_cull_distances(&mut self, batch: BatchId, start: f32, end: f32);

    /// Whether the batch already received instances once.
    fn has_instance_data(&self, batch: BatchId) -> bool;

    /// First upload of a batch's instances.
    fn init_instance_data(&mut self, batch: BatchId, instances: InstanceBuffer);

    /// Replace existing instance data in place.
    fn update_from_preallocated(&mut self, batch: BatchId, instances: InstanceBuffer);

    /// Hand over the cluster tree built alongside the instances.
    ///
    /// # Arguments
    /// * `tree` - Flat breadth-first nodes, indices into the reordered instances
    /// * `occlusion_layers` - Tree levels suitable for occlusion queries
    /// * `instance_count` - Instances the tree covers
    fn accept_prebuilt_tree(&mut self, batch: BatchId, tree: Vec<ClusterNode>, occlusion_layers: u32, instance_count: usize);

    /// Push updated state to the renderer immediately (forced sync).
    fn recreate_render_state(&mut self, _batch: BatchId) {}
}

/// A batch as held by [`HeadlessSink`]
#[derive(Clone, Debug)]
pub struct HeadlessBatch {
    pub desc: BatchDesc,
    pub cull_start: f32,
    pub cull_end: f32,
    pub instances: Option<InstanceBuffer>,
    pub cluster_tree: Vec<ClusterNode>,
    pub occlusion_layers: u32,
    pub instance_count: usize,
    /// Number of instance uploads (init + update)
    pub uploads: u32,
    pub render_state_refreshes: u32,
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct HeadlessSink {
    next_id: u64,
    batches: HashMap<BatchId, HeadlessBatch>,
    created: u64,
    destroyed: Vec<BatchId>,
}

impl HeadlessSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live batch by id
    pub fn batch(&self, batch: BatchId) -> Option<&HeadlessBatch> {
        self.batches.get(&batch)
    }

    pub fn batches(&self) -> impl Iterator<Item = (&BatchId, &HeadlessBatch)> {
        self.batches.iter()
    }

    /// Batches created and not yet destroyed
    pub fn live_count(&self) -> usize {
        self.batches.len()
    }

    /// Batches created over the sink's lifetime
    pub fn created_count(&self) -> u64 {
        self.created
    }

    /// Every destroyed id, in destruction order
    pub fn destroyed(&self) -> &[BatchId] {
        &self.destroyed
    }

    /// Instances across all live batches
    pub fn total_instances(&self) -> usize {
        self.batches.values().map(|b| b.instance_count).sum()
    }
}

impl InstanceSink for HeadlessSink {
    fn create_batch(&mut self, desc: &BatchDesc) -> BatchId {
        self.next_id += 1;
        self.created += 1;
        let id = BatchId(self.next_id);
        self.batches.insert(id, HeadlessBatch {
            desc: desc.clone(),
            cull_start: 0.0,
            cull_end: 0.0,
            instances: None,
            cluster_tree: Vec::new(),
            occlusion_layers: 0,
            instance_count: 0,
            uploads: 0,
            render_state_refreshes: 0,
        });
        id
    }

    fn destroy_batch(&mut self, batch: BatchId) {
        if self.batches.remove(&batch).is_some() {
            self.destroyed.push(batch);
        }
    }

    fn is_alive(&self, batch: BatchId) -> bool {
        self.batches.contains_key(&batch)
    }

    fn set_cull_distances(&mut self, batch: BatchId, start: f32, end: f32) {
        if let Some(b) = self.batches.get_mut(&batch) {
            b.cull_start = start;
            b.cull_end = end;
        }
    }

    fn has_instance_data(&self, batch: BatchId) -> bool {
        self.batches.get(&batch).is_some_and(|b| b.instances.is_some())
    }

    fn init_instance_data(&mut self, batch: BatchId, instances: InstanceBuffer) {
        if let Some(b) = self.batches.get_mut(&batch) {
            b.instances = Some(instances);
            b.uploads += 1;
        }
    }

    fn update_from_preallocated(&mut self, batch: BatchId, instances: InstanceBuffer) {
        if let Some(b) = self.batches.get_mut(&batch) {
            b.instances = Some(instances);
            b.uploads += 1;
        }
    }

    fn accept_prebuilt_tree(&mut self, batch: BatchId, tree: Vec<ClusterNode>, occlusion_layers: u32, instance_count: usize) {
        if let Some(b) = self.batches.get_mut(&batch) {
            b.cluster_tree = tree;
            b.occlusion_layers = occlusion_layers;
            b.instance_count = instance_count;
        }
    }

    fn recreate_render_state(&mut self, batch: BatchId) {
        if let Some(b) = self.batches.get_mut(&batch) {
            b.render_state_refreshes += 1;
        }
    }
}
