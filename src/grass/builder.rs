//! Background construction of one instance batch.
//!
//! An [`InstanceBatchBuilder`] owns everything it needs (a shared density
//! grid, its placement settings and exclusion boxes) so it can run on a
//! worker thread. `build` samples placements, turns them into transforms,
//! clusters them and permutes the instance buffer in place to match the
//! cluster order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::{Mat4, Vec3};
use crate::core::HandleId;
use crate::grass::cluster::{build_cluster_tree, ClusterNode};
use crate::grass::density::DensitySampleGrid;
use crate::grass::instance::InstanceBuffer;
use crate::grass::sampler::{PlacementArea, PlacementSampler, PlacementSettings, PlacementStrategy};
use crate::math::Aabb;

/// Inputs for one batch build
#[derive(Clone, Debug)]
pub struct BatchBuildParams {
    pub grid: Arc<DensitySampleGrid>,
    pub grass_type: HandleId,
    pub area: PlacementArea,
    /// Tile vertex spacing (X/Z) and height scale (Y)
    pub tile_scale: Vec3,
    pub settings: PlacementSettings,
    pub strategy: PlacementStrategy,
    pub seed: u32,
    /// Exclusion boxes in tile-local space
    pub excluded: Vec<Aabb>,
    pub mesh_bounds: Aabb,
    pub instances_per_leaf: usize,
    pub keep_cpu_copy: bool,
}

/// Finished batch ready to hand to the sink
#[derive(Clone, Debug, Default)]
pub struct BuiltBatch {
    pub instances: InstanceBuffer,
    pub cluster_tree: Vec<ClusterNode>,
    pub occlusion_layers: u32,
    pub build_time: Duration,
}

impl BuiltBatch {
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

pub struct InstanceBatchBuilder {
    params: BatchBuildParams,
    valid: bool,
}

impl InstanceBatchBuilder {
    /// Wrap build inputs. A zero `instances_per_leaf` is a programming error.
    pub fn new(params: BatchBuildParams) -> Self {
        debug_assert!(params.instances_per_leaf > 0, "instances_per_leaf must be positive");
        let valid = params.area.is_valid() && params.grid.is_valid_for(params.grass_type);
        Self { params, valid }
    }

    /// Whether `build` would do any work. Callers skip invalid builders.
    pub fn has_valid_data(&self) -> bool {
        self.valid
    }

    pub fn build(self) -> BuiltBatch {
        let start = Instant::now();
        let params = &self.params;
        let Some(access) = self.valid.then(|| params.grid.access(params.grass_type)).flatten() else {
            return BuiltBatch::default();
        };
        let Some(sampler) = PlacementSampler::new(
            access,
            params.tile_scale,
            params.area,
            &params.settings,
            params.strategy,
            &params.excluded,
            params.seed,
        ) else {
            return BuiltBatch::default();
        };

        let transforms: Vec<Mat4> = sampler.sample().iter().map(|p| p.transform()).collect();
        let mut instances = InstanceBuffer::new(params.keep_cpu_copy);
        if transforms.is_empty() {
            return BuiltBatch {
                instances,
                build_time: start.elapsed(),
                ..Default::default()
            };
        }

        instances.allocate(transforms.len());
        for (i, transform) in transforms.iter().enumerate() {
            instances.set_instance(i, *transform);
        }

        let mut tree = build_cluster_tree(&transforms, &params.mesh_bounds, params.instances_per_leaf.max(1));
        apply_cluster_order(&mut instances, &mut tree.sorted_instances, &mut tree.instance_reorder);

        BuiltBatch {
            instances,
            cluster_tree: tree.nodes,
            occlusion_layers: tree.occlusion_layers,
            build_time: start.elapsed(),
        }
    }
}

/// Permute `buffer` so slot `s` holds original instance `sorted[s]`,
/// following swap cycles in place. Both tables end as the identity.
fn apply_cluster_order(buffer: &mut InstanceBuffer, sorted: &mut [u32], reorder: &mut [u32]) {
    for first in 0..sorted.len() {
        let load_from = sorted[first] as usize;
        if load_from == first {
            continue;
        }
        debug_assert!(load_from > first);
        buffer.swap_instances(first, load_from);

        let swap_goes_to = reorder[first] as usize;
        debug_assert!(swap_goes_to > first);
        debug_assert_eq!(sorted[swap_goes_to] as usize, first);
        sorted[swap_goes_to] = load_from as u32;
        reorder[load_from] = swap_goes_to as u32;
        reorder[first] = first as u32;
        sorted[first] = first as u32;
    }
}
