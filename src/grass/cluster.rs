//! Spatial cluster tree over a batch's instances.
//!
//! The tree is a binary median split built breadth first, so every node's
//! children are adjacent in the node array and every node covers one
//! contiguous range of the reordered instances. The renderer culls whole
//! nodes and issues occlusion queries against the coarse levels.

use std::collections::VecDeque;

use bytemuck::{Pod, Zeroable};

use crate::core::types::{Affine3A, Mat4, Vec3};
use crate::math::Aabb;

/// Levels with at most this many nodes are cheap enough to occlusion-query.
pub const OCCLUSION_LAYER_TARGET: usize = 16;

/// One node as consumed by the renderer (48 bytes).
///
/// Leaves have `first_child == last_child == -1`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ClusterNode {
    pub bound_min: [f32; 3],
    pub first_child: i32,
    // -- 16 bytes --
    pub bound_max: [f32; 3],
    pub last_child: i32,
    // -- 16 bytes --
    pub first_instance: i32,
    pub last_instance: i32,
    pub _pad: [i32; 2],
    // -- 16 bytes --
}

impl ClusterNode {
    pub fn is_leaf(&self) -> bool {
        self.first_child < 0
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::new(Vec3::from(self.bound_min), Vec3::from(self.bound_max))
    }

    fn set_bounds(&mut self, bounds: &Aabb) {
        self.bound_min = bounds.min.to_array();
        self.bound_max = bounds.max.to_array();
    }
}

/// Result of clustering
#[derive(Clone, Debug, Default)]
pub struct ClusterTree {
    pub nodes: Vec<ClusterNode>,
    /// `sorted_instances[slot]` = original index placed at `slot`
    pub sorted_instances: Vec<u32>,
    /// `instance_reorder[original]` = slot it moves to
    pub instance_reorder: Vec<u32>,
    pub occlusion_layers: u32,
}

/// Build a cluster tree over instances of a mesh with `mesh_bounds`.
///
/// # Arguments
/// * `transforms` - Instance transforms in batch space
/// * `mesh_bounds` - Local bounds of the instanced mesh
/// * `instances_per_leaf` - Maximum instances per leaf node
pub fn build_cluster_tree(transforms: &[Mat4], mesh_bounds: &Aabb, instances_per_leaf: usize) -> ClusterTree {
    debug_assert!(instances_per_leaf > 0, "instances_per_leaf must be positive");
    let per_leaf = instances_per_leaf.max(1);
    let count = transforms.len();
    if count == 0 {
        return ClusterTree::default();
    }

    let boxes: Vec<Aabb> = transforms
        .iter()
        .map(|t| mesh_bounds.transformed(&Affine3A::from_mat4(*t)))
        .collect();
    let centers: Vec<Vec3> = boxes.iter().map(Aabb::center).collect();
    let mut order: Vec<u32> = (0..count as u32).collect();

    let mut nodes = vec![ClusterNode::zeroed()];
    let mut level_sizes: Vec<usize> = Vec::new();
    // (node, first slot, end slot, depth)
    let mut queue: VecDeque<(usize, usize, usize, usize)> = VecDeque::new();
    queue.push_back((0, 0, count, 0));

    while let Some((node, start, end, depth)) = queue.pop_front() {
        if level_sizes.len() <= depth {
            level_sizes.push(0);
        }
        level_sizes[depth] += 1;

        nodes[node].first_instance = start as i32;
        nodes[node].last_instance = end as i32 - 1;

        if end - start <= per_leaf {
            nodes[node].first_child = -1;
            nodes[node].last_child = -1;
            continue;
        }

        let slice = &mut order[start..end];
        let mut spread = Aabb::EMPTY;
        for &i in slice.iter() {
            spread.expand(centers[i as usize]);
        }
        let size = spread.size();
        let axis = if size.x >= size.y && size.x >= size.z {
            0
        } else if size.y >= size.z {
            1
        } else {
            2
        };
        let mid = slice.len() / 2;
        slice.select_nth_unstable_by(mid, |&a, &b| {
            centers[a as usize][axis].total_cmp(&centers[b as usize][axis])
        });

        let left = nodes.len();
        nodes.push(ClusterNode::zeroed());
        nodes.push(ClusterNode::zeroed());
        nodes[node].first_child = left as i32;
        nodes[node].last_child = left as i32 + 1;
        queue.push_back((left, start, start + mid, depth + 1));
        queue.push_back((left + 1, start + mid, end, depth + 1));
    }

    // children always sit after their parent, so a reverse pass is bottom-up
    for index in (0..nodes.len()).rev() {
        let node = nodes[index];
        let bounds = if node.is_leaf() {
            (node.first_instance..=node.last_instance)
                .map(|slot| boxes[order[slot as usize] as usize])
                .fold(Aabb::EMPTY, |acc, b| acc.merged(&b))
        } else {
            (node.first_child..=node.last_child)
                .map(|child| nodes[child as usize].bounds())
                .fold(Aabb::EMPTY, |acc, b| acc.merged(&b))
        };
        nodes[index].set_bounds(&bounds);
    }

    let mut instance_reorder = vec![0u32; count];
    for (slot, &original) in order.iter().enumerate() {
        instance_reorder[original as usize] = slot as u32;
    }

    let occlusion_layers = level_sizes
        .iter()
        .skip(1)
        .filter(|&&n| n <= OCCLUSION_LAYER_TARGET)
        .count() as u32;

    ClusterTree {
        nodes,
        sorted_instances: order,
        instance_reorder,
        occlusion_layers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_of_instances(n: usize) -> Vec<Mat4> {
        (0..n).map(|i| Mat4::from_translation(Vec3::new(((i * 7) % n) as f32, 0.0, 0.0))).collect()
    }

    #[test]
    fn test_cluster_node_size() {
        assert_eq!(std::mem::size_of::<ClusterNode>(), 48);
        assert_eq!(bytemuck::bytes_of(&ClusterNode::zeroed()).len(), 48);
    }

    #[test]
    fn test_empty() {
        let tree = build_cluster_tree(&[], &Aabb::new(Vec3::ZERO, Vec3::ONE), 4);
        assert!(tree.nodes.is_empty());
        assert_eq!(tree.occlusion_layers, 0);
    }

    #[test]
    fn test_single_leaf() {
        let tree = build_cluster_tree(&line_of_instances(3), &Aabb::new(Vec3::ZERO, Vec3::ONE), 4);
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.nodes[0].is_leaf());
        assert_eq!(tree.nodes[0].last_instance, 2);
        assert_eq!(tree.nodes[0].bounds(), Aabb::new(Vec3::ZERO, Vec3::new(3.0, 1.0, 1.0)));
    }

    #[test]
    fn test_tree_structure() {
        let n = 100;
        let transforms = line_of_instances(n);
        let mesh = Aabb::new(Vec3::splat(-0.25), Vec3::splat(0.25));
        let tree = build_cluster_tree(&transforms, &mesh, 8);

        // permutation tables are inverse of each other
        for slot in 0..n {
            assert_eq!(tree.instance_reorder[tree.sorted_instances[slot] as usize] as usize, slot);
        }

        for node in &tree.nodes {
            let bounds = node.bounds();
            for slot in node.first_instance..=node.last_instance {
                let original = tree.sorted_instances[slot as usize] as usize;
                let p = transforms[original].transform_point3(Vec3::ZERO);
                assert!(bounds.contains_point(p));
            }
            if node.is_leaf() {
                assert!(node.last_instance - node.first_instance < 8);
            } else {
                assert_eq!(node.last_child, node.first_child + 1);
                let left = tree.nodes[node.first_child as usize];
                let right = tree.nodes[node.last_child as usize];
                assert_eq!(left.first_instance, node.first_instance);
                assert_eq!(right.last_instance, node.last_instance);
                assert_eq!(left.last_instance + 1, right.first_instance);
            }
        }
        // median split along X keeps left subtrees left of right subtrees
        let root = tree.nodes[0];
        let left = tree.nodes[root.first_child as usize].bounds();
        let right = tree.nodes[root.last_child as usize].bounds();
        assert!(left.center().x < right.center().x);
        assert!(tree.occlusion_layers >= 1);
    }
}
