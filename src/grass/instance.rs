//! Instance buffer handed to the instance sink.

use bytemuck::{Pod, Zeroable};

use crate::core::types::{Mat4, Vec3};

/// Per-instance GPU data: local-to-tile transform, column major.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub transform: [[f32; 4]; 4],
}

impl InstanceData {
    pub fn new(transform: Mat4) -> Self {
        Self { transform: transform.to_cols_array_2d() }
    }

    pub fn transform(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.transform)
    }

    pub fn origin(&self) -> Vec3 {
        let [x, y, z, _] = self.transform[3];
        Vec3::new(x, y, z)
    }
}

/// Preallocated instance storage for one batch
#[derive(Clone, Debug, Default)]
pub struct InstanceBuffer {
    instances: Vec<InstanceData>,
    allow_cpu_access: bool,
}

impl InstanceBuffer {
    pub fn new(allow_cpu_access: bool) -> Self {
        Self {
            instances: Vec::new(),
            allow_cpu_access,
        }
    }

    /// Size the buffer to `count` zeroed instances.
    pub fn allocate(&mut self, count: usize) {
        self.instances.clear();
        self.instances.resize(count, InstanceData::zeroed());
    }

    pub fn set_instance(&mut self, index: usize, transform: Mat4) {
        self.instances[index] = InstanceData::new(transform);
    }

    pub fn swap_instances(&mut self, a: usize, b: usize) {
        self.instances.swap(a, b);
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn allows_cpu_access(&self) -> bool {
        self.allow_cpu_access
    }

    pub fn instances(&self) -> &[InstanceData] {
        &self.instances
    }

    /// Raw bytes for upload
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.instances)
    }
}
