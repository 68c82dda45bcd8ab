//! Grass types and their varieties.
//!
//! A grass type is a named scatter category (one density layer per tile);
//! each variety within it is one mesh with its own density, scale ranges and
//! cull distances.

use serde::{Deserialize, Serialize};

use crate::core::types::Vec3;
use crate::math::Aabb;

/// Opaque mesh reference understood by the instance sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshId(pub u32);

/// How random scale is drawn for each instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrassScaling {
    /// One random value drives X, Y and Z from `scale_x`.
    #[default]
    Uniform,
    /// X, Y and Z are drawn independently.
    Free,
    /// Horizontal X and Z share one draw from `scale_x`; vertical Y draws from `scale_y`.
    LockHorizontal,
}

/// Closed interval sampled by interpolation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloatInterval {
    pub min: f32,
    pub max: f32,
}

impl FloatInterval {
    pub const ONE: FloatInterval = FloatInterval { min: 1.0, max: 1.0 };

    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn size(&self) -> f32 {
        self.max - self.min
    }

    pub fn interpolate(&self, t: f32) -> f32 {
        self.min + self.size() * t
    }
}

impl Default for FloatInterval {
    fn default() -> Self {
        Self::ONE
    }
}

/// Instance density is expressed per patch of this many square meters (10 m x 10 m).
pub const DENSITY_AREA: f32 = 100.0;

/// One mesh variety of a grass type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrassVariety {
    pub mesh: Option<MeshId>,
    /// Local bounds of the mesh, used for cluster bounds.
    pub mesh_bounds: Aabb,
    /// Instances per 10 m x 10 m.
    pub density: f32,
    /// Use a jittered grid instead of the Halton sequence.
    pub use_grid: bool,
    /// Fraction of a grid cell an instance may move (0..1).
    pub placement_jitter: f32,
    pub start_cull_distance: f32,
    pub end_cull_distance: f32,
    pub min_lod: i32,
    pub scaling: GrassScaling,
    pub scale_x: FloatInterval,
    pub scale_y: FloatInterval,
    pub scale_z: FloatInterval,
    pub random_rotation: bool,
    pub align_to_surface: bool,
    pub cast_dynamic_shadow: bool,
    pub receives_decals: bool,
    /// Ask the sink to keep a CPU copy of the instance buffer.
    pub keep_instance_buffer_cpu_copy: bool,
}

impl Default for GrassVariety {
    fn default() -> Self {
        Self {
            mesh: None,
            mesh_bounds: Aabb::new(Vec3::new(-0.5, 0.0, -0.5), Vec3::new(0.5, 1.0, 0.5)),
            density: 400.0,
            use_grid: true,
            placement_jitter: 1.0,
            start_cull_distance: 100.0,
            end_cull_distance: 150.0,
            min_lod: -1,
            scaling: GrassScaling::Uniform,
            scale_x: FloatInterval::ONE,
            scale_y: FloatInterval::ONE,
            scale_z: FloatInterval::ONE,
            random_rotation: true,
            align_to_surface: true,
            cast_dynamic_shadow: false,
            receives_decals: true,
            keep_instance_buffer_cpu_copy: false,
        }
    }
}

impl GrassVariety {
    /// A variety only produces batches with a mesh, some density and a
    /// positive end cull distance.
    pub fn is_renderable(&self) -> bool {
        self.mesh.is_some() && self.density > 0.0 && self.end_cull_distance > 0.0
    }

    /// Scale ranges that are not a single value need a random draw.
    pub fn has_random_scale(&self) -> bool {
        match self.scaling {
            GrassScaling::Uniform => self.scale_x.size() > 0.0,
            GrassScaling::Free => {
                self.scale_x.size() > 0.0 || self.scale_y.size() > 0.0 || self.scale_z.size() > 0.0
            }
            GrassScaling::LockHorizontal => self.scale_x.size() > 0.0 || self.scale_y.size() > 0.0,
        }
    }
}

/// A named grass category; its density layer is looked up by the type's identity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrassType {
    pub name: String,
    pub varieties: Vec<GrassVariety>,
    /// Whether `GrassConfig::density_scale` applies to this type.
    pub enable_density_scaling: bool,
}

impl GrassType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            varieties: Vec::new(),
            enable_density_scaling: false,
        }
    }

    pub fn with_variety(mut self, variety: GrassVariety) -> Self {
        self.varieties.push(variety);
        self
    }

    pub fn with_density_scaling(mut self, enabled: bool) -> Self {
        self.enable_density_scaling = enabled;
        self
    }
}
