//! Landscape tiles as seen by the grass system.
//!
//! The host owns tiles through `Shared<GrassTile>`; the scheduler only keeps
//! weak handles. A tile's density grid is published once per render and can
//! be discarded and re-rendered when its source material changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::types::{Affine3A, Quat, Vec2, Vec3};
use crate::core::Shared;
use crate::grass::density::DensitySampleGrid;
use crate::grass::types::GrassType;
use crate::math::Aabb;

/// One terrain tile with its own density data and placement
#[derive(Debug)]
pub struct GrassTile {
    pub name: String,
    /// World position of the tile's local origin (its min X/Z corner)
    pub location: Vec3,
    pub rotation: Quat,
    /// Spacing of grid vertices along X/Z and the height scale along Y
    pub scale: Vec3,
    /// Tile edge length in grid quads
    pub size_quads: u32,
    /// Local bounds including terrain height range
    pub local_bounds: Aabb,
    density: RwLock<Option<Arc<DensitySampleGrid>>>,
    material_state: AtomicU64,
}

impl GrassTile {
    /// Create a flat tile; call [`GrassTile::with_height_range`] once heights are known.
    pub fn new(name: impl Into<String>, location: Vec3, scale: Vec3, size_quads: u32) -> Self {
        let extent = Vec3::new(size_quads as f32 * scale.x, 0.0, size_quads as f32 * scale.z);
        Self {
            name: name.into(),
            location,
            rotation: Quat::IDENTITY,
            scale,
            size_quads,
            local_bounds: Aabb::new(Vec3::ZERO, extent),
            density: RwLock::new(None),
            material_state: AtomicU64::new(0),
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set the local Y range covered by the terrain surface.
    pub fn with_height_range(mut self, min_y: f32, max_y: f32) -> Self {
        self.local_bounds.min.y = min_y;
        self.local_bounds.max.y = max_y;
        self
    }

    /// Vertices per grid edge
    pub fn stride(&self) -> usize {
        self.size_quads as usize + 1
    }

    /// Local X/Z extent of the tile
    pub fn extent(&self) -> Vec2 {
        Vec2::new(self.local_bounds.size().x, self.local_bounds.size().z)
    }

    /// Rigid local-to-world transform (scale stays in local space)
    pub fn transform(&self) -> Affine3A {
        Affine3A::from_rotation_translation(self.rotation, self.location)
    }

    pub fn world_bounds(&self) -> Aabb {
        self.local_bounds.transformed(&self.transform())
    }

    /// Currently published density grid, if any
    pub fn density(&self) -> Option<Arc<DensitySampleGrid>> {
        self.density.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether `grid` is laid out for this tile's vertex grid.
    pub fn fits_density(&self, grid: &DensitySampleGrid) -> bool {
        grid.stride() == self.stride()
    }

    pub fn has_density(&self) -> bool {
        self.density.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Publish a freshly rendered grid, replacing any previous one.
    pub fn set_density(&self, grid: DensitySampleGrid) -> Arc<DensitySampleGrid> {
        let grid = Arc::new(grid);
        *self.density.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&grid));
        grid
    }

    /// Publish a grid loaded from storage, optionally dropping layers of
    /// density-scaled grass types first.
    pub fn publish_density(&self, mut grid: DensitySampleGrid, grass_types: &[Shared<GrassType>], discard_scalable: bool) {
        if discard_scalable {
            grid.discard_scalable_layers(grass_types.iter().map(|t| (t.id(), &**t)));
        }
        if grid.has_data() {
            self.set_density(grid);
        } else {
            self.discard_density();
        }
    }

    /// Drop density data so it is regenerated on demand.
    pub fn discard_density(&self) {
        *self.density.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn material_state(&self) -> u64 {
        self.material_state.load(Ordering::Acquire)
    }

    /// Mark the source material as changed; existing density becomes outdated.
    pub fn bump_material_state(&self) -> u64 {
        self.material_state.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Published density was rendered from an older material state.
    pub fn is_density_outdated(&self) -> bool {
        self.density()
            .is_some_and(|grid| grid.source_state() != self.material_state())
    }
}

/// Renders density grids for tiles that have none.
///
/// Implementations must produce a grid with `stride() == tile.stride()`
/// stamped with `tile.material_state()`.
pub trait DensityMapRenderer: Send {
    fn can_render(&self, _tile: &GrassTile) -> bool {
        true
    }

    fn render(&mut self, tile: &GrassTile, grass_types: &[Shared<GrassType>]) -> Option<DensitySampleGrid>;
}

/// Everything the scheduler walks each update
#[derive(Clone, Debug, Default)]
pub struct GrassLandscape {
    pub tiles: Vec<Shared<GrassTile>>,
    pub grass_types: Vec<Shared<GrassType>>,
}

impl GrassLandscape {
    pub fn new() -> Self {
        Self::default()
    }
}
