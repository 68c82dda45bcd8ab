//! Candidate point generation and acceptance.
//!
//! A [`PlacementArea`] describes the rectangle (in tile-local X/Z) a batch
//! covers and how many candidates per axis it gets. The [`PlacementSampler`]
//! walks the candidates with either a jittered grid or the Halton sequence,
//! keeps those whose bilinear density weight beats a random threshold and
//! that fall outside every exclusion box, then assigns scale, yaw and
//! optional surface alignment.

use std::f32::consts::TAU;

use crate::core::types::{Mat3, Mat4, Vec2, Vec3};
use crate::grass::density::DensityAccess;
use crate::grass::random::{halton, RandomStream};
use crate::grass::types::{FloatInterval, GrassScaling, GrassVariety, DENSITY_AREA};
use crate::math::Aabb;

/// Upper bound on subsections per axis.
pub const MAX_SUBSECTIONS: u32 = 16;

/// Candidate pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// Regular grid with per-cell jitter
    GridJitter,
    /// Halton (2, 3) sequence continuing from `first_index`
    Halton { first_index: u32 },
}

/// Rectangle of a tile covered by one batch
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlacementArea {
    /// Local X/Z of the rectangle's min corner
    pub origin: Vec2,
    pub extent: Vec2,
    /// Candidates per axis
    pub sqrt_instances: u32,
}

impl PlacementArea {
    /// Whole-tile area for `density` instances per 10 m x 10 m.
    pub fn for_tile(extent: Vec2, density: f32) -> Self {
        let count = (extent.x * extent.y * density / DENSITY_AREA).abs();
        Self {
            origin: Vec2::ZERO,
            extent,
            sqrt_instances: count.sqrt().ceil() as u32,
        }
    }

    /// Zero candidates means there is nothing worth building.
    pub fn is_valid(&self) -> bool {
        self.sqrt_instances > 0
    }

    pub fn max_instances(&self) -> u32 {
        self.sqrt_instances * self.sqrt_instances
    }

    /// Subsections per axis so that each stays under `max_instances_per_batch`.
    pub fn subsection_count(&self, max_instances_per_batch: u32) -> u32 {
        if !self.is_valid() {
            return 1;
        }
        let per_axis = (max_instances_per_batch.max(1) as f32).sqrt();
        ((self.sqrt_instances as f32 / per_axis).ceil() as u32).clamp(1, MAX_SUBSECTIONS)
    }

    /// One cell of a `count` x `count` split.
    pub fn subsection(&self, count: u32, x: u32, z: u32) -> Self {
        let count = count.max(1);
        let extent = self.extent / count as f32;
        Self {
            origin: self.origin + extent * Vec2::new(x as f32, z as f32),
            extent,
            sqrt_instances: self.sqrt_instances / count,
        }
    }
}

/// Per-variety placement options
#[derive(Clone, Debug, PartialEq)]
pub struct PlacementSettings {
    pub scaling: GrassScaling,
    pub scale_x: FloatInterval,
    pub scale_y: FloatInterval,
    pub scale_z: FloatInterval,
    pub random_scale: bool,
    pub random_rotation: bool,
    pub align_to_surface: bool,
    pub placement_jitter: f32,
}

impl PlacementSettings {
    pub fn from_variety(variety: &GrassVariety) -> Self {
        Self {
            scaling: variety.scaling,
            scale_x: variety.scale_x,
            scale_y: variety.scale_y,
            scale_z: variety.scale_z,
            random_scale: variety.has_random_scale(),
            random_rotation: variety.random_rotation,
            align_to_surface: variety.align_to_surface,
            placement_jitter: variety.placement_jitter,
        }
    }

    fn scale(&self, random: &mut RandomStream) -> Vec3 {
        if !self.random_scale {
            return match self.scaling {
                GrassScaling::Uniform => Vec3::splat(self.scale_x.min),
                GrassScaling::Free => Vec3::new(self.scale_x.min, self.scale_y.min, self.scale_z.min),
                GrassScaling::LockHorizontal => Vec3::new(self.scale_x.min, self.scale_y.min, self.scale_x.min),
            };
        }
        match self.scaling {
            GrassScaling::Uniform => Vec3::splat(self.scale_x.interpolate(random.fraction())),
            GrassScaling::Free => {
                let x = self.scale_x.interpolate(random.fraction());
                let y = self.scale_y.interpolate(random.fraction());
                let z = self.scale_z.interpolate(random.fraction());
                Vec3::new(x, y, z)
            }
            GrassScaling::LockHorizontal => {
                let horizontal = self.scale_x.interpolate(random.fraction());
                let vertical = self.scale_y.interpolate(random.fraction());
                Vec3::new(horizontal, vertical, horizontal)
            }
        }
    }
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self::from_variety(&GrassVariety::default())
    }
}

/// One accepted instance in tile-local space
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub location: Vec3,
    pub scale: Vec3,
    /// Rotation about the (aligned) up axis in radians
    pub yaw: f32,
    /// Basis taking +Y to the surface normal
    pub alignment: Option<Mat3>,
}

impl Placement {
    pub fn transform(&self) -> Mat4 {
        let align = self.alignment.map_or(Mat4::IDENTITY, Mat4::from_mat3);
        Mat4::from_translation(self.location)
            * align
            * Mat4::from_rotation_y(self.yaw)
            * Mat4::from_scale(self.scale)
    }
}

/// Generates placements for one batch
pub struct PlacementSampler<'a> {
    access: DensityAccess<'a>,
    /// Tile vertex spacing (X/Z) and height scale (Y)
    tile_scale: Vec3,
    area: PlacementArea,
    settings: &'a PlacementSettings,
    strategy: PlacementStrategy,
    /// Exclusion boxes in tile-local space
    excluded: &'a [Aabb],
    random: RandomStream,
}

impl<'a> PlacementSampler<'a> {
    /// # Returns
    /// `None` when the area has no candidates ("no valid data")
    pub fn new(
        access: DensityAccess<'a>,
        tile_scale: Vec3,
        area: PlacementArea,
        settings: &'a PlacementSettings,
        strategy: PlacementStrategy,
        excluded: &'a [Aabb],
        seed: u32,
    ) -> Option<Self> {
        if !area.is_valid() {
            return None;
        }
        Some(Self {
            access,
            tile_scale,
            area,
            settings,
            strategy,
            excluded,
            random: RandomStream::new(seed),
        })
    }

    pub fn area(&self) -> &PlacementArea {
        &self.area
    }

    /// Run the sampler to completion.
    pub fn sample(mut self) -> Vec<Placement> {
        let mut placements = match self.strategy {
            PlacementStrategy::GridJitter => self.sample_grid(),
            PlacementStrategy::Halton { first_index } => self.sample_halton(first_index),
        };
        for placement in &mut placements {
            placement.scale = self.settings.scale(&mut self.random);
            if self.settings.random_rotation {
                placement.yaw = self.random.fraction() * TAU;
            }
        }
        placements
    }

    fn sample_grid(&mut self) -> Vec<Placement> {
        let sqrt = self.area.sqrt_instances as usize;
        let div = 1.0 / sqrt as f32;
        let extent = self.area.extent;
        let max_jitter = extent * (self.settings.placement_jitter.clamp(0.0, 0.99) * div * 0.5);
        let origin = self.area.origin + extent * (div * 0.5);
        let align = self.settings.align_to_surface;

        // every candidate with height, for neighbour normals
        let mut grid_positions: Vec<Vec3> = Vec::with_capacity(if align { sqrt * sqrt } else { 0 });
        let mut kept: Vec<(usize, Vec3)> = Vec::new();

        for x in 0..sqrt {
            for z in 0..sqrt {
                let jitter = Vec2::new(
                    self.random.fraction() * 2.0 - 1.0,
                    self.random.fraction() * 2.0 - 1.0,
                ) * max_jitter;
                let local = origin + Vec2::new(x as f32, z as f32) * div * extent + jitter;
                let (weight, position) = self.sample_at(local);
                if align {
                    grid_positions.push(position);
                }
                if weight > 0.0 && weight >= self.random.fraction() && !self.is_excluded(position) {
                    kept.push((x * sqrt + z, position));
                }
            }
        }

        kept.into_iter()
            .map(|(index, location)| {
                let alignment = if align {
                    let (x, z) = (index / sqrt, index % sqrt);
                    let x_pos = grid_positions[(x + 1).min(sqrt - 1) * sqrt + z];
                    let x_neg = grid_positions[x.saturating_sub(1) * sqrt + z];
                    let z_pos = grid_positions[x * sqrt + (z + 1).min(sqrt - 1)];
                    let z_neg = grid_positions[x * sqrt + z.saturating_sub(1)];
                    surface_alignment(x_pos - x_neg, z_pos - z_neg)
                } else {
                    None
                };
                Placement { location, scale: Vec3::ONE, yaw: 0.0, alignment }
            })
            .collect()
    }

    fn sample_halton(&mut self, first_index: u32) -> Vec<Placement> {
        let count = self.area.max_instances();
        let extent = self.area.extent;
        let step = extent / self.area.sqrt_instances as f32;
        let mut placements = Vec::new();

        for i in 0..count {
            let index = first_index.wrapping_add(i);
            let h = Vec2::new(halton(index, 2), halton(index, 3));
            let local = self.area.origin + h * extent;
            let (weight, position) = self.sample_at(local);
            if !(weight > 0.0 && weight >= self.random.fraction() && !self.is_excluded(position)) {
                continue;
            }

            let alignment = if self.settings.align_to_surface {
                let min = self.area.origin;
                let max = self.area.origin + extent;
                // step towards the interior so the neighbour stays in the area
                let dx = if h.x < 0.5 { step.x } else { -step.x };
                let dz = if h.y < 0.5 { step.y } else { -step.y };
                let x_neighbour = Vec2::new((local.x + dx).clamp(min.x, max.x), local.y);
                let z_neighbour = Vec2::new(local.x, (local.y + dz).clamp(min.y, max.y));
                let along_x = (self.position_at(x_neighbour) - position) * dx.signum();
                let along_z = (self.position_at(z_neighbour) - position) * dz.signum();
                surface_alignment(along_x, along_z)
            } else {
                None
            };
            placements.push(Placement { location: position, scale: Vec3::ONE, yaw: 0.0, alignment });
        }
        placements
    }

    /// Weight and local position with height at tile-local X/Z
    fn sample_at(&self, local: Vec2) -> (f32, Vec3) {
        let (weight, height) = self.access.sample(local.x / self.tile_scale.x, local.y / self.tile_scale.z);
        (weight, Vec3::new(local.x, height * self.tile_scale.y, local.y))
    }

    fn position_at(&self, local: Vec2) -> Vec3 {
        let height = self.access.sample_height(local.x / self.tile_scale.x, local.y / self.tile_scale.z);
        Vec3::new(local.x, height * self.tile_scale.y, local.y)
    }

    fn is_excluded(&self, position: Vec3) -> bool {
        self.excluded.iter().any(|b| b.contains_point_strict(position))
    }
}

/// Basis whose Y axis is the upward normal of the plane spanned by the two
/// tangents. `None` for degenerate tangents.
fn surface_alignment(along_x: Vec3, along_z: Vec3) -> Option<Mat3> {
    let mut normal = along_z.cross(along_x);
    if normal.y < 0.0 {
        normal = -normal;
    }
    let normal = normal.try_normalize()?;
    let x_axis = normal.cross(Vec3::Z).try_normalize()?;
    let z_axis = x_axis.cross(normal);
    Some(Mat3::from_cols(x_axis, normal, z_axis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Shared;
    use crate::grass::density::{encode_height, DensitySampleGrid, HEIGHT_MID};

    fn flat_grid(stride: usize, weight: u8) -> (DensitySampleGrid, crate::core::HandleId) {
        let id = Shared::new(()).id();
        let grid = DensitySampleGrid::new(stride, vec![HEIGHT_MID; stride * stride], 0)
            .with_weights(id, vec![weight; stride * stride]);
        (grid, id)
    }

    fn plain_settings() -> PlacementSettings {
        PlacementSettings {
            random_rotation: false,
            align_to_surface: false,
            placement_jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_area_instance_count() {
        // 20 x 20 m at 100 per 100 m² = 400 instances = 20 per axis
        let area = PlacementArea::for_tile(Vec2::splat(20.0), 100.0);
        assert_eq!(area.sqrt_instances, 20);
        assert!(!PlacementArea::for_tile(Vec2::splat(20.0), 0.0).is_valid());
    }

    #[test]
    fn test_subsections() {
        let area = PlacementArea { origin: Vec2::ZERO, extent: Vec2::splat(64.0), sqrt_instances: 128 };
        // 1024 per batch = 32 per axis -> 4 subsections
        assert_eq!(area.subsection_count(1024), 4);
        assert_eq!(area.subsection_count(1 << 20), 1);
        let sub = area.subsection(4, 1, 3);
        assert_eq!(sub.extent, Vec2::splat(16.0));
        assert_eq!(sub.origin, Vec2::new(16.0, 48.0));
        assert_eq!(sub.sqrt_instances, 32);

        let huge = PlacementArea { sqrt_instances: 100_000, ..area };
        assert_eq!(huge.subsection_count(1024), MAX_SUBSECTIONS);
    }

    #[test]
    fn test_zero_area_has_no_sampler() {
        let (grid, id) = flat_grid(3, 255);
        let settings = plain_settings();
        let area = PlacementArea::for_tile(Vec2::splat(2.0), 0.0);
        assert!(PlacementSampler::new(grid.access(id).unwrap(), Vec3::ONE, area, &settings,
            PlacementStrategy::GridJitter, &[], 1).is_none());
    }

    #[test]
    fn test_full_weight_accepts_every_grid_point() {
        let (grid, id) = flat_grid(5, 255);
        let settings = plain_settings();
        let area = PlacementArea::for_tile(Vec2::splat(4.0), 100.0);
        let placements = PlacementSampler::new(grid.access(id).unwrap(), Vec3::ONE, area, &settings,
            PlacementStrategy::GridJitter, &[], 9).unwrap().sample();
        assert_eq!(placements.len(), 16);
        assert_eq!(placements[0].location, Vec3::new(0.5, 0.0, 0.5));
        assert_eq!(placements[1].location, Vec3::new(0.5, 0.0, 1.5));
    }

    #[test]
    fn test_single_hot_cell_stays_local() {
        // stride 5 grid, only the center vertex has weight
        let id = Shared::new(()).id();
        let mut weights = vec![0u8; 25];
        weights[2 + 2 * 5] = 255;
        let grid = DensitySampleGrid::new(5, vec![HEIGHT_MID; 25], 0).with_weights(id, weights);
        let settings = PlacementSettings { placement_jitter: 1.0, ..plain_settings() };
        let area = PlacementArea::for_tile(Vec2::splat(4.0), 100.0);
        assert_eq!(area.sqrt_instances, 4);

        let mut total = 0;
        for seed in 1..200 {
            let placements = PlacementSampler::new(grid.access(id).unwrap(), Vec3::ONE, area, &settings,
                PlacementStrategy::GridJitter, &[], seed).unwrap().sample();
            for p in &placements {
                // nonzero weight only exists within one quad of the hot vertex
                assert!(p.location.x > 1.0 && p.location.x < 3.0, "{:?}", p.location);
                assert!(p.location.z > 1.0 && p.location.z < 3.0, "{:?}", p.location);
            }
            assert!(placements.len() <= 4);
            total += placements.len();
        }
        assert!(total > 0);
    }

    #[test]
    fn test_exclusion_rejects_points() {
        let (grid, id) = flat_grid(5, 255);
        let settings = plain_settings();
        let area = PlacementArea::for_tile(Vec2::splat(4.0), 100.0);
        let excluded = [Aabb::new(Vec3::new(0.0, -1.0, 0.0), Vec3::new(2.0, 1.0, 4.0))];
        let placements = PlacementSampler::new(grid.access(id).unwrap(), Vec3::ONE, area, &settings,
            PlacementStrategy::GridJitter, &excluded, 3).unwrap().sample();
        assert_eq!(placements.len(), 8);
        assert!(placements.iter().all(|p| p.location.x > 2.0));
    }

    #[test]
    fn test_exclusion_boundary_keeps_points() {
        let (grid, id) = flat_grid(9, 255);
        let settings = plain_settings();
        let area = PlacementArea::for_tile(Vec2::splat(8.0), 100.0);
        // the first Halton point lands exactly on x = 4
        let excluded = [Aabb::new(Vec3::splat(-1.0), Vec3::new(4.0, 1.0, 9.0))];
        let placements = PlacementSampler::new(grid.access(id).unwrap(), Vec3::ONE, area, &settings,
            PlacementStrategy::Halton { first_index: 1 }, &excluded, 5).unwrap().sample();
        assert_eq!(placements[0].location, Vec3::new(4.0, 0.0, 8.0 / 3.0));
        assert!(placements.iter().all(|p| p.location.x >= 4.0));
    }

    #[test]
    fn test_halton_continues_sequence() {
        let (grid, id) = flat_grid(9, 255);
        let settings = plain_settings();
        let full = PlacementArea::for_tile(Vec2::splat(8.0), 100.0);
        let placements = PlacementSampler::new(grid.access(id).unwrap(), Vec3::ONE, full, &settings,
            PlacementStrategy::Halton { first_index: 1 }, &[], 5).unwrap().sample();
        assert_eq!(placements.len(), full.max_instances() as usize);
        assert_eq!(placements[0].location, Vec3::new(4.0, 0.0, 8.0 / 3.0));
        for p in &placements {
            assert!(p.location.x >= 0.0 && p.location.x < 8.0);
            assert!(p.location.z >= 0.0 && p.location.z < 8.0);
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let (grid, id) = flat_grid(5, 128);
        let settings = PlacementSettings { placement_jitter: 0.5, random_rotation: true, ..plain_settings() };
        let area = PlacementArea::for_tile(Vec2::splat(4.0), 400.0);
        let run = |seed| PlacementSampler::new(grid.access(id).unwrap(), Vec3::ONE, area, &settings,
            PlacementStrategy::GridJitter, &[], seed).unwrap().sample();
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }

    #[test]
    fn test_random_scale_modes() {
        let mut random = RandomStream::new(1);
        let locked = PlacementSettings {
            scaling: GrassScaling::LockHorizontal,
            scale_x: FloatInterval::new(1.0, 2.0),
            scale_y: FloatInterval::new(5.0, 6.0),
            random_scale: true,
            ..plain_settings()
        };
        for _ in 0..32 {
            let s = locked.scale(&mut random);
            assert_eq!(s.x, s.z);
            assert!((1.0..=2.0).contains(&s.x));
            assert!((5.0..=6.0).contains(&s.y));
        }
        let uniform = PlacementSettings { scaling: GrassScaling::Uniform, ..locked };
        let s = uniform.scale(&mut random);
        assert!(s.x == s.y && s.y == s.z);
    }

    #[test]
    fn test_alignment_follows_slope() {
        // height rises along X by one unit per vertex
        let id = Shared::new(()).id();
        let stride = 5;
        let heights = (0..stride * stride).map(|i| encode_height((i % stride) as f32)).collect();
        let grid = DensitySampleGrid::new(stride, heights, 0).with_weights(id, vec![255; stride * stride]);
        let settings = PlacementSettings { align_to_surface: true, ..plain_settings() };
        let area = PlacementArea::for_tile(Vec2::splat(4.0), 100.0);

        for strategy in [PlacementStrategy::GridJitter, PlacementStrategy::Halton { first_index: 1 }] {
            let placements = PlacementSampler::new(grid.access(id).unwrap(), Vec3::ONE, area, &settings,
                strategy, &[], 2).unwrap().sample();
            let expected = Vec3::new(-1.0, 1.0, 0.0).normalize();
            for p in &placements {
                let up = p.alignment.expect("sloped surface yields a basis").y_axis;
                assert!(up.abs_diff_eq(expected, 1e-3), "{:?} vs {:?}", up, expected);
            }
        }
    }

    #[test]
    fn test_flat_alignment_is_identity() {
        let basis = surface_alignment(Vec3::X, Vec3::Z).unwrap();
        assert!(basis.abs_diff_eq(Mat3::IDENTITY, 1e-6));
        assert!(surface_alignment(Vec3::ZERO, Vec3::Z).is_none());
    }

    #[test]
    fn test_placement_transform() {
        let p = Placement {
            location: Vec3::new(1.0, 2.0, 3.0),
            scale: Vec3::splat(2.0),
            yaw: 0.0,
            alignment: None,
        };
        let m = p.transform();
        assert_eq!(m.transform_point3(Vec3::ZERO), p.location);
        assert_eq!(m.transform_point3(Vec3::Y), Vec3::new(1.0, 4.0, 3.0));
    }
}
