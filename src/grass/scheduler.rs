//! Per-frame grass scheduling.
//!
//! Each update walks every tile, grass type, variety and subsection, decides
//! which batches must exist for the given cameras, starts background builds
//! for missing or exclusion-invalidated ones, ages out unused batches and
//! applies at most one finished build. A forced-sync update removes every
//! throttle and waits for all in-flight builds before returning.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::types::Vec3;
use crate::core::{Clock, HandleId, OwnerHandle, Result, Shared, SystemClock};
use crate::grass::builder::{BatchBuildParams, BuiltBatch, InstanceBatchBuilder};
use crate::grass::cache::{BatchCache, BatchKey, BatchRecord, RetentionPolicy};
use crate::grass::config::GrassConfig;
use crate::grass::density::DensitySampleGrid;
use crate::grass::exclusion::{ExclusionRegistry, ExclusionSnapshot};
use crate::grass::random::batch_seed;
use crate::grass::sampler::{PlacementArea, PlacementSettings, PlacementStrategy};
use crate::grass::sink::{BatchDesc, BatchId, InstanceSink};
use crate::grass::task::{BuildPool, BuildTask};
use crate::grass::tile::{DensityMapRenderer, GrassLandscape, GrassTile};
use crate::grass::types::{GrassType, GrassVariety};
use crate::math::Aabb;

/// What one update did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GrassStats {
    /// False when the tick interval skipped this frame
    pub updated: bool,
    pub records: usize,
    pub pending_tasks: usize,
    pub owned_batches: usize,
    pub batches_created: u32,
    pub batches_destroyed: u32,
    pub tasks_completed: u32,
    pub instances_applied: usize,
    pub records_evicted: usize,
    pub density_maps_rendered: u32,
}

/// Where one key sits this update
struct KeyPlan<'a> {
    tile: &'a GrassTile,
    grass_type: &'a GrassType,
    grass_type_id: HandleId,
    variety: &'a GrassVariety,
    variety_index: usize,
    area: PlacementArea,
    strategy: PlacementStrategy,
    sub_bounds: Aabb,
    distance: f32,
    must_have: f32,
    /// Registry tag `tile_boxes` was computed under
    change_tag: u64,
}

/// Owns every grass batch it creates in `S` and decides, once per update,
/// which ones should exist.
pub struct GrassScheduler<S: InstanceSink> {
    config: GrassConfig,
    exclusions: Arc<ExclusionRegistry>,
    sink: S,
    renderer: Option<Box<dyn DensityMapRenderer>>,
    clock: Arc<dyn Clock>,
    pool: BuildPool,
    cache: BatchCache,
    tasks: Vec<BuildTask>,
    owned_batches: Vec<BatchId>,
    tile_exclusions: HashMap<HandleId, ExclusionSnapshot>,
    frame: u64,
    frame_offset: u64,
}

impl<S: InstanceSink> GrassScheduler<S> {
    /// Create a scheduler feeding `sink`.
    ///
    /// # Arguments
    /// * `config` - Initial tunables; can be replaced with `set_config`
    /// * `exclusions` - Registry shared with whoever places exclusion boxes
    /// * `sink` - Receiver of built batches
    pub fn new(config: GrassConfig, exclusions: Arc<ExclusionRegistry>, sink: S) -> Result<Self> {
        if let Err(e) = config.validate() {
            log::warn!("Grass config: {}", e);
        }
        // concurrency is throttled per tick, so the pool only caps threads
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(config.max_async_tasks as usize);
        Ok(Self {
            config,
            exclusions,
            sink,
            renderer: None,
            clock: Arc::new(SystemClock::new()),
            pool: BuildPool::new(threads)?,
            cache: BatchCache::new(),
            tasks: Vec::new(),
            owned_batches: Vec::new(),
            tile_exclusions: HashMap::new(),
            frame: 0,
            frame_offset: 0,
        })
    }

    /// Use `clock` for retention timing instead of wall time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Render density for tiles that have none.
    ///
    /// # Arguments
    /// * `renderer` - Called on demand and, with `prerender_density_maps`, ahead of need
    pub fn with_density_renderer(mut self, renderer: Box<dyn DensityMapRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Spread updates of several schedulers over different frames.
    pub fn with_frame_offset(mut self, offset: u64) -> Self {
        self.frame_offset = offset;
        self
    }

    pub fn config(&self) -> &GrassConfig {
        &self.config
    }

    /// Replace the tunables. Changing density or cull distance scale
    /// flushes every batch so the new values take effect.
    pub fn set_config(&mut self, config: GrassConfig) {
        if let Err(e) = config.validate() {
            log::warn!("Grass config: {}", e);
        }
        let rescaled = config.density_scale != self.config.density_scale
            || config.cull_distance_scale != self.config.cull_distance_scale;
        self.config = config;
        if rescaled {
            log::info!("Grass density/cull scale changed, flushing all batches");
            self.flush_batches();
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Records for every key currently kept
    pub fn cache(&self) -> &BatchCache {
        &self.cache
    }

    pub fn exclusions(&self) -> &Arc<ExclusionRegistry> {
        &self.exclusions
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Builds submitted and not yet applied
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Publish a density grid the host loaded from storage. With
    /// `discard_data_on_load` the layers of density-scaled grass types are
    /// dropped first so they get re-rendered at the current scale.
    ///
    /// A grid whose stride does not match the tile is rejected and the tile
    /// keeps whatever it had.
    pub fn publish_density(&self, tile: &GrassTile, grid: DensitySampleGrid, grass_types: &[Shared<GrassType>]) {
        if !tile.fits_density(&grid) {
            log::warn!(
                "Rejected grass density for tile '{}': stride {}, expected {}",
                tile.name, grid.stride(), tile.stride()
            );
            return;
        }
        tile.publish_density(grid, grass_types, self.config.discard_data_on_load);
        if !tile.has_density() {
            log::debug!("Loaded grass density for tile '{}' had nothing left to keep", tile.name);
        }
    }

    /// Suppress grass inside `bounds` until `owner` removes it or dies.
    /// Covered batches are rebuilt on a later update.
    pub fn add_exclusion(&self, owner: OwnerHandle, bounds: Aabb) {
        self.exclusions.add(owner, bounds);
    }

    pub fn remove_exclusion(&self, owner: &OwnerHandle) {
        self.exclusions.remove(owner);
    }

    /// Clear every box; affected batches grow back on a later update.
    pub fn remove_all_exclusions(&self) {
        self.exclusions.remove_all();
    }

    /// Per-frame entry point: advances the frame counter and runs an update
    /// on frames selected by the tick interval (always when forced).
    pub fn tick(&mut self, landscape: &GrassLandscape, cameras: &[Vec3], force_sync: bool) -> GrassStats {
        self.frame += 1;
        let interval = self.config.effective_tick_interval() as u64;
        if !force_sync && (self.frame + self.frame_offset) % interval != 0 {
            return GrassStats::default();
        }
        self.update(landscape, cameras, force_sync)
    }

    /// Run one scheduling pass for the current frame.
    pub fn update(&mut self, landscape: &GrassLandscape, cameras: &[Vec3], force_sync: bool) -> GrassStats {
        let frame = self.frame;
        let mut stats = GrassStats { updated: true, ..Default::default() };

        if !self.config.ignore_exclusion_boxes {
            self.exclusions.purge_stale(frame);
        }

        if self.config.enabled {
            self.flush_outdated_density(landscape);
            self.request_batches(landscape, cameras, force_sync, &mut stats);
            if self.config.prerender_density_maps {
                self.prerender_density(landscape, &mut stats);
            }
        }

        self.evict_unused(force_sync, &mut stats);
        self.prune_tile_exclusions(landscape);
        self.drain_tasks(force_sync, &mut stats);

        stats.records = self.cache.len();
        stats.pending_tasks = self.tasks.len();
        stats.owned_batches = self.owned_batches.len();
        if stats.batches_created + stats.batches_destroyed + stats.tasks_completed > 0 {
            log::trace!(
                "Grass frame {}: {} created, {} destroyed, {} builds applied, {} evicted, {} pending",
                frame, stats.batches_created, stats.batches_destroyed,
                stats.tasks_completed, stats.records_evicted, stats.pending_tasks
            );
        }
        stats
    }

    /// Destroy cached batches.
    ///
    /// # Arguments
    /// * `only_for` - Restrict to these tiles (dead tiles are always included); `None` flushes everything
    /// * `discard_density` - Also drop the tiles' density data so it is re-rendered on demand
    pub fn flush(&mut self, landscape: &GrassLandscape, only_for: Option<&[HandleId]>, discard_density: bool) {
        match only_for {
            Some(scope) => {
                let removed = self.cache.remove_where(|r| {
                    !r.key.tile.is_alive() || scope.contains(&r.key.tile.id())
                });
                let count = removed.len();
                for record in removed {
                    for batch in record.batch.into_iter().chain(record.previous_batch) {
                        self.destroy_owned(batch);
                    }
                }
                self.tile_exclusions.retain(|id, _| !scope.contains(id));
                self.prune_tile_exclusions(landscape);
                if discard_density {
                    for tile in landscape.tiles.iter().filter(|t| scope.contains(&t.id())) {
                        tile.discard_density();
                    }
                }
                log::info!("Flushed {} grass records for {} tiles", count, scope.len());
            }
            None => {
                let count = self.cache.len();
                self.flush_batches();
                if discard_density {
                    for tile in &landscape.tiles {
                        tile.discard_density();
                    }
                }
                log::info!("Flushed all grass ({} records)", count);
            }
        }
    }

    fn flush_batches(&mut self) {
        self.cache.clear();
        for batch in self.owned_batches.drain(..) {
            self.sink.destroy_batch(batch);
        }
        self.tile_exclusions.clear();
    }

    fn destroy_owned(&mut self, batch: BatchId) {
        if let Some(pos) = self.owned_batches.iter().position(|&b| b == batch) {
            self.owned_batches.swap_remove(pos);
        }
        self.sink.destroy_batch(batch);
    }

    /// Tiles whose source material changed lose their batches and density.
    fn flush_outdated_density(&mut self, landscape: &GrassLandscape) {
        let outdated: Vec<HandleId> = landscape.tiles
            .iter()
            .filter(|t| t.is_density_outdated())
            .map(|t| t.id())
            .collect();
        if !outdated.is_empty() {
            log::debug!("{} tiles have outdated grass density", outdated.len());
            self.flush(landscape, Some(&outdated), true);
        }
    }

    fn request_batches(&mut self, landscape: &GrassLandscape, cameras: &[Vec3], force_sync: bool, stats: &mut GrassStats) {
        let max_instances = self.config.effective_max_instances_per_batch();
        let mut created_this_tick = 0u32;

        for tile in &landscape.tiles {
            let can_render = self.renderer.as_ref().is_some_and(|r| r.can_render(tile));
            if !tile.has_density() && !can_render {
                continue;
            }
            let world_bounds = tile.world_bounds();
            let tile_distance = min_camera_distance(&world_bounds, cameras);
            let (tile_boxes, change_tag) = if self.config.ignore_exclusion_boxes {
                (Vec::new(), self.exclusions.change_tag())
            } else {
                let snapshot = self.tile_exclusions.entry(tile.id()).or_default();
                let boxes = self.exclusions.current_samples(snapshot, &world_bounds).to_vec();
                (boxes, snapshot.change_tag())
            };

            for grass_type in &landscape.grass_types {
                let num_varieties = grass_type.varieties.len() as u32;
                // Halton indices run on across varieties and subsections
                let mut halton_base: u32 = 1;

                for (variety_index, variety) in grass_type.varieties.iter().enumerate() {
                    if !variety.is_renderable() {
                        continue;
                    }
                    let must_have = self.config.must_have_distance(variety.end_cull_distance);
                    let discard = self.config.discard_distance(variety.end_cull_distance);
                    let use_halton = !variety.use_grid || self.config.use_halton_distribution;
                    if !use_halton && tile_distance > discard {
                        continue;
                    }

                    let density = if grass_type.enable_density_scaling {
                        variety.density * self.config.density_scale
                    } else {
                        variety.density
                    };
                    let full_area = PlacementArea::for_tile(tile.extent(), density);
                    let sqrt_subsections = full_area.subsection_count(max_instances);
                    let sub_budget = full_area.subsection(sqrt_subsections, 0, 0).max_instances();

                    if use_halton && tile_distance > discard {
                        halton_base = halton_base
                            .wrapping_add(sub_budget.wrapping_mul(sqrt_subsections * sqrt_subsections));
                        continue;
                    }

                    for sub_x in 0..sqrt_subsections {
                        for sub_y in 0..sqrt_subsections {
                            let sub_bounds = if sqrt_subsections > 1 {
                                subsection_bounds(&tile.local_bounds, sqrt_subsections, sub_x, sub_y)
                                    .transformed(&tile.transform())
                            } else {
                                world_bounds
                            };
                            let distance = if self.config.cull_subsections && sqrt_subsections > 1 {
                                min_camera_distance(&sub_bounds, cameras)
                            } else {
                                tile_distance
                            };
                            let strategy = if use_halton {
                                halton_base = halton_base.wrapping_add(sub_budget);
                                PlacementStrategy::Halton { first_index: halton_base.wrapping_sub(sub_budget) }
                            } else {
                                PlacementStrategy::GridJitter
                            };
                            if distance > discard {
                                continue;
                            }

                            let key = BatchKey {
                                tile: tile.downgrade(),
                                grass_type: grass_type.downgrade(),
                                sqrt_subsections,
                                max_instances_per_batch: max_instances,
                                subsection_x: sub_x,
                                subsection_y: sub_y,
                                num_varieties,
                                variety_index: variety_index as u32,
                            };
                            let plan = KeyPlan {
                                tile,
                                grass_type,
                                grass_type_id: grass_type.id(),
                                variety,
                                variety_index,
                                area: full_area.subsection(sqrt_subsections, sub_x, sub_y),
                                strategy,
                                sub_bounds,
                                distance,
                                must_have,
                                change_tag,
                            };
                            if self.request_key(key, &plan, &tile_boxes, landscape, cameras, force_sync, created_this_tick, stats) {
                                created_this_tick += 1;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Keep, rebuild or create the batch for one key.
    ///
    /// # Returns
    /// True when a new batch was created
    #[allow(clippy::too_many_arguments)]
    fn request_key(
        &mut self,
        key: BatchKey,
        plan: &KeyPlan<'_>,
        tile_boxes: &[Aabb],
        landscape: &GrassLandscape,
        cameras: &[Vec3],
        force_sync: bool,
        created_this_tick: u32,
        stats: &mut GrassStats,
    ) -> bool {
        let frame = self.frame;
        let now = self.clock.now_seconds();
        // boxes added after the snapshot carry a newer tag and get picked up next update
        let change_tag = plan.change_tag;

        let mut rebuild_boxes: Option<Vec<Aabb>> = None;
        let mut previous = None;
        if let Some(existing) = self.cache.get_mut(&key) {
            if existing.previous_batch.is_none()
                && existing.exclusion_change_tag != change_tag
                && !existing.pending_removal_rebuild
                && !existing.pending
            {
                let boxes = boxes_intersecting(tile_boxes, &plan.sub_bounds);
                if same_boxes(&boxes, &existing.excluded_boxes) {
                    existing.exclusion_change_tag = change_tag;
                } else {
                    previous = existing.batch;
                    rebuild_boxes = Some(boxes);
                }
            }
            existing.touch(frame, now);
            if rebuild_boxes.is_none() {
                return false;
            }
        } else if plan.distance > plan.must_have {
            return false;
        }
        let rebuild = rebuild_boxes.is_some();

        if !rebuild
            && !force_sync
            && (created_this_tick > 0 || self.tasks.len() >= self.config.max_async_tasks.max(1) as usize)
        {
            return false;
        }

        let Some(mesh) = plan.variety.mesh else {
            return false;
        };
        let Some(grid) = self.density_for(plan.tile, &landscape.grass_types, stats) else {
            return false;
        };

        let excluded_world = rebuild_boxes.unwrap_or_else(|| boxes_intersecting(tile_boxes, &plan.sub_bounds));
        let to_local = plan.tile.transform().inverse();
        let seed = batch_seed(
            &plan.grass_type.name,
            &plan.tile.name,
            key.subsection_x,
            key.subsection_y,
            plan.variety_index,
        );
        let builder = InstanceBatchBuilder::new(BatchBuildParams {
            grid,
            grass_type: plan.grass_type_id,
            area: plan.area,
            tile_scale: plan.tile.scale,
            settings: PlacementSettings::from_variety(plan.variety),
            strategy: plan.strategy,
            seed,
            excluded: excluded_world.iter().map(|b| b.transformed(&to_local)).collect(),
            mesh_bounds: plan.variety.mesh_bounds,
            instances_per_leaf: self.config.instances_per_leaf.max(1) as usize,
            keep_cpu_copy: plan.variety.keep_instance_buffer_cpu_copy,
        });
        if !builder.has_valid_data() {
            log::trace!("Skipping grass key on tile '{}': no valid density data", plan.tile.name);
            return false;
        }

        let desc = BatchDesc {
            mesh,
            transform: plan.tile.transform(),
            min_lod: plan.variety.min_lod,
            random_seed: seed,
            cast_dynamic_shadow: plan.variety.cast_dynamic_shadow && !self.config.disable_dynamic_shadows,
            receives_decals: plan.variety.receives_decals,
            keep_cpu_copy: plan.variety.keep_instance_buffer_cpu_copy,
        };
        let batch = self.sink.create_batch(&desc);
        let (cull_start, cull_end) = if cameras.is_empty() || self.config.disable_gpu_cull {
            (0.0, 0.0)
        } else {
            (
                plan.variety.start_cull_distance * self.config.cull_distance_scale,
                plan.variety.end_cull_distance * self.config.cull_distance_scale,
            )
        };
        self.sink.set_cull_distances(batch, cull_start, cull_end);
        self.owned_batches.push(batch);
        stats.batches_created += 1;

        log::debug!(
            "Grass batch {:?} for '{}' on tile '{}' sub ({}, {}) variety {}{}",
            batch, plan.grass_type.name, plan.tile.name,
            key.subsection_x, key.subsection_y, plan.variety_index,
            if rebuild { " (exclusion rebuild)" } else { "" }
        );

        self.tasks.push(self.pool.submit(key.clone(), batch, builder));

        let mut record = BatchRecord::new(key, frame, now);
        record.batch = Some(batch);
        record.previous_batch = previous;
        record.excluded_boxes = excluded_world;
        record.exclusion_change_tag = change_tag;
        record.pending_removal_rebuild = rebuild;
        self.cache.insert(record);
        true
    }

    /// Published density for `tile`, rendering it if a renderer is available.
    /// Grids whose stride does not match the tile are treated as invalid.
    fn density_for(
        &mut self,
        tile: &GrassTile,
        grass_types: &[Shared<GrassType>],
        stats: &mut GrassStats,
    ) -> Option<Arc<DensitySampleGrid>> {
        if let Some(grid) = tile.density() {
            return tile.fits_density(&grid).then_some(grid);
        }
        let renderer = self.renderer.as_mut()?;
        if !renderer.can_render(tile) {
            return None;
        }
        let grid = renderer.render(tile, grass_types)?;
        stats.density_maps_rendered += 1;
        if !tile.fits_density(&grid) {
            log::warn!(
                "Rendered grass density for tile '{}' has stride {}, expected {}",
                tile.name, grid.stride(), tile.stride()
            );
            return None;
        }
        log::debug!("Rendered grass density for tile '{}'", tile.name);
        Some(tile.set_density(grid))
    }

    fn prerender_density(&mut self, landscape: &GrassLandscape, stats: &mut GrassStats) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let mut budget = self.config.max_density_renders_per_tick.saturating_sub(stats.density_maps_rendered);
        for tile in &landscape.tiles {
            if budget == 0 {
                break;
            }
            if tile.has_density() || !renderer.can_render(tile) {
                continue;
            }
            if let Some(grid) = renderer.render(tile, &landscape.grass_types) {
                stats.density_maps_rendered += 1;
                budget -= 1;
                if tile.fits_density(&grid) {
                    tile.set_density(grid);
                    log::debug!("Prerendered grass density for tile '{}'", tile.name);
                } else {
                    log::warn!("Prerendered grass density for tile '{}' has the wrong stride", tile.name);
                }
            }
        }
    }

    /// Forget exclusion snapshots of tiles no longer in the landscape.
    fn prune_tile_exclusions(&mut self, landscape: &GrassLandscape) {
        if self.tile_exclusions.len() > landscape.tiles.len() {
            self.tile_exclusions.retain(|id, _| landscape.tiles.iter().any(|t| t.id() == *id));
        }
    }

    /// Evict stale records, then destroy owned batches nothing references
    /// (one per update unless forced).
    fn evict_unused(&mut self, force_sync: bool, stats: &mut GrassStats) {
        let policy = RetentionPolicy {
            min_frames: self.config.retention_frames(),
            min_seconds: self.config.min_seconds_to_keep as f64,
        };
        let now = self.clock.now_seconds();
        let sink = &self.sink;
        let evicted = self.cache.evict(self.frame, now, policy, |b| sink.is_alive(b));
        stats.records_evicted = evicted.len();

        let still_used = self.cache.still_used();
        let mut i = 0;
        while i < self.owned_batches.len() {
            let batch = self.owned_batches[i];
            if !self.sink.is_alive(batch) {
                self.owned_batches.swap_remove(i);
                continue;
            }
            if still_used.contains(&batch) {
                i += 1;
                continue;
            }
            self.owned_batches.swap_remove(i);
            self.sink.destroy_batch(batch);
            stats.batches_destroyed += 1;
            if !force_sync {
                break;
            }
        }
    }

    /// Apply finished builds: one per update, or all (waiting) when forced.
    fn drain_tasks(&mut self, force_sync: bool, stats: &mut GrassStats) {
        let mut i = 0;
        while i < self.tasks.len() {
            if !force_sync && !self.tasks[i].is_done() {
                i += 1;
                continue;
            }
            let task = self.tasks.swap_remove(i);
            let (key, batch, result) = self.pool.finish(task);
            stats.tasks_completed += 1;
            self.apply_build(key, batch, result, force_sync, stats);
            if !force_sync {
                break;
            }
        }
    }

    fn apply_build(
        &mut self,
        key: BatchKey,
        batch: BatchId,
        result: Result<BuiltBatch>,
        force_sync: bool,
        stats: &mut GrassStats,
    ) {
        let current = self.cache.get(&key).is_some_and(|r| r.batch == Some(batch));
        if !current || !self.sink.is_alive(batch) {
            log::debug!("Discarding grass build for batch {:?}: no longer referenced", batch);
            return;
        }

        let built = match result {
            Ok(built) => built,
            Err(e) => {
                log::warn!("{}", e);
                Default::default()
            }
        };
        let count = built.instance_count();
        if count > 0 {
            log::debug!(
                "Grass batch {:?}: {} instances, {} cluster nodes in {:.2}ms",
                batch, count, built.cluster_tree.len(), built.build_time.as_secs_f64() * 1000.0
            );
            if self.sink.has_instance_data(batch) {
                self.sink.update_from_preallocated(batch, built.instances);
            } else {
                self.sink.init_instance_data(batch, built.instances);
            }
            self.sink.accept_prebuilt_tree(batch, built.cluster_tree, built.occlusion_layers, count);
            if force_sync {
                self.sink.recreate_render_state(batch);
            }
            stats.instances_applied += count;
        } else {
            self.destroy_owned(batch);
            stats.batches_destroyed += 1;
        }

        let frame = self.frame;
        let now = self.clock.now_seconds();
        let previous = self.cache.get_mut(&key).and_then(|record| {
            if count == 0 {
                record.batch = None;
            }
            record.pending = false;
            record.pending_removal_rebuild = false;
            record.touch(frame, now);
            record.previous_batch.take()
        });
        if let Some(previous) = previous {
            self.destroy_owned(previous);
            stats.batches_destroyed += 1;
        }
    }
}

/// Distance from the nearest camera to `bounds`; zero without cameras.
fn min_camera_distance(bounds: &Aabb, cameras: &[Vec3]) -> f32 {
    cameras
        .iter()
        .map(|&c| bounds.distance_squared_to_point(c))
        .reduce(f32::min)
        .map_or(0.0, f32::sqrt)
}

/// Local box of one cell of a `count` x `count` split over X/Z.
fn subsection_bounds(local: &Aabb, count: u32, x: u32, z: u32) -> Aabb {
    let size = local.size();
    let step_x = size.x / count as f32;
    let step_z = size.z / count as f32;
    let min = Vec3::new(local.min.x + step_x * x as f32, local.min.y, local.min.z + step_z * z as f32);
    let max = Vec3::new(min.x + step_x, local.max.y, min.z + step_z);
    Aabb::new(min, max)
}

fn boxes_intersecting(boxes: &[Aabb], query: &Aabb) -> Vec<Aabb> {
    boxes.iter().filter(|b| b.intersects(query)).copied().collect()
}

/// Order-insensitive comparison of exclusion sets
fn same_boxes(a: &[Aabb], b: &[Aabb]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use crate::core::ManualClock;
    use crate::grass::density::HEIGHT_MID;
    use crate::grass::sink::HeadlessSink;
    use crate::grass::types::MeshId;

    const TILE_QUADS: u32 = 8;

    fn full_grid(tile: &GrassTile, grass_types: &[Shared<GrassType>]) -> DensitySampleGrid {
        let n = tile.stride() * tile.stride();
        let mut grid = DensitySampleGrid::new(tile.stride(), vec![HEIGHT_MID; n], tile.material_state());
        for ty in grass_types {
            grid.set_weights(ty.id(), vec![255; n]);
        }
        grid
    }

    fn variety(end_cull: f32) -> GrassVariety {
        GrassVariety {
            mesh: Some(MeshId(1)),
            density: 100.0,
            start_cull_distance: end_cull * 0.5,
            end_cull_distance: end_cull,
            ..Default::default()
        }
    }

    /// Tiles in a row along X, each 8 x 8 m with full density
    fn landscape(tiles: usize, variety: GrassVariety) -> GrassLandscape {
        let grass = Shared::new(GrassType::new("meadow").with_variety(variety));
        let grass_types = vec![grass];
        let tiles = (0..tiles)
            .map(|i| {
                let tile = GrassTile::new(
                    format!("tile_{}", i),
                    Vec3::new(i as f32 * TILE_QUADS as f32, 0.0, 0.0),
                    Vec3::ONE,
                    TILE_QUADS,
                );
                tile.set_density(full_grid(&tile, &grass_types));
                Shared::new(tile)
            })
            .collect();
        GrassLandscape { tiles, grass_types }
    }

    fn scheduler(config: GrassConfig) -> (GrassScheduler<HeadlessSink>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let scheduler = GrassScheduler::new(config, Arc::new(ExclusionRegistry::new()), HeadlessSink::new())
            .unwrap()
            .with_clock(clock.clone());
        (scheduler, clock)
    }

    /// Tick without forcing until `done` holds.
    fn tick_until(
        scheduler: &mut GrassScheduler<HeadlessSink>,
        landscape: &GrassLandscape,
        cameras: &[Vec3],
        mut done: impl FnMut(&GrassScheduler<HeadlessSink>) -> bool,
    ) {
        for _ in 0..2000 {
            scheduler.tick(landscape, cameras, false);
            if done(scheduler) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    fn only_record(scheduler: &GrassScheduler<HeadlessSink>) -> &BatchRecord {
        assert_eq!(scheduler.cache().len(), 1);
        scheduler.cache().iter().next().unwrap()
    }

    const CENTER: Vec3 = Vec3::new(4.0, 0.0, 4.0);

    #[test]
    fn test_force_sync_completes_everything() {
        let land = landscape(3, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        let stats = s.tick(&land, &[CENTER], true);

        assert!(stats.updated);
        assert_eq!(stats.batches_created, 3);
        assert_eq!(stats.pending_tasks, 0);
        assert_eq!(s.pending_tasks(), 0);
        assert_eq!(s.cache().pending_count(), 0);
        assert_eq!(s.sink().live_count(), 3);
        assert_eq!(s.sink().total_instances(), 3 * 64);
        for (_, batch) in s.sink().batches() {
            assert_eq!(batch.cull_start, 25.0);
            assert_eq!(batch.cull_end, 50.0);
            assert_eq!(batch.render_state_refreshes, 1);
        }
    }

    #[test]
    fn test_one_creation_per_tick() {
        let land = landscape(3, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        let stats = s.tick(&land, &[CENTER], false);
        assert_eq!(stats.batches_created, 1);
        assert_eq!(s.cache().len(), 1);

        tick_until(&mut s, &land, &[CENTER], |s| {
            s.pending_tasks() == 0 && s.sink().total_instances() == 3 * 64
        });
        assert_eq!(s.cache().len(), 3);
        assert_eq!(s.sink().created_count(), 3);
    }

    #[test]
    fn test_keys_stay_unique() {
        let land = landscape(2, variety(50.0));
        let (mut s, clock) = scheduler(GrassConfig::default());
        for _ in 0..20 {
            s.tick(&land, &[CENTER], false);
            clock.advance(Duration::from_millis(16));
            let keys: std::collections::HashSet<_> = s.cache().iter().map(|r| r.key.clone()).collect();
            assert_eq!(keys.len(), s.cache().len());
        }
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.cache().len(), 2);
        assert_eq!(s.sink().live_count(), 2);
    }

    #[test]
    fn test_no_cameras_disables_culling() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        s.tick(&land, &[], true);
        let batch = only_record(&s).batch.unwrap();
        let b = s.sink().batch(batch).unwrap();
        assert_eq!((b.cull_start, b.cull_end), (0.0, 0.0));
    }

    #[test]
    fn test_debug_flags_reach_batch_desc() {
        let mut v = variety(50.0);
        v.cast_dynamic_shadow = true;
        let land = landscape(1, v);
        let (mut s, _) = scheduler(GrassConfig {
            disable_gpu_cull: true,
            disable_dynamic_shadows: true,
            ..Default::default()
        });
        s.tick(&land, &[CENTER], true);
        let b = s.sink().batch(only_record(&s).batch.unwrap()).unwrap();
        assert_eq!((b.cull_start, b.cull_end), (0.0, 0.0));
        assert!(!b.desc.cast_dynamic_shadow);
        assert_eq!(b.desc.mesh, MeshId(1));
    }

    #[test]
    fn test_hysteresis_band() {
        // end cull 100: must-have 130, discard 140; tile spans x 0..8
        let land = landscape(1, variety(100.0));
        let in_band = Vec3::new(8.0 + 135.0, 0.0, 4.0);

        let (mut fresh, _) = scheduler(GrassConfig::default());
        fresh.tick(&land, &[in_band], true);
        assert!(fresh.cache().is_empty());

        let (mut s, clock) = scheduler(GrassConfig {
            min_frames_to_keep: 1,
            min_seconds_to_keep: 0.0,
            ..Default::default()
        });
        s.tick(&land, &[CENTER], true);
        let batch = only_record(&s).batch;
        for _ in 0..10 {
            clock.advance(Duration::from_secs(1));
            s.tick(&land, &[in_band], false);
            assert_eq!(only_record(&s).batch, batch);
        }
        assert_eq!(only_record(&s).last_used_frame, s.frame());
    }

    #[test]
    fn test_retention_keeps_touched_records() {
        let land = landscape(1, variety(50.0));
        let (mut s, clock) = scheduler(GrassConfig::default());
        s.tick(&land, &[CENTER], true);
        let batch = only_record(&s).batch;
        for _ in 0..200 {
            clock.advance(Duration::from_secs(1));
            let stats = s.tick(&land, &[CENTER], false);
            assert_eq!(stats.records_evicted, 0);
        }
        assert_eq!(only_record(&s).batch, batch);
        assert_eq!(s.sink().destroyed().len(), 0);
    }

    #[test]
    fn test_eviction_on_next_tick() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig {
            min_frames_to_keep: 1,
            min_seconds_to_keep: 0.0,
            ..Default::default()
        });
        s.tick(&land, &[CENTER], true);
        let batch = only_record(&s).batch.unwrap();

        let far = Vec3::new(10_000.0, 0.0, 0.0);
        let stats = s.tick(&land, &[far], false);
        assert_eq!(stats.records_evicted, 1);
        assert!(s.cache().is_empty());
        assert!(!s.sink().is_alive(batch));
    }

    #[test]
    fn test_unused_records_survive_retention_window() {
        let land = landscape(1, variety(50.0));
        let (mut s, clock) = scheduler(GrassConfig::default());
        s.tick(&land, &[CENTER], true);
        let far = Vec3::new(10_000.0, 0.0, 0.0);

        // frames pass but not enough time
        for _ in 0..40 {
            s.tick(&land, &[far], false);
        }
        assert_eq!(s.cache().len(), 1);

        clock.advance(Duration::from_secs(6));
        let stats = s.tick(&land, &[far], false);
        assert_eq!(stats.records_evicted, 1);
        assert_eq!(stats.batches_destroyed, 1);
    }

    #[test]
    fn test_exclusion_covering_tile_and_restore() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        s.tick(&land, &[CENTER], true);
        let first = only_record(&s).batch.unwrap();
        assert_eq!(s.sink().total_instances(), 64);

        let owner = Shared::new(());
        let cover = Aabb::new(Vec3::splat(-10.0), Vec3::splat(20.0));
        s.add_exclusion(owner.owner_handle(), cover);
        s.tick(&land, &[CENTER], true);

        let record = only_record(&s);
        assert!(record.batch.is_none());
        assert_eq!(record.excluded_boxes, vec![cover]);
        assert_eq!(s.sink().total_instances(), 0);
        assert_eq!(s.sink().live_count(), 0);
        assert_eq!(s.sink().destroyed().iter().filter(|&&b| b == first).count(), 1);

        s.remove_exclusion(&owner.owner_handle());
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.sink().total_instances(), 64);
        assert!(only_record(&s).excluded_boxes.is_empty());
    }

    #[test]
    fn test_rebuild_keeps_previous_until_done() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        s.tick(&land, &[CENTER], true);
        let first = only_record(&s).batch.unwrap();

        // exclude half the tile
        let owner = Shared::new(());
        s.add_exclusion(owner.owner_handle(), Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(4.0, 1.0, 9.0)));

        tick_until(&mut s, &land, &[CENTER], |s| {
            let record = only_record(s);
            if record.previous_batch == Some(first) {
                // old batch stays visible while the rebuild runs
                assert!(s.sink().is_alive(first));
                assert_eq!(s.sink().batch(first).unwrap().instance_count, 64);
            }
            !record.pending
        });

        let record = only_record(&s);
        assert_ne!(record.batch, Some(first));
        assert!(record.previous_batch.is_none());
        assert_eq!(s.sink().total_instances(), 32);
        assert_eq!(s.sink().destroyed().iter().filter(|&&b| b == first).count(), 1);

        // nothing changed since: no further rebuilds
        let created = s.sink().created_count();
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.sink().created_count(), created);
    }

    #[test]
    fn test_ignore_exclusion_boxes() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig { ignore_exclusion_boxes: true, ..Default::default() });
        let owner = Shared::new(());
        s.add_exclusion(owner.owner_handle(), Aabb::new(Vec3::splat(-10.0), Vec3::splat(20.0)));
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.sink().total_instances(), 64);
    }

    #[test]
    fn test_stale_exclusion_owner_triggers_rebuild() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        let owner = Shared::new(());
        s.add_exclusion(owner.owner_handle(), Aabb::new(Vec3::splat(-10.0), Vec3::splat(20.0)));
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.sink().total_instances(), 0);

        drop(owner);
        s.tick(&land, &[CENTER], true);
        assert!(s.exclusions().is_empty());
        assert_eq!(s.sink().total_instances(), 64);
    }

    #[test]
    fn test_invalid_density_creates_nothing() {
        let grass = Shared::new(GrassType::new("meadow").with_variety(variety(50.0)));
        let tile = GrassTile::new("bad", Vec3::ZERO, Vec3::ONE, TILE_QUADS);
        // weight layer one sample short
        tile.set_density(
            DensitySampleGrid::new(9, vec![HEIGHT_MID; 81], 0).with_weights(grass.id(), vec![255; 80]),
        );
        let land = GrassLandscape { tiles: vec![Shared::new(tile)], grass_types: vec![grass] };
        let (mut s, _) = scheduler(GrassConfig::default());
        let stats = s.tick(&land, &[CENTER], true);
        assert_eq!(stats.batches_created, 0);
        assert!(s.cache().is_empty());
        assert_eq!(s.sink().created_count(), 0);
    }

    #[test]
    fn test_density_stride_must_match_tile() {
        let grass = Shared::new(GrassType::new("meadow").with_variety(variety(50.0)));
        let tile = Shared::new(GrassTile::new("bad", Vec3::ZERO, Vec3::ONE, TILE_QUADS));
        // self-consistent 3 x 3 grid on a 9 x 9 vertex tile
        let small = DensitySampleGrid::new(3, vec![HEIGHT_MID; 9], 0).with_weights(grass.id(), vec![255; 9]);
        let land = GrassLandscape { tiles: vec![tile.clone()], grass_types: vec![grass] };
        let (mut s, _) = scheduler(GrassConfig::default());

        s.publish_density(&tile, small.clone(), &land.grass_types);
        assert!(!tile.has_density());

        tile.set_density(small);
        let stats = s.tick(&land, &[CENTER], true);
        assert_eq!(stats.batches_created, 0);
        assert!(s.cache().is_empty());
        assert_eq!(s.sink().total_instances(), 0);
    }

    struct WrongStrideRenderer;

    impl DensityMapRenderer for WrongStrideRenderer {
        fn render(&mut self, _tile: &GrassTile, grass_types: &[Shared<GrassType>]) -> Option<DensitySampleGrid> {
            let mut grid = DensitySampleGrid::new(2, vec![HEIGHT_MID; 4], 0);
            for ty in grass_types {
                grid.set_weights(ty.id(), vec![255; 4]);
            }
            Some(grid)
        }
    }

    #[test]
    fn test_rendered_density_with_wrong_stride_is_dropped() {
        let land = landscape(1, variety(50.0));
        land.tiles[0].discard_density();
        let (s, _) = scheduler(GrassConfig::default());
        let mut s = s.with_density_renderer(Box::new(WrongStrideRenderer));
        let stats = s.tick(&land, &[CENTER], true);
        assert_eq!(stats.batches_created, 0);
        assert!(!land.tiles[0].has_density());
        assert!(s.cache().is_empty());
    }

    /// Registers a box the first time it is read, like another thread
    /// adding one in the middle of an update.
    struct RegisteringClock {
        registry: Arc<ExclusionRegistry>,
        owner: Shared<()>,
        bounds: Aabb,
        fired: AtomicBool,
    }

    impl Clock for RegisteringClock {
        fn now_seconds(&self) -> f64 {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.registry.add(self.owner.owner_handle(), self.bounds);
            }
            0.0
        }
    }

    #[test]
    fn test_box_added_during_update_is_picked_up() {
        let land = landscape(1, variety(50.0));
        let registry = Arc::new(ExclusionRegistry::new());
        let clock = Arc::new(RegisteringClock {
            registry: registry.clone(),
            owner: Shared::new(()),
            bounds: Aabb::new(Vec3::splat(-10.0), Vec3::splat(20.0)),
            fired: AtomicBool::new(false),
        });
        let mut s = GrassScheduler::new(GrassConfig::default(), registry.clone(), HeadlessSink::new())
            .unwrap()
            .with_clock(clock);

        s.tick(&land, &[CENTER], true);
        assert_eq!(registry.len(), 1);
        // built from the snapshot taken before the box arrived
        assert!(only_record(&s).excluded_boxes.is_empty());
        assert_ne!(only_record(&s).exclusion_change_tag, registry.change_tag());

        for _ in 0..4 {
            s.tick(&land, &[CENTER], true);
        }
        assert_eq!(only_record(&s).excluded_boxes.len(), 1);
        assert_eq!(only_record(&s).exclusion_change_tag, registry.change_tag());
        assert_eq!(s.sink().total_instances(), 0);
    }

    fn subsection_landscape() -> GrassLandscape {
        // end cull 10: must-have 13, discard 14; 2 x 2 subsections of 4 x 4 m
        let mut v = variety(10.0);
        v.use_grid = false;
        v.density = 6400.0;
        landscape(1, v)
    }

    fn created_subsections(s: &GrassScheduler<HeadlessSink>) -> Vec<(u32, u32)> {
        let mut subs: Vec<(u32, u32)> = s.cache().iter().map(|r| (r.key.subsection_x, r.key.subsection_y)).collect();
        subs.sort();
        subs
    }

    #[test]
    fn test_cull_subsections() {
        let land = subsection_landscape();
        // 12.4 m from the tile and subsection (0, 0), 13.9 m from (0, 1)
        let camera = Vec3::new(-12.0, 0.0, -3.0);

        let (mut culled, _) = scheduler(GrassConfig { max_instances_per_batch: 1024, ..Default::default() });
        culled.tick(&land, &[camera], true);
        assert_eq!(created_subsections(&culled), vec![(0, 0)]);

        let (mut whole, _) = scheduler(GrassConfig {
            max_instances_per_batch: 1024,
            cull_subsections: false,
            ..Default::default()
        });
        whole.tick(&land, &[camera], true);
        assert_eq!(created_subsections(&whole), vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_exclusion_snapshots_follow_landscape() {
        let mut land = landscape(3, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.tile_exclusions.len(), 3);

        let removed = land.tiles.pop().unwrap().id();
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.tile_exclusions.len(), 2);
        assert!(!s.tile_exclusions.contains_key(&removed));

        let first = land.tiles[0].id();
        s.flush(&land, Some(&[first]), false);
        assert_eq!(s.tile_exclusions.len(), 1);
        assert!(!s.tile_exclusions.contains_key(&first));
    }

    #[test]
    fn test_disabled_creates_nothing() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig { enabled: false, ..Default::default() });
        s.tick(&land, &[CENTER], true);
        assert!(s.cache().is_empty());
    }

    #[test]
    fn test_tick_interval() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig { tick_interval: 2, ..Default::default() });
        let ran: Vec<bool> = (0..4).map(|_| s.tick(&land, &[CENTER], false).updated).collect();
        assert_eq!(ran, vec![false, true, false, true]);
        assert!(s.tick(&land, &[CENTER], true).updated);
    }

    #[test]
    fn test_scoped_flush() {
        let land = landscape(2, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.sink().live_count(), 2);

        let target = land.tiles[0].id();
        s.flush(&land, Some(&[target]), true);
        assert_eq!(s.cache().len(), 1);
        assert_eq!(s.sink().live_count(), 1);
        assert!(!land.tiles[0].has_density());
        assert!(land.tiles[1].has_density());
        assert!(s.cache().iter().all(|r| r.key.tile.id() != target));
    }

    #[test]
    fn test_full_flush_and_stale_results() {
        let land = landscape(2, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        let stats = s.tick(&land, &[CENTER], false);
        assert_eq!(stats.batches_created, 1);

        s.flush(&land, None, false);
        assert!(s.cache().is_empty());
        assert_eq!(s.sink().live_count(), 0);

        // the in-flight build finishes into nothing
        let far = Vec3::new(10_000.0, 0.0, 0.0);
        let stats = s.tick(&land, &[far], true);
        assert_eq!(stats.instances_applied, 0);
        assert_eq!(s.pending_tasks(), 0);
        assert_eq!(s.sink().live_count(), 0);
        assert!(land.tiles[0].has_density());
    }

    #[test]
    fn test_dead_tile_is_evicted() {
        let mut land = landscape(2, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig {
            min_frames_to_keep: 1000,
            min_seconds_to_keep: 1000.0,
            ..Default::default()
        });
        s.tick(&land, &[CENTER], true);
        land.tiles.pop();
        let stats = s.tick(&land, &[CENTER], true);
        assert_eq!(stats.records_evicted, 1);
        assert_eq!(s.sink().live_count(), 1);
    }

    #[test]
    fn test_scale_change_flushes() {
        let land = landscape(1, variety(50.0));
        let (mut s, _) = scheduler(GrassConfig::default());
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.sink().live_count(), 1);

        let mut cfg = s.config().clone();
        cfg.max_async_tasks = 2;
        s.set_config(cfg.clone());
        assert_eq!(s.sink().live_count(), 1);

        cfg.cull_distance_scale = 2.0;
        s.set_config(cfg);
        assert_eq!(s.sink().live_count(), 0);
        assert!(s.cache().is_empty());

        s.tick(&land, &[CENTER], true);
        let b = s.sink().batch(only_record(&s).batch.unwrap()).unwrap();
        assert_eq!(b.cull_end, 100.0);
    }

    #[test]
    fn test_density_scaling_applies_to_scaled_types() {
        let grass = Shared::new(GrassType::new("scaled").with_variety(variety(50.0)).with_density_scaling(true));
        let tile = GrassTile::new("t", Vec3::ZERO, Vec3::ONE, TILE_QUADS);
        tile.set_density(full_grid(&tile, std::slice::from_ref(&grass)));
        let land = GrassLandscape { tiles: vec![Shared::new(tile)], grass_types: vec![grass] };
        let (mut s, _) = scheduler(GrassConfig { density_scale: 0.25, ..Default::default() });
        s.tick(&land, &[CENTER], true);
        assert_eq!(s.sink().total_instances(), 16);
    }

    #[test]
    fn test_halton_subsections_tile_the_area() {
        let mut v = variety(50.0);
        v.use_grid = false;
        v.density = 6400.0; // 64 per axis, 2 x 2 subsections of 1024
        v.random_rotation = false;
        let land = landscape(1, v);
        let (mut s, _) = scheduler(GrassConfig { max_instances_per_batch: 1024, ..Default::default() });
        s.tick(&land, &[CENTER], true);

        assert_eq!(s.cache().len(), 4);
        assert_eq!(s.sink().total_instances(), 4096);
        for record in s.cache().iter() {
            assert_eq!(record.key.sqrt_subsections, 2);
            let b = s.sink().batch(record.batch.unwrap()).unwrap();
            let (x0, z0) = (record.key.subsection_x as f32 * 4.0, record.key.subsection_y as f32 * 4.0);
            for instance in b.instances.as_ref().unwrap().instances() {
                let p = instance.origin();
                assert!(p.x >= x0 && p.x < x0 + 4.0 && p.z >= z0 && p.z < z0 + 4.0, "{:?}", p);
            }
        }
    }

    struct CountingRenderer {
        renders: Arc<AtomicUsize>,
    }

    impl DensityMapRenderer for CountingRenderer {
        fn render(&mut self, tile: &GrassTile, grass_types: &[Shared<GrassType>]) -> Option<DensitySampleGrid> {
            self.renders.fetch_add(1, Ordering::Relaxed);
            Some(full_grid(tile, grass_types))
        }
    }

    #[test]
    fn test_density_rendered_on_demand_and_after_material_change() {
        let land = landscape(1, variety(50.0));
        land.tiles[0].discard_density();
        let renders = Arc::new(AtomicUsize::new(0));
        let (s, _) = scheduler(GrassConfig { prerender_density_maps: false, ..Default::default() });
        let mut s = s.with_density_renderer(Box::new(CountingRenderer { renders: renders.clone() }));

        let stats = s.tick(&land, &[CENTER], true);
        assert_eq!(stats.density_maps_rendered, 1);
        assert_eq!(s.sink().total_instances(), 64);

        land.tiles[0].bump_material_state();
        let first = only_record(&s).batch;
        s.tick(&land, &[CENTER], true);
        assert_eq!(renders.load(Ordering::Relaxed), 2);
        assert_ne!(only_record(&s).batch, first);
        assert!(!land.tiles[0].is_density_outdated());
    }

    #[test]
    fn test_prerender_budget() {
        let land = landscape(6, variety(50.0));
        for tile in &land.tiles {
            tile.discard_density();
        }
        let renders = Arc::new(AtomicUsize::new(0));
        let (s, _) = scheduler(GrassConfig { max_density_renders_per_tick: 2, ..Default::default() });
        let mut s = s.with_density_renderer(Box::new(CountingRenderer { renders: renders.clone() }));

        // camera far away: nothing is built, only prerendering happens
        let far = Vec3::new(10_000.0, 0.0, 0.0);
        let stats = s.tick(&land, &[far], false);
        assert_eq!(stats.density_maps_rendered, 2);
        s.tick(&land, &[far], false);
        s.tick(&land, &[far], false);
        assert_eq!(renders.load(Ordering::Relaxed), 6);
        assert!(land.tiles.iter().all(|t| t.has_density()));
        assert!(s.cache().is_empty());
    }

    #[test]
    fn test_publish_density_discards_scaled_layers() {
        let plain = Shared::new(GrassType::new("plain").with_variety(variety(50.0)));
        let scaled = Shared::new(GrassType::new("scaled").with_variety(variety(50.0)).with_density_scaling(true));
        let grass_types = vec![plain.clone(), scaled.clone()];
        let tile = Shared::new(GrassTile::new("t", Vec3::ZERO, Vec3::ONE, TILE_QUADS));
        let land = GrassLandscape { tiles: vec![tile.clone()], grass_types: grass_types.clone() };

        let (mut s, _) = scheduler(GrassConfig { discard_data_on_load: true, ..Default::default() });
        s.publish_density(&tile, full_grid(&tile, &grass_types), &grass_types);
        let grid = tile.density().unwrap();
        assert!(grid.weights(plain.id()).is_some());
        assert!(grid.weights(scaled.id()).is_none());

        // only the unscaled type gets a batch
        s.tick(&land, &[CENTER], true);
        assert_eq!(only_record(&s).key.grass_type.id(), plain.id());
    }

    #[test]
    fn test_helpers() {
        let b = Aabb::new(Vec3::ZERO, Vec3::splat(8.0));
        assert_eq!(min_camera_distance(&b, &[]), 0.0);
        assert_eq!(min_camera_distance(&b, &[Vec3::new(11.0, 4.0, 4.0), Vec3::new(4.0, 4.0, 10.0)]), 2.0);

        let sub = subsection_bounds(&b, 2, 1, 0);
        assert_eq!(sub, Aabb::new(Vec3::new(4.0, 0.0, 0.0), Vec3::new(8.0, 8.0, 4.0)));

        let x = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let y = Aabb::new(Vec3::ONE, Vec3::splat(2.0));
        assert!(same_boxes(&[x, y], &[y, x]));
        assert!(!same_boxes(&[x], &[y]));
    }
}
