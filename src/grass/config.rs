//! Grass scheduler configuration (runtime tunables).
//!
//! Every field can be changed between ticks through
//! `GrassScheduler::set_config`. Files are plain JSON; missing fields take
//! their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Smallest effective per-batch instance cap.
pub const MIN_INSTANCES_PER_BATCH: u32 = 1024;
/// Largest frame interval between grass updates.
pub const MAX_TICK_INTERVAL: u32 = 60;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrassConfig {
    /// Master on/off. When off, no batches are created but existing ones
    /// still age out.
    pub enabled: bool,
    /// Batches are created once a camera is within this multiple of the
    /// variety's end cull distance.
    pub guard_band_multiplier: f32,
    /// Batches stop being retouched once every camera is beyond this
    /// multiple of the end cull distance.
    pub guard_band_discard_multiplier: f32,
    /// Unused batches survive at least this many frames (times the tick interval)...
    pub min_frames_to_keep: u32,
    /// ...and at least this many seconds.
    pub min_seconds_to_keep: f32,
    /// Update grass every N frames (1..=60).
    pub tick_interval: u32,
    /// Per-batch instance cap used to split tiles into subsections.
    pub max_instances_per_batch: u32,
    /// Maximum concurrent background builds.
    pub max_async_tasks: u32,
    /// Use the Halton sequence for every variety, even grid ones.
    pub use_halton_distribution: bool,
    /// Multiplier on density for grass types with density scaling enabled.
    pub density_scale: f32,
    /// Multiplier on all cull distances.
    pub cull_distance_scale: f32,
    /// Measure camera distance per subsection instead of per tile.
    pub cull_subsections: bool,
    /// Debug: create batches with no cull distances.
    pub disable_gpu_cull: bool,
    /// Debug: never cast dynamic shadows.
    pub disable_dynamic_shadows: bool,
    /// Debug: ignore exclusion boxes entirely.
    pub ignore_exclusion_boxes: bool,
    /// Drop density layers of density-scaled grass types when a grid is published.
    pub discard_data_on_load: bool,
    /// Render missing density maps ahead of need.
    pub prerender_density_maps: bool,
    /// Density map render budget per update.
    pub max_density_renders_per_tick: u32,
    /// Leaf size of the per-batch cluster tree.
    pub instances_per_leaf: u32,
}

impl Default for GrassConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            guard_band_multiplier: 1.3,
            guard_band_discard_multiplier: 1.4,
            min_frames_to_keep: 30,
            min_seconds_to_keep: 5.0,
            tick_interval: 1,
            max_instances_per_batch: 65536,
            max_async_tasks: 4,
            use_halton_distribution: false,
            density_scale: 1.0,
            cull_distance_scale: 1.0,
            cull_subsections: true,
            disable_gpu_cull: false,
            disable_dynamic_shadows: false,
            ignore_exclusion_boxes: false,
            discard_data_on_load: false,
            prerender_density_maps: true,
            max_density_renders_per_tick: 4,
            instances_per_leaf: 16,
        }
    }
}

impl GrassConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check for values that make the scheduler misbehave.
    ///
    /// A discard band narrower than the creation band makes batches get
    /// created and dropped on alternate ticks; the scheduler tolerates it by
    /// widening the discard band, but it is still reported here.
    pub fn validate(&self) -> Result<()> {
        if self.guard_band_multiplier <= 0.0 {
            return Err(Error::Config(format!(
                "guard_band_multiplier must be positive, got {}",
                self.guard_band_multiplier
            )));
        }
        if self.guard_band_discard_multiplier < self.guard_band_multiplier {
            return Err(Error::Config(format!(
                "guard_band_discard_multiplier ({}) is below guard_band_multiplier ({})",
                self.guard_band_discard_multiplier, self.guard_band_multiplier
            )));
        }
        if self.density_scale < 0.0 || self.cull_distance_scale < 0.0 {
            return Err(Error::Config("density and cull distance scales must not be negative".into()));
        }
        if self.min_seconds_to_keep < 0.0 {
            return Err(Error::Config("min_seconds_to_keep must not be negative".into()));
        }
        if self.instances_per_leaf == 0 {
            return Err(Error::Config("instances_per_leaf must be at least 1".into()));
        }
        Ok(())
    }

    pub fn effective_tick_interval(&self) -> u32 {
        self.tick_interval.clamp(1, MAX_TICK_INTERVAL)
    }

    pub fn effective_max_instances_per_batch(&self) -> u32 {
        self.max_instances_per_batch.max(MIN_INSTANCES_PER_BATCH)
    }

    /// Frames an unused batch must stay unused before it may be evicted.
    pub fn retention_frames(&self) -> u64 {
        self.min_frames_to_keep as u64 * self.effective_tick_interval() as u64
    }

    /// Distance within which a batch for `end_cull_distance` must exist.
    pub fn must_have_distance(&self, end_cull_distance: f32) -> f32 {
        self.guard_band_multiplier * end_cull_distance * self.cull_distance_scale
    }

    /// Distance beyond which a batch is no longer kept alive. Never below
    /// the must-have distance.
    pub fn discard_distance(&self, end_cull_distance: f32) -> f32 {
        let band = self.guard_band_discard_multiplier.max(self.guard_band_multiplier);
        band * end_cull_distance * self.cull_distance_scale
    }
}
