//! Per-tile density sample grid.
//!
//! A grid holds one height sample per tile vertex plus one 8-bit weight layer
//! per grass type, all laid out row-major with `stride` = tile edge vertex
//! count. It is produced by a density-map render pass, published to the tile
//! once, and shared read-only with background builders through an `Arc`.

use std::collections::HashMap;

use crate::core::HandleId;
use crate::grass::types::GrassType;

/// Raw height value that maps to local height zero.
pub const HEIGHT_MID: u16 = 32768;
/// Local height units per raw height step.
pub const HEIGHT_SCALE: f32 = 1.0 / 128.0;

/// Convert a raw 16-bit height sample to local (unscaled) height.
pub fn decode_height(raw: u16) -> f32 {
    (raw as f32 - HEIGHT_MID as f32) * HEIGHT_SCALE
}

/// Convert a local (unscaled) height to the nearest raw 16-bit sample.
pub fn encode_height(height: f32) -> u16 {
    (height / HEIGHT_SCALE + HEIGHT_MID as f32).round().clamp(0.0, u16::MAX as f32) as u16
}

/// Heights and per-grass-type weights for one tile
#[derive(Clone, Debug, Default)]
pub struct DensitySampleGrid {
    stride: usize,
    heights: Vec<u16>,
    weights: HashMap<HandleId, Vec<u8>>,
    /// Material state of the tile the grid was rendered from
    source_state: u64,
}

impl DensitySampleGrid {
    pub fn new(stride: usize, heights: Vec<u16>, source_state: u64) -> Self {
        Self {
            stride,
            heights,
            weights: HashMap::new(),
            source_state,
        }
    }

    pub fn with_weights(mut self, grass_type: HandleId, weights: Vec<u8>) -> Self {
        self.set_weights(grass_type, weights);
        self
    }

    pub fn set_weights(&mut self, grass_type: HandleId, weights: Vec<u8>) {
        self.weights.insert(grass_type, weights);
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn source_state(&self) -> u64 {
        self.source_state
    }

    pub fn heights(&self) -> &[u16] {
        &self.heights
    }

    pub fn weights(&self, grass_type: HandleId) -> Option<&[u8]> {
        self.weights.get(&grass_type).map(Vec::as_slice)
    }

    pub fn has_data(&self) -> bool {
        !self.heights.is_empty()
    }

    /// Bytes held by sample arrays.
    pub fn allocated_size(&self) -> usize {
        self.heights.len() * std::mem::size_of::<u16>()
            + self.weights.values().map(Vec::len).sum::<usize>()
    }

    /// Heights and the grass type's weights both cover stride² samples.
    pub fn is_valid_for(&self, grass_type: HandleId) -> bool {
        let expected = self.stride * self.stride;
        expected > 0
            && self.heights.len() == expected
            && self.weights.get(&grass_type).is_some_and(|w| w.len() == expected)
    }

    /// Sampling view for one grass type, `None` when the data is invalid.
    pub fn access(&self, grass_type: HandleId) -> Option<DensityAccess<'_>> {
        if !self.is_valid_for(grass_type) {
            return None;
        }
        let weights = self.weights.get(&grass_type)?;
        Some(DensityAccess {
            stride: self.stride,
            heights: &self.heights,
            weights,
        })
    }

    /// Drop weight layers of grass types that scale with the density
    /// setting; with no layers left the heights go too.
    pub fn discard_scalable_layers<'a>(&mut self, grass_types: impl IntoIterator<Item = (HandleId, &'a GrassType)>) {
        for (id, grass_type) in grass_types {
            if grass_type.enable_density_scaling {
                self.weights.remove(&id);
            }
        }
        if self.weights.is_empty() {
            self.heights = Vec::new();
        }
    }
}

/// Read-only bilinear accessor over one grass type's layer
#[derive(Clone, Copy, Debug)]
pub struct DensityAccess<'a> {
    stride: usize,
    heights: &'a [u16],
    weights: &'a [u8],
}

impl<'a> DensityAccess<'a> {
    pub fn stride(&self) -> usize {
        self.stride
    }

    fn index(&self, x: usize, z: usize) -> usize {
        x + z * self.stride
    }

    /// Local (unscaled) height at a grid vertex
    pub fn height_at(&self, x: usize, z: usize) -> f32 {
        decode_height(self.heights[self.index(x, z)])
    }

    /// Weight in 0..=1 at a grid vertex
    pub fn weight_at(&self, x: usize, z: usize) -> f32 {
        self.weights[self.index(x, z)] as f32 / 255.0
    }

    /// Bilinear sample at fractional grid coordinates, clamped to the grid.
    ///
    /// # Returns
    /// `(weight, local_height)`
    pub fn sample(&self, grid_x: f32, grid_z: f32) -> (f32, f32) {
        let (x1, x2, tx) = self.bracket(grid_x);
        let (z1, z2, tz) = self.bracket(grid_z);

        let w = lerp(
            lerp(self.weight_at(x1, z1), self.weight_at(x2, z1), tx),
            lerp(self.weight_at(x1, z2), self.weight_at(x2, z2), tx),
            tz,
        );
        let h = lerp(
            lerp(self.height_at(x1, z1), self.height_at(x2, z1), tx),
            lerp(self.height_at(x1, z2), self.height_at(x2, z2), tx),
            tz,
        );
        (w, h)
    }

    /// Bilinear height only
    pub fn sample_height(&self, grid_x: f32, grid_z: f32) -> f32 {
        let (x1, x2, tx) = self.bracket(grid_x);
        let (z1, z2, tz) = self.bracket(grid_z);
        lerp(
            lerp(self.height_at(x1, z1), self.height_at(x2, z1), tx),
            lerp(self.height_at(x1, z2), self.height_at(x2, z2), tx),
            tz,
        )
    }

    fn bracket(&self, t: f32) -> (usize, usize, f32) {
        let last = (self.stride - 1) as f32;
        let lo = t.floor().clamp(0.0, last);
        let hi = t.ceil().clamp(0.0, last);
        (lo as usize, hi as usize, t - t.floor())
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}
