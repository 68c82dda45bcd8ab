//! Deterministic random sources for placement.

/// Linear congruential stream producing floats in [0, 1).
///
/// Same seed, same sequence on every platform, so a batch key always
/// rebuilds the same instances.
#[derive(Clone, Copy, Debug)]
pub struct RandomStream {
    seed: u32,
}

impl RandomStream {
    pub fn new(seed: u32) -> Self {
        Self { seed }
    }

    fn mutate(&mut self) {
        self.seed = self.seed.wrapping_mul(196_314_165).wrapping_add(907_633_515);
    }

    /// Next value in [0, 1)
    pub fn fraction(&mut self) -> f32 {
        self.mutate();
        // 23 mantissa bits over an exponent of 1.0 give [1, 2)
        f32::from_bits(0x3F80_0000 | (self.seed >> 9)) - 1.0
    }
}

/// Radical inverse of `index` in `base` (Halton sequence element).
pub fn halton(mut index: u32, base: u32) -> f32 {
    let inv_base = 1.0 / base as f32;
    let mut fraction = inv_base;
    let mut result = 0.0;
    while index > 0 {
        result += (index % base) as f32 * fraction;
        index /= base;
        fraction *= inv_base;
    }
    result
}

/// Stable per-batch seed derived from the names that identify it.
///
/// FNV-1a over the lower-cased identity string; never zero.
pub fn batch_seed(grass_type: &str, tile: &str, subsection_x: u32, subsection_y: u32, variety: usize) -> u32 {
    const FNV_OFFSET: u32 = 0x811C_9DC5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let text = format!("{}{}{} {} {}", grass_type, tile, subsection_x, subsection_y, variety).to_lowercase();
    let mut hash = FNV_OFFSET;
    for byte in text.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if hash == 0 { 1 } else { hash }
}
