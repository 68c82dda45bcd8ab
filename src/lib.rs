//! Landscape grass - procedural grass placement and instance batch caching
//! for tiled heightfield terrain

pub mod core;
pub mod math;
pub mod grass;
