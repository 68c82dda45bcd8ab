//! Procedural grass placement and batch caching.
//!
//! Landscape tiles carry density grids (one weight layer per grass type plus
//! heights). Around each camera the [`GrassScheduler`] keeps one instance
//! batch per tile, grass type, variety and subsection, building new ones on
//! a worker pool and aging out the ones nobody looks at. Exclusion boxes
//! registered in an [`ExclusionRegistry`] carve holes and trigger rebuilds.
//! Finished batches go to an [`InstanceSink`], the only renderer-facing seam.

pub mod builder;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod density;
pub mod exclusion;
pub mod instance;
pub mod random;
pub mod sampler;
pub mod scheduler;
pub mod sink;
pub mod task;
pub mod tile;
pub mod types;

pub use builder::{BatchBuildParams, BuiltBatch, InstanceBatchBuilder};
pub use cache::{BatchCache, BatchKey, BatchRecord, BatchState, RetentionPolicy};
pub use cluster::{build_cluster_tree, ClusterNode, ClusterTree};
pub use config::GrassConfig;
pub use density::{DensityAccess, DensitySampleGrid};
pub use exclusion::{ExclusionRegistry, ExclusionSnapshot};
pub use instance::{InstanceBuffer, InstanceData};
pub use sampler::{Placement, PlacementArea, PlacementSampler, PlacementSettings, PlacementStrategy};
pub use scheduler::{GrassScheduler, GrassStats};
pub use sink::{BatchDesc, BatchId, HeadlessBatch, HeadlessSink, InstanceSink};
pub use task::{BuildPool, BuildTask};
pub use tile::{DensityMapRenderer, GrassLandscape, GrassTile};
pub use types::{FloatInterval, GrassScaling, GrassType, GrassVariety, MeshId, DENSITY_AREA};
