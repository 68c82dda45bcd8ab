//! Background build tasks.
//!
//! Builds run as blocking jobs on a dedicated tokio runtime whose blocking
//! pool is capped at the configured task count. A [`BuildTask`] owns its
//! join handle; dropping an unfinished task lets the job run to completion
//! and discards its result.

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use crate::core::{Error, Result};
use crate::grass::builder::{BuiltBatch, InstanceBatchBuilder};
use crate::grass::cache::BatchKey;
use crate::grass::sink::BatchId;

/// One in-flight batch build
#[derive(Debug)]
pub struct BuildTask {
    key: BatchKey,
    batch: BatchId,
    handle: JoinHandle<BuiltBatch>,
}

impl BuildTask {
    /// Batch the result is destined for
    pub fn batch(&self) -> BatchId {
        self.batch
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Worker pool for batch builds
pub struct BuildPool {
    runtime: Runtime,
}

impl BuildPool {
    /// Create a pool running at most `max_threads` builds at once.
    pub fn new(max_threads: usize) -> Result<Self> {
        let max_threads = max_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_threads)
            .thread_name("grass-build")
            .build()
            .map_err(|e| Error::Runtime(format!("failed to start build pool: {}", e)))?;
        Ok(Self { runtime })
    }

    pub fn submit(&self, key: BatchKey, batch: BatchId, builder: InstanceBatchBuilder) -> BuildTask {
        let handle = self.runtime.spawn_blocking(move || builder.build());
        BuildTask { key, batch, handle }
    }

    /// Take a task's result, blocking until it finishes.
    ///
    /// # Returns
    /// The key, batch and built result; `Err` if the build panicked
    pub fn finish(&self, task: BuildTask) -> (BatchKey, BatchId, Result<BuiltBatch>) {
        let BuildTask { key, batch, handle } = task;
        let result = self
            .runtime
            .block_on(handle)
            .map_err(|e| Error::Build(format!("batch build failed: {}", e)));
        (key, batch, result)
    }
}
