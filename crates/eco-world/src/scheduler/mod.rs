//! Phase scheduling for one simulation tick.
//!
//! A tick runs five phases, each a barrier: partition rebuild, terrain
//! update, agent update, interaction resolution and cleanup. Phases 2 and 3
//! fan out one task per partition; the rest run on the calling thread.
//!
//! Lock order, outermost first:
//!
//! 1. the agent registry `RwLock`
//! 2. partition bucket mutexes, ascending by partition id
//! 3. the terrain lock
//! 4. agent slot mutexes, ascending by agent id
//! 5. cell-block mutexes, one at a time
//!
//! Every site that holds two of these takes them in this order. Terrain
//! growth tasks hold the terrain lock shared plus their own region's slice
//! mutex, and nothing else.

pub mod interaction;
pub mod pool;
pub mod rwlock;

pub use interaction::{InteractionQueue, InteractionRequest, RequestBatch};
pub use pool::{TaskHandle, WorkerPool};
pub use rwlock::{TerrainLock, TerrainReadGuard, TerrainWriteGuard};

use eco_core::{ExecutionMode, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Runs the parallel phases either inline or on a worker pool
pub struct Scheduler {
    mode: ExecutionMode,
    pool: Option<WorkerPool>,
}

impl Scheduler {
    pub fn new(mode: ExecutionMode) -> Result<Self> {
        let pool = match mode {
            ExecutionMode::Sequential => None,
            ExecutionMode::Partitioned { workers } => Some(WorkerPool::new(workers)?),
        };
        Ok(Self { mode, pool })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(1, |p| p.size())
    }

    /// Run one task per partition and wait for all of them. Results are in
    /// task order whatever the execution mode.
    pub fn run_phase<T, F>(&self, tasks: Vec<F>) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        match &self.pool {
            Some(pool) => pool.run_all(tasks),
            None => Ok(tasks.into_iter().map(|task| task()).collect()),
        }
    }
}

/// Wall-clock time spent in each phase of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub rebuild: Duration,
    pub terrain: Duration,
    pub agents: Duration,
    pub interactions: Duration,
    pub cleanup: Duration,
}

impl PhaseTimings {
    pub fn total(&self) -> Duration {
        self.rebuild + self.terrain + self.agents + self.interactions + self.cleanup
    }
}

/// Time a closure, returning its value and how long it took
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let value = f();
    (value, start.elapsed())
}
