//! World simulation engine.
//!
//! The grid where rabbits and foxes live, graze, hunt and breed, and the
//! partitioned scheduler that advances it one tick at a time.

pub mod agent;
pub mod partition;
pub mod pathing;
pub mod scheduler;
pub mod simulation;
pub mod species;
pub mod terrain;

pub use agent::{AgentRecord, AgentRegistry};
pub use partition::{AgentSnapshot, PartitionIndex, SpatialPartitioner};
pub use pathing::{PathEngine, SearchLayerPool};
pub use scheduler::{PhaseTimings, Scheduler};
pub use simulation::{RunSummary, SimulationEngine, TickReport};
pub use species::{behavior_of, SpeciesBehavior};
pub use terrain::{SharedTerrain, TerrainGrid};
