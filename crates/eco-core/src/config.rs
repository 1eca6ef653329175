//! Configuration types for the simulation.

use crate::error::{Error, Result};
use crate::types::{EvolutionParams, Species, Traits};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Terrain generation and growth parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerrainConfig {
    /// Width of the grid in cells
    pub width: i32,
    /// Height of the grid in cells
    pub height: i32,
    /// Upper grass threshold per cell
    pub grass_max: f32,
    /// Upper fertilizer threshold per cell
    pub fertilizer_max: f32,
    /// Range the per-cell grass growth rate is drawn from
    pub grass_rate_range: (f32, f32),
    /// Range the per-cell fertilizer regeneration rate is drawn from
    pub fertilizer_rate_range: (f32, f32),
    /// Fraction of cells seeded with grass at start (0.0 to 1.0)
    pub initial_grass_coverage: f32,
    /// Range of the capacity fraction given to each seeded cell
    pub initial_grass_range: (f32, f32),
    /// Obstacle density (0.0 to 1.0)
    pub obstacle_density: f32,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            grass_max: 300.0,
            fertilizer_max: 1000.0,
            grass_rate_range: (0.0001, 0.05),
            fertilizer_rate_range: (0.00001, 0.00115),
            initial_grass_coverage: 0.1,
            initial_grass_range: (0.025, 1.0),
            obstacle_density: 0.0,
        }
    }
}

/// Energy and action cost configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConfig {
    /// Cost coefficient for one movement segment
    pub move_cost: f32,
    /// Cost coefficient for eating
    pub eat_cost: f32,
    /// Cost coefficient for idling, scaled by dt
    pub idle_cost: f32,
    /// Cost coefficient paid by a parent on successful replication
    pub replicate_cost: f32,
    /// Fraction of max energy returned to the soil when an agent dies
    pub death_threshold: f32,
    /// Maximum distance an agent may eat from
    pub eat_range: f32,
    /// An occupant is edible when its size is below this multiple of the eater's size
    pub predation_size_ratio: f32,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            move_cost: 0.2,
            eat_cost: 0.0,
            idle_cost: 0.0125,
            replicate_cost: 0.5,
            death_threshold: 0.3,
            eat_range: 1.5,
            predation_size_ratio: 1.2,
        }
    }
}

/// Mutation bounds applied to offspring traits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Maximum absolute perturbation applied to each trait on mutation
    pub mutation_epsilon: f32,
    /// Lower trait bound
    pub trait_min: f32,
    /// Upper trait bound
    pub trait_max: f32,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            mutation_epsilon: 0.1,
            trait_min: 0.01,
            trait_max: 10.0,
        }
    }
}

/// Per-species base values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesProfile {
    /// Starting (current, max) energy
    pub base_energy: (f32, f32),
    /// Starting (current, max) fatigue
    pub base_fatigue: (f32, f32),
    /// Reproduction parameters handed to spawned agents
    pub evolution: EvolutionParams,
    /// Traits used when a spawn request does not supply any
    pub default_traits: Traits,
}

/// Evolution chart: one profile per species
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesConfig {
    pub rabbit: SpeciesProfile,
    pub fox: SpeciesProfile,
}

impl SpeciesConfig {
    pub fn profile(&self, species: Species) -> &SpeciesProfile {
        match species {
            Species::Rabbit => &self.rabbit,
            Species::Fox => &self.fox,
        }
    }
}

impl Default for SpeciesConfig {
    fn default() -> Self {
        Self {
            rabbit: SpeciesProfile {
                base_energy: (500.0, 1000.0),
                base_fatigue: (500.0, 1000.0),
                evolution: EvolutionParams::new(0.7, 0.001, 0.75),
                default_traits: Traits::new(1.0, 1.0, 3.0),
            },
            fox: SpeciesProfile {
                base_energy: (1600.0, 2000.0),
                base_fatigue: (800.0, 1000.0),
                evolution: EvolutionParams::new(0.35, 0.30, 0.6667),
                default_traits: Traits::new(1.5, 1.2, 4.0),
            },
        }
    }
}

/// A batch of agents placed at random free cells on startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnGroup {
    pub species: Species,
    pub count: usize,
    /// Overrides the species' default traits
    pub traits: Option<Traits>,
}

/// Initial population
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    pub groups: Vec<SpawnGroup>,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            groups: vec![
                SpawnGroup {
                    species: Species::Rabbit,
                    count: 40,
                    traits: None,
                },
                SpawnGroup {
                    species: Species::Fox,
                    count: 6,
                    traits: None,
                },
            ],
        }
    }
}

/// How a tick is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every phase runs inline on the calling thread
    Sequential,
    /// Phases fan out over a fixed-size worker pool
    Partitioned { workers: usize },
}

/// Parallel scheduler parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub mode: ExecutionMode,
    /// Side length of a square partition tile in cells
    pub partition_size: i32,
    /// Side length of a square cell block guarded by one mutex
    pub cell_block_size: i32,
    /// Open-list size past which a search is abandoned as "no path"
    pub max_open_nodes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Partitioned { workers: 4 },
            partition_size: 16,
            cell_block_size: 4,
            max_open_nodes: 1000,
        }
    }
}

/// Rolling statistics and metric emission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Number of samples kept in the rolling population log
    pub window: usize,
    /// Ticks between population log samples
    pub sample_interval: u64,
    /// Ticks between `population_metrics` events
    pub metrics_interval: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            window: 20,
            sample_interval: 60,
            metrics_interval: 600,
        }
    }
}

/// Top-level simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Number of ticks `run` executes
    pub num_ticks: u64,
    /// Fixed timestep handed to every tick
    pub dt: f32,
    pub terrain: TerrainConfig,
    pub energy: EnergyConfig,
    pub evolution: EvolutionConfig,
    pub species: SpeciesConfig,
    pub population: PopulationConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_ticks: 6_000,
            dt: 1.0 / 60.0,
            terrain: TerrainConfig::default(),
            energy: EnergyConfig::default(),
            evolution: EvolutionConfig::default(),
            species: SpeciesConfig::default(),
            population: PopulationConfig::default(),
            scheduler: SchedulerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SimulationConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: SimulationConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject configurations the engine cannot run
    pub fn validate(&self) -> Result<()> {
        let t = &self.terrain;
        if t.width <= 0 || t.height <= 0 {
            return Err(Error::Config(format!(
                "grid must be non-empty, got {}x{}",
                t.width, t.height
            )));
        }
        if t.grass_max <= 0.0 || t.fertilizer_max <= 0.0 {
            return Err(Error::Config("grass_max and fertilizer_max must be positive".into()));
        }
        for (name, (lo, hi)) in [
            ("grass_rate_range", t.grass_rate_range),
            ("fertilizer_rate_range", t.fertilizer_rate_range),
            ("initial_grass_range", t.initial_grass_range),
        ] {
            if lo < 0.0 || lo > hi {
                return Err(Error::Config(format!("{name} is inverted or negative: ({lo}, {hi})")));
            }
        }
        for (name, value) in [
            ("initial_grass_coverage", t.initial_grass_coverage),
            ("obstacle_density", t.obstacle_density),
            ("death_threshold", self.energy.death_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{name} must lie in [0, 1], got {value}")));
            }
        }
        let evo = &self.evolution;
        if !(evo.trait_min.is_finite() && evo.trait_max.is_finite())
            || evo.trait_min <= 0.0
            || evo.trait_min > evo.trait_max
        {
            return Err(Error::Config("trait bounds must satisfy 0 < min <= max".into()));
        }
        if !evo.mutation_epsilon.is_finite() {
            return Err(Error::Config("mutation_epsilon must be finite".into()));
        }
        for species in Species::all() {
            let profile = self.species.profile(species);
            let (current, max) = profile.base_energy;
            if !(current.is_finite() && max.is_finite()) || max <= 0.0 || current < 0.0 || current > max {
                return Err(Error::Config(format!(
                    "{species} base energy ({current}, {max}) is out of range"
                )));
            }
            let (current, max) = profile.base_fatigue;
            if !(current.is_finite() && max.is_finite()) {
                return Err(Error::Config(format!("{species} base fatigue ({current}, {max}) is not finite")));
            }
            if !profile.default_traits.is_finite() {
                return Err(Error::Config(format!("{species} default traits must be finite")));
            }
        }
        let s = &self.scheduler;
        if s.partition_size <= 0 || s.cell_block_size <= 0 {
            return Err(Error::Config("partition and cell block sizes must be positive".into()));
        }
        if let ExecutionMode::Partitioned { workers } = s.mode {
            if workers == 0 {
                return Err(Error::Config("partitioned mode needs at least one worker".into()));
            }
        }
        if self.dt.is_nan() || self.dt <= 0.0 {
            return Err(Error::Config(format!("dt must be positive, got {}", self.dt)));
        }
        if self.log.window == 0 {
            return Err(Error::Config("log window must hold at least one sample".into()));
        }
        Ok(())
    }
}
