//! Simulation engine: owns the world and drives it one tick at a time.

use crate::agent::{action_cost, ActionKind, AgentRecord, AgentRegistry};
use crate::partition::{AgentSnapshot, Neighborhood, PartitionIndex, SpatialPartitioner};
use crate::pathing::{empty_neighbor, PathEngine, SearchLayerPool};
use crate::scheduler::{
    timed, InteractionQueue, InteractionRequest, PhaseTimings, RequestBatch, Scheduler,
};
use crate::species::{behavior_of, Intent, WorldView};
use crate::terrain::{CellAccess, SharedTerrain, TerrainGrid};
use eco_core::{
    stream_rng, AgentId, EvolutionParams, ExecutionMode, PartitionId, PopulationLog,
    PopulationSample, Position, Region, Result, SimulationConfig, SimulationCounters, Species,
    SpeciesSample, StreamSalt, Traits,
};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, event, info, instrument, trace, warn, Level};

/// Summary of one tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    /// Living agents after cleanup
    pub population: usize,
    pub births: u64,
    pub deaths: u64,
    pub predations: u64,
    /// Grass plus fertilizer over the whole grid
    pub grid_energy: f64,
    pub timings: PhaseTimings,
}

/// Outcome of [`SimulationEngine::run`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub ticks_run: u64,
    pub cancelled: bool,
    pub population: usize,
    pub grid_energy: f64,
    pub counters: SimulationCounters,
    pub final_sample: PopulationSample,
}

#[derive(Debug, Clone, Copy)]
enum GrowthPass {
    Plan,
    Absorb,
    Settle,
}

#[derive(Default)]
struct TickTally {
    births: AtomicU64,
    deaths: AtomicU64,
    predations: AtomicU64,
    replication_attempts: AtomicU64,
    replication_successes: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy)]
struct TallyCounts {
    births: u64,
    deaths: u64,
    predations: u64,
    replication_attempts: u64,
    replication_successes: u64,
}

impl TickTally {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn take(&self) -> TallyCounts {
        TallyCounts {
            births: self.births.swap(0, Ordering::Relaxed),
            deaths: self.deaths.swap(0, Ordering::Relaxed),
            predations: self.predations.swap(0, Ordering::Relaxed),
            replication_attempts: self.replication_attempts.swap(0, Ordering::Relaxed),
            replication_successes: self.replication_successes.swap(0, Ordering::Relaxed),
        }
    }
}

/// State shared with the worker tasks of a tick
struct World {
    config: SimulationConfig,
    terrain: SharedTerrain,
    /// Exclusive claim on one partition's cells during terrain growth
    slices: Vec<Mutex<()>>,
    registry: RwLock<AgentRegistry>,
    index: PartitionIndex,
    layers: SearchLayerPool,
    queue: InteractionQueue,
    /// Offspring born since the last cleanup, cells already claimed
    nursery: Mutex<Vec<AgentRecord>>,
    next_id: AtomicU64,
    tick: AtomicU64,
    queries: AtomicU64,
    tally: TickTally,
}

impl World {
    /// Phase 2 for one partition: growth passes write only the cells of
    /// `region`, so tasks share the terrain read lock and each holds its own
    /// slice exclusively
    fn growth_pass(&self, pass: GrowthPass, pid: PartitionId, region: Region, dt: f32) {
        let grid = self.terrain.read();
        let Some(slice) = self.slices.get(pid.0) else {
            return;
        };
        let _slice = slice.lock();
        match pass {
            GrowthPass::Plan => grid.plan_growth(region, dt),
            GrowthPass::Absorb => grid.absorb_growth(region),
            GrowthPass::Settle => grid.settle_growth(region),
        }
    }

    /// Phase 3 for one partition: idle cost, movement and behaviour for every
    /// agent the tile owns. Cross-partition effects are queued, not applied.
    fn update_partition(&self, pid: PartitionId, dt: f32, tick: u64) -> usize {
        let registry = self.registry.read();
        let hood = self.index.lock_neighborhood(pid);
        let guard = self.terrain.read();
        let grid: &TerrainGrid = &guard;
        let mut layer = self.layers.checkout();
        let energy = &self.config.energy;
        let members = hood.own_members();
        let mut batch = RequestBatch::new(pid);

        for &id in &members {
            let Some(mut agent) = registry.lock(id) else {
                continue;
            };
            if !agent.is_alive() {
                continue;
            }
            agent.tick();
            let idle_owed = agent.pay_idle(dt, energy);
            let step = agent.advance(dt, energy);
            if step.from != step.to {
                batch.push(InteractionRequest::Relocate {
                    agent: id,
                    from: step.from,
                    to: step.to,
                });
            }
            let owed = idle_owed + step.overshoot;
            if owed > 0.0 {
                batch.push(InteractionRequest::ReturnEnergy {
                    agent: id,
                    cell: agent.position,
                    amount: owed,
                });
            }
            if !agent.is_alive() {
                continue;
            }

            let intent = {
                let mut view = PartitionView {
                    grid,
                    hood: &hood,
                    paths: PathEngine::new(grid, &mut layer, self.config.scheduler.max_open_nodes),
                    rng: stream_rng(self.config.seed, tick, id.0, StreamSalt::Behavior),
                    size_ratio: energy.predation_size_ratio,
                };
                (behavior_of(agent.species).update)(&mut agent, &mut view)
            };
            if intent == Intent::Eat {
                let cell = agent.position;
                match grid.occupant(cell) {
                    Some(other) if other != id => batch.push(InteractionRequest::Predation {
                        predator: id,
                        prey: other,
                        cell,
                    }),
                    _ => batch.push(InteractionRequest::Graze { agent: id, cell }),
                }
            }
        }

        self.queue.submit(batch);
        members.len()
    }

    /// Phase 4: apply queued requests one at a time in their total order
    fn resolve_interactions(&self) -> usize {
        let requests = self.queue.drain_ordered();
        let registry = self.registry.read();
        let guard = self.terrain.write();
        let cells = CellAccess::new(&guard, self.terrain.blocks());

        for request in &requests {
            match *request {
                InteractionRequest::Relocate { agent, from, to } => {
                    cells.grid().release_cell(from, agent);
                    if !cells.grid().claim_cell(to, agent) {
                        trace!(agent = %agent, x = to.x, y = to.y, "Destination occupied, reseating later");
                    }
                }
                InteractionRequest::Graze { agent, cell } => {
                    self.resolve_eat(&registry, &cells, agent, cell);
                }
                InteractionRequest::Predation { predator, cell, .. } => {
                    self.resolve_eat(&registry, &cells, predator, cell);
                }
                InteractionRequest::ReturnEnergy { agent, cell, amount } => {
                    return_to_soil(&cells, agent, cell, amount);
                }
            }
        }
        requests.len()
    }

    /// Eat whatever `cell` offers: its occupant when the diet and size rules
    /// allow, its grass otherwise. Returns the energy gained.
    fn resolve_eat(&self, registry: &AgentRegistry, cells: &CellAccess<'_>, eater: AgentId, cell: Position) -> f32 {
        let grid = cells.grid();
        let prey_id = grid.occupant(cell).filter(|&o| o != eater);
        let (mut agent, prey) = match prey_id.and_then(|prey| registry.lock_pair(eater, prey)) {
            Some((agent, prey)) => (agent, Some(prey)),
            None => match registry.lock(eater) {
                Some(agent) => (agent, None),
                None => return 0.0,
            },
        };
        if !agent.is_alive() {
            return 0.0;
        }
        let distance = agent.position.euclidean_distance(&cell);
        if distance > self.config.energy.eat_range {
            debug!(agent = %eater, distance, "Eat request out of range");
            return 0.0;
        }

        let gained = match prey {
            Some(mut prey) if self.can_consume(&agent, &prey, cell) => {
                let gained = prey.eaten();
                TickTally::bump(&self.tally.predations, 1);
                debug!(
                    event = "predation",
                    predator = %agent.id,
                    prey = %prey.id,
                    energy = gained,
                    "Prey consumed"
                );
                gained
            }
            _ => cells.consume_grass(cell, 1.0),
        };
        self.finish_meal(cells, &mut agent, gained);
        gained
    }

    fn can_consume(&self, eater: &AgentRecord, prey: &AgentRecord, cell: Position) -> bool {
        behavior_of(eater.species).eats(prey.species)
            && prey.is_alive()
            && prey.position == cell
            && prey.traits.size < self.config.energy.predation_size_ratio * eater.traits.size
    }

    fn finish_meal(&self, cells: &CellAccess<'_>, agent: &mut AgentRecord, gained: f32) {
        let cost = action_cost(&agent.traits, agent.energy.current, ActionKind::Eat, &self.config.energy, 1.0);
        let owed = agent.spend_energy(cost);
        return_to_soil(cells, agent.id, agent.position, owed);
        let overflow = agent.gain_energy(gained);
        return_to_soil(cells, agent.id, agent.position, overflow);
        if agent.wants_to_replicate() {
            self.try_replicate(cells, agent);
        }
    }

    /// Bernoulli draw against the replication chance; on success the
    /// offspring's cell is claimed now and the record waits in the nursery
    fn try_replicate(&self, cells: &CellAccess<'_>, parent: &mut AgentRecord) -> Option<AgentId> {
        let grid = cells.grid();
        TickTally::bump(&self.tally.replication_attempts, 1);
        let tick = self.tick.load(Ordering::Relaxed);
        let mut rng = stream_rng(self.config.seed, tick, parent.id.0, StreamSalt::Replication);
        if rng.gen::<f32>() >= parent.evolution.replication_chance {
            return None;
        }
        let cell = empty_neighbor(grid, parent.position)?;
        let id = AgentId(self.next_id.fetch_add(1, Ordering::SeqCst));
        if !grid.claim_cell(cell, id) {
            return None;
        }

        let traits = parent.offspring_traits(&mut rng, &self.config.evolution);
        let cost = action_cost(
            &parent.traits,
            parent.energy.current,
            ActionKind::Replicate,
            &self.config.energy,
            1.0,
        );
        let owed = parent.spend_energy(cost);
        return_to_soil(cells, parent.id, parent.position, owed);

        let profile = self.config.species.profile(parent.species);
        let child = AgentRecord::new(
            id,
            parent.species,
            cell,
            traits,
            parent.evolution,
            profile.base_energy.into(),
            profile.base_fatigue.into(),
            tick,
        );
        self.nursery.lock().push(child);
        TickTally::bump(&self.tally.replication_successes, 1);
        debug!(
            event = "replication_success",
            parent = %parent.id,
            child = %id,
            species = %parent.species,
            x = cell.x,
            y = cell.y,
            "Agent replicated"
        );
        Some(id)
    }

    /// Phase 5: drop the dead, admit the newborn, settle cell claims
    fn cleanup(&self) {
        let mut registry = self.registry.write();
        let guard = self.terrain.read();
        let cells = CellAccess::new(&guard, self.terrain.blocks());
        let grid = cells.grid();

        let dead = registry.remove_dead();
        for record in &dead {
            grid.release_cell(record.position, record.id);
            let deposit = record.energy.max * self.config.energy.death_threshold;
            cells.deposit_fertilizer(record.position, deposit);
            debug!(
                event = "agent_death",
                agent = %record.id,
                species = %record.species,
                age = record.age,
                deposit,
                "Agent died"
            );
        }
        TickTally::bump(&self.tally.deaths, dead.len() as u64);

        self.admit_nursery(&mut registry);
        reseat(&mut registry, grid);
    }

    fn admit_nursery(&self, registry: &mut AgentRegistry) -> usize {
        let mut born = std::mem::take(&mut *self.nursery.lock());
        born.sort_unstable_by_key(|r| r.id);
        let count = born.len();
        for child in born {
            registry.insert(child);
        }
        TickTally::bump(&self.tally.births, count as u64);
        count
    }

    fn query_rng(&self) -> ChaCha8Rng {
        let n = self.queries.fetch_add(1, Ordering::Relaxed);
        stream_rng(self.config.seed, self.tick.load(Ordering::Relaxed), n, StreamSalt::Query)
    }
}

/// Deposit energy an agent gave up as fertilizer on `cell`
fn return_to_soil(cells: &CellAccess<'_>, agent: AgentId, cell: Position, amount: f32) {
    if amount <= 0.0 {
        return;
    }
    let lost = cells.deposit_fertilizer(cell, amount);
    if lost > 0.0 {
        warn!(agent = %agent, lost, "Fertilizer saturated, surplus energy dropped");
    }
}

/// Give every living agent the cell it stands on, or the nearest free
/// neighbour when two ended up on the same cell
fn reseat(registry: &mut AgentRegistry, grid: &TerrainGrid) {
    for id in registry.ids() {
        let Some(agent) = registry.get_mut(id) else {
            continue;
        };
        match grid.occupant(agent.position) {
            Some(holder) if holder == id => {}
            None => {
                grid.claim_cell(agent.position, id);
            }
            Some(_) => match empty_neighbor(grid, agent.position) {
                Some(cell) => {
                    agent.position = cell;
                    grid.claim_cell(cell, id);
                    trace!(agent = %id, x = cell.x, y = cell.y, "Agent reseated");
                }
                None => warn!(
                    event = "reseat_failed",
                    agent = %id,
                    x = agent.position.x,
                    y = agent.position.y,
                    "No free cell to reseat agent, sharing a cell until one frees up"
                ),
            },
        }
    }
}

/// An agent's view of the world during phase 3
struct PartitionView<'a, 'h> {
    grid: &'a TerrainGrid,
    hood: &'a Neighborhood<'h>,
    paths: PathEngine<'a>,
    rng: ChaCha8Rng,
    size_ratio: f32,
}

impl WorldView for PartitionView<'_, '_> {
    fn in_bounds(&self, pos: Position) -> bool {
        self.grid.in_bounds(pos)
    }

    fn grass_fraction(&self, pos: Position) -> f32 {
        self.grid.grass_fraction(pos)
    }

    fn agent_at(&self, pos: Position) -> Option<AgentSnapshot> {
        self.hood.agent_at(pos)
    }

    fn predation_size_ratio(&self) -> f32 {
        self.size_ratio
    }

    fn shortest_path(&mut self, src: Position, dest: Position) -> Vec<Position> {
        self.paths.shortest_path(src, dest, &mut self.rng)
    }

    fn best_resource(&mut self, src: Position, radius: f32, min_quality: f32) -> Option<Position> {
        self.paths.best_resource(src, radius, min_quality, &mut self.rng)
    }

    fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}

/// Runs the predator-prey simulation, sequentially or partitioned over a
/// worker pool. Both modes produce identical results from the same seed.
pub struct SimulationEngine {
    world: Arc<World>,
    scheduler: Scheduler,
    counters: SimulationCounters,
    log: PopulationLog,
    tick: u64,
}

impl SimulationEngine {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = stream_rng(config.seed, 0, 0, StreamSalt::Terrain);
        let grid = TerrainGrid::from_config(&config.terrain, &mut rng);
        Self::with_terrain(config, grid)
    }

    /// Build an engine around a prepared grid; the grid's size wins over the
    /// configured one
    pub fn with_terrain(config: SimulationConfig, grid: TerrainGrid) -> Result<Self> {
        config.validate()?;
        let (width, height) = (grid.width(), grid.height());
        let partitioner = SpatialPartitioner::new(width, height, config.scheduler.partition_size);
        let scheduler = Scheduler::new(config.scheduler.mode)?;
        let log = PopulationLog::new(config.log.window);

        info!(
            event = "engine_created",
            width,
            height,
            partitions = partitioner.count(),
            workers = scheduler.workers(),
            mode = ?config.scheduler.mode,
            seed = config.seed,
            "Simulation engine ready"
        );

        let world = World {
            terrain: SharedTerrain::new(grid, config.scheduler.cell_block_size),
            slices: (0..partitioner.count()).map(|_| Mutex::new(())).collect(),
            registry: RwLock::new(AgentRegistry::new()),
            index: PartitionIndex::new(partitioner),
            layers: SearchLayerPool::new(width, height),
            queue: InteractionQueue::new(),
            nursery: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            tick: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            tally: TickTally::default(),
            config,
        };

        Ok(Self {
            world: Arc::new(world),
            scheduler,
            counters: SimulationCounters::default(),
            log,
            tick: 0,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.world.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.scheduler.mode()
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Place a new agent on a free, passable cell. Energy and fatigue come
    /// from the species profile; traits are clamped to the configured bounds.
    pub fn spawn(
        &mut self,
        position: Position,
        traits: Traits,
        evolution: EvolutionParams,
        species: Species,
    ) -> Option<AgentId> {
        if !traits.is_finite() {
            warn!(event = "spawn_rejected", x = position.x, y = position.y, reason = "non_finite_traits");
            return None;
        }
        let grid = self.world.terrain.read();
        if !grid.is_passable(position) {
            debug!(event = "spawn_rejected", x = position.x, y = position.y, reason = "blocked");
            return None;
        }
        let id = AgentId(self.world.next_id.load(Ordering::SeqCst));
        if !grid.claim_cell(position, id) {
            debug!(event = "spawn_rejected", x = position.x, y = position.y, reason = "occupied");
            return None;
        }
        self.world.next_id.fetch_add(1, Ordering::SeqCst);
        drop(grid);

        let config = &self.world.config;
        let profile = config.species.profile(species);
        let traits = traits.clamped(config.evolution.trait_min, config.evolution.trait_max);
        let record = AgentRecord::new(
            id,
            species,
            position,
            traits,
            evolution,
            profile.base_energy.into(),
            profile.base_fatigue.into(),
            self.tick,
        );
        self.world.registry.write().insert(record);
        trace!(agent = %id, species = %species, x = position.x, y = position.y, "Agent spawned");
        Some(id)
    }

    /// Spawn with the species' default traits and evolution parameters
    pub fn spawn_species(&mut self, position: Position, species: Species) -> Option<AgentId> {
        let profile = self.world.config.species.profile(species).clone();
        self.spawn(position, profile.default_traits, profile.evolution, species)
    }

    /// Scatter the configured spawn groups over random free cells
    pub fn spawn_initial_population(&mut self) -> usize {
        let mut rng = stream_rng(self.world.config.seed, 0, 0, StreamSalt::Spawn);
        let mut free: Vec<Position> = {
            let grid = self.world.terrain.read();
            grid.bounds()
                .positions()
                .filter(|&p| grid.is_passable(p) && grid.occupant(p).is_none())
                .collect()
        };
        free.shuffle(&mut rng);

        let groups = self.world.config.population.groups.clone();
        let mut spawned = 0;
        for group in &groups {
            let profile = self.world.config.species.profile(group.species).clone();
            let traits = group.traits.unwrap_or(profile.default_traits);
            for _ in 0..group.count {
                let Some(cell) = free.pop() else {
                    warn!(species = %group.species, "No free cells left for spawning");
                    break;
                };
                if self.spawn(cell, traits, profile.evolution, group.species).is_some() {
                    spawned += 1;
                }
            }
        }
        info!(event = "population_spawned", agents = spawned, "Initial population placed");
        spawned
    }

    pub fn request_path(&self, src: Position, dest: Position) -> Vec<Position> {
        let grid = self.world.terrain.read();
        let mut layer = self.world.layers.checkout();
        let mut rng = self.world.query_rng();
        PathEngine::new(&grid, &mut layer, self.world.config.scheduler.max_open_nodes)
            .shortest_path(src, dest, &mut rng)
    }

    pub fn best_resource(&self, src: Position, radius: f32, min_quality: f32) -> Option<Position> {
        let grid = self.world.terrain.read();
        let mut layer = self.world.layers.checkout();
        let mut rng = self.world.query_rng();
        PathEngine::new(&grid, &mut layer, self.world.config.scheduler.max_open_nodes)
            .best_resource(src, radius, min_quality, &mut rng)
    }

    pub fn empty_neighbor(&self, src: Position) -> Option<Position> {
        empty_neighbor(&self.world.terrain.read(), src)
    }

    /// Eat at the agent's own cell; returns the energy gained
    pub fn eat(&self, id: AgentId) -> f32 {
        let Some(cell) = self.world.registry.read().lock(id).map(|a| a.position) else {
            return 0.0;
        };
        self.eat_at(id, cell)
    }

    /// Eat from `cell`, which must lie within eating range of the agent
    pub fn eat_at(&self, id: AgentId, cell: Position) -> f32 {
        let registry = self.world.registry.read();
        let guard = self.world.terrain.read();
        let cells = CellAccess::new(&guard, self.world.terrain.blocks());
        self.world.resolve_eat(&registry, &cells, id, cell)
    }

    /// Spend `amount` of the agent's energy, or restore it when negative.
    /// Spending more than the agent holds returns the overshoot to the soil
    /// as fertilizer, as does a restore past the maximum. Returns the
    /// agent's new energy.
    pub fn consume_energy(&self, id: AgentId, amount: f32) -> f32 {
        let registry = self.world.registry.read();
        let guard = self.world.terrain.read();
        let cells = CellAccess::new(&guard, self.world.terrain.blocks());
        let Some(mut agent) = registry.lock(id) else {
            return 0.0;
        };
        if !agent.is_alive() || amount.is_nan() {
            return agent.energy.current;
        }
        let returned = if amount >= 0.0 {
            agent.spend_energy(amount)
        } else {
            agent.gain_energy(-amount)
        };
        return_to_soil(&cells, id, agent.position, returned);
        agent.energy.current
    }

    /// Living agents within `radius` of agent `id`, optionally of one species,
    /// ascending by id
    pub fn sense_nearby(&self, id: AgentId, radius: f32, species: Option<Species>) -> Vec<AgentSnapshot> {
        let registry = self.world.registry.read();
        let Some(origin) = registry.lock(id).map(|a| a.position) else {
            return Vec::new();
        };
        let index = &self.world.index;
        index.rebuild(&registry);

        if radius.is_nan() {
            return Vec::new();
        }
        let (width, height) = index.partitioner().extent();
        let reach = radius.max(0.0).min(width.max(height) as f32).ceil() as i32;
        let area = Region::new(
            origin.x.saturating_sub(reach),
            origin.y.saturating_sub(reach),
            origin.x.saturating_add(reach).saturating_add(1),
            origin.y.saturating_add(reach).saturating_add(1),
        );
        let mut found: Vec<AgentSnapshot> = index
            .partitioner()
            .tiles_overlapping(area)
            .into_iter()
            .flat_map(|pid| index.members(pid))
            .filter(|s| s.id != id)
            .filter(|s| s.position.euclidean_distance(&origin) <= radius)
            .filter(|s| species.map_or(true, |wanted| s.species == wanted))
            .collect();
        found.sort_unstable_by_key(|s| s.id);
        found
    }

    /// Advance the world by one tick of `dt` seconds. Failures inside a phase
    /// are logged; the tick always completes.
    pub fn tick(&mut self, dt: f32) -> TickReport {
        let tick = self.tick;
        self.world.tick.store(tick, Ordering::Relaxed);
        let mut timings = PhaseTimings::default();

        timings.rebuild = timed(|| self.rebuild_partitions()).1;
        timings.terrain = timed(|| self.update_terrain(dt)).1;
        timings.agents = timed(|| self.update_agents(dt, tick)).1;
        let (resolved, elapsed) = timed(|| self.world.resolve_interactions());
        timings.interactions = elapsed;
        timings.cleanup = timed(|| self.world.cleanup()).1;

        let tally = self.world.tally.take();
        self.counters.births += tally.births;
        self.counters.deaths += tally.deaths;
        self.counters.predations += tally.predations;
        self.counters.replication_attempts += tally.replication_attempts;
        self.counters.replication_successes += tally.replication_successes;

        let population = self.agent_count();
        self.counters.observe_population(population);
        let report = TickReport {
            tick,
            population,
            births: tally.births,
            deaths: tally.deaths,
            predations: tally.predations,
            grid_energy: self.total_grid_energy(),
            timings,
        };
        trace!(tick, requests = resolved, population, "Tick complete");

        let log_config = &self.world.config.log;
        if log_config.sample_interval > 0 && tick % log_config.sample_interval == 0 {
            let sample = self.population_sample();
            self.log.record(sample);
        }
        if log_config.metrics_interval > 0 && tick % log_config.metrics_interval == 0 && tick > 0 {
            self.emit_population_metrics(&report);
        }

        self.tick += 1;
        report
    }

    /// Run the configured number of ticks at the configured `dt`
    #[instrument(skip(self), fields(num_ticks = self.world.config.num_ticks))]
    pub fn run(&mut self) -> RunSummary {
        self.run_with_cancel(&AtomicBool::new(false))
    }

    /// Like [`run`](Self::run), stopping early once `cancel` is set
    pub fn run_with_cancel(&mut self, cancel: &AtomicBool) -> RunSummary {
        let num_ticks = self.world.config.num_ticks;
        let dt = self.world.config.dt;
        info!("Starting simulation for {} ticks", num_ticks);

        let mut ticks_run = 0;
        let mut cancelled = false;
        for _ in 0..num_ticks {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                warn!(tick = self.tick, "Simulation cancelled");
                break;
            }
            let report = self.tick(dt);
            ticks_run += 1;
            if report.tick % 1000 == 0 {
                info!(
                    "Tick {}/{}: {} agents alive",
                    report.tick, num_ticks, report.population
                );
            }
        }

        let summary = RunSummary {
            ticks_run,
            cancelled,
            population: self.agent_count(),
            grid_energy: self.total_grid_energy(),
            counters: self.counters.clone(),
            final_sample: self.population_sample(),
        };
        self.emit_episode_summary(&summary);
        summary
    }

    /// Kill every agent, returning its remaining energy to the soil
    pub fn nuke(&mut self) -> usize {
        let mut registry = self.world.registry.write();
        let guard = self.world.terrain.read();
        let cells = CellAccess::new(&guard, self.world.terrain.blocks());

        let mut removed = registry.drain();
        removed.append(&mut std::mem::take(&mut *self.world.nursery.lock()));
        for record in &removed {
            cells.grid().release_cell(record.position, record.id);
            let deposit = if record.is_alive() {
                record.energy.current
            } else {
                record.energy.max * self.world.config.energy.death_threshold
            };
            cells.deposit_fertilizer(record.position, deposit);
        }
        info!(event = "nuke", agents = removed.len(), "All agents removed");
        removed.len()
    }

    fn rebuild_partitions(&self) {
        let mut registry = self.world.registry.write();
        self.world.admit_nursery(&mut registry);
        self.world.index.rebuild(&registry);
    }

    fn update_terrain(&self, dt: f32) {
        let partitioner = self.world.index.partitioner();
        let regions: Vec<_> = partitioner.ids().zip(partitioner.regions()).collect();
        for pass in [GrowthPass::Plan, GrowthPass::Absorb, GrowthPass::Settle] {
            let tasks: Vec<_> = regions
                .iter()
                .map(|&(pid, region)| {
                    let world = self.world.clone();
                    move || world.growth_pass(pass, pid, region, dt)
                })
                .collect();
            if let Err(e) = self.scheduler.run_phase(tasks) {
                warn!(event = "phase_failed", phase = "terrain", pass = ?pass, error = %e, "Terrain pass failed");
            }
        }
    }

    fn update_agents(&self, dt: f32, tick: u64) {
        let tasks: Vec<_> = self
            .world
            .index
            .partitioner()
            .ids()
            .map(|pid| {
                let world = self.world.clone();
                move || world.update_partition(pid, dt, tick)
            })
            .collect();
        match self.scheduler.run_phase(tasks) {
            Ok(counts) => trace!(tick, agents = counts.iter().sum::<usize>(), "Agent phase done"),
            Err(e) => warn!(event = "phase_failed", phase = "agents", error = %e, "Agent phase failed"),
        }
    }

    pub fn occupant(&self, pos: Position) -> Option<AgentId> {
        self.world.terrain.read().occupant(pos)
    }

    pub fn grass_fraction(&self, pos: Position) -> f32 {
        self.world.terrain.read().grass_fraction(pos)
    }

    pub fn fertilizer_fraction(&self, pos: Position) -> f32 {
        self.world.terrain.read().fertilizer_fraction(pos)
    }

    pub fn grass_threshold(&self, pos: Position) -> Option<(f32, f32)> {
        self.world.terrain.read().grass_threshold(pos)
    }

    pub fn fertilizer_threshold(&self, pos: Position) -> Option<(f32, f32)> {
        self.world.terrain.read().fertilizer_threshold(pos)
    }

    pub fn total_grid_energy(&self) -> f64 {
        self.world.terrain.read().total_energy()
    }

    /// Read access to the grid
    pub fn view_terrain<R>(&self, f: impl FnOnce(&TerrainGrid) -> R) -> R {
        f(&self.world.terrain.read())
    }

    /// Exclusive access to the grid between ticks
    pub fn edit_terrain<R>(&mut self, f: impl FnOnce(&mut TerrainGrid) -> R) -> R {
        f(&mut self.world.terrain.write())
    }

    pub fn agent_count(&self) -> usize {
        self.world.registry.read().living_count()
    }

    pub fn agent(&self, id: AgentId) -> Option<AgentRecord> {
        self.world.registry.read().lock(id).map(|a| a.clone())
    }

    /// Clones of every registered agent, ascending by id
    pub fn agents(&self) -> Vec<AgentRecord> {
        self.world.registry.read().snapshot()
    }

    pub fn counters(&self) -> &SimulationCounters {
        &self.counters
    }

    pub fn population_log(&self) -> &PopulationLog {
        &self.log
    }

    fn population_sample(&self) -> PopulationSample {
        let agents: Vec<AgentRecord> = self.agents().into_iter().filter(|a| a.is_alive()).collect();
        let of = |species: Species| {
            SpeciesSample::from_traits(agents.iter().filter(|a| a.species == species).map(|a| &a.traits))
        };
        PopulationSample {
            tick: self.tick,
            rabbits: of(Species::Rabbit),
            foxes: of(Species::Fox),
            grass_fraction: self.world.terrain.read().mean_grass_fraction(),
        }
    }

    fn emit_population_metrics(&self, report: &TickReport) {
        let sample = self.log.latest().cloned().unwrap_or_default();
        info!(
            event = "population_metrics",
            tick = report.tick,
            total_population = report.population,
            rabbits = sample.rabbits.count,
            foxes = sample.foxes.count,
            rabbit_avg_size = sample.rabbits.avg_size,
            fox_avg_size = sample.foxes.avg_size,
            grass_fraction = sample.grass_fraction,
            grid_energy = report.grid_energy,
            births_total = self.counters.births,
            deaths_total = self.counters.deaths,
            predations_total = self.counters.predations,
            reproduction_success_rate = format!("{:.2}%", self.counters.replication_success_rate() * 100.0),
            "Population metrics snapshot"
        );

        debug!(
            event = "phase_timings",
            tick = report.tick,
            rebuild_us = report.timings.rebuild.as_micros() as u64,
            terrain_us = report.timings.terrain.as_micros() as u64,
            agents_us = report.timings.agents.as_micros() as u64,
            interactions_us = report.timings.interactions.as_micros() as u64,
            cleanup_us = report.timings.cleanup.as_micros() as u64,
            "Phase timings"
        );

        event!(
            Level::INFO,
            gauge_name = "population_total",
            gauge_value = report.population,
            tick = report.tick,
            "Population gauge"
        );

        event!(
            Level::INFO,
            gauge_name = "grid_energy",
            gauge_value = report.grid_energy,
            tick = report.tick,
            "Grid energy gauge"
        );
    }

    fn emit_episode_summary(&self, summary: &RunSummary) {
        info!(
            event = "episode_summary",
            ticks_run = summary.ticks_run,
            cancelled = summary.cancelled,
            final_population = summary.population,
            peak_population = summary.counters.peak_population,
            births_total = summary.counters.births,
            deaths_total = summary.counters.deaths,
            predations_total = summary.counters.predations,
            replication_attempts_total = summary.counters.replication_attempts,
            replication_successes_total = summary.counters.replication_successes,
            grid_energy = summary.grid_energy,
            "Simulation complete"
        );

        for species in Species::all() {
            info!(
                event = "species_summary",
                species = %species,
                mean_count = self.log.mean_count(species),
                mean_size = self.log.mean_size(species),
                mean_speed = self.log.mean_speed(species),
                mean_sense = self.log.mean_sense(species),
                "Rolling species averages"
            );
        }

        event!(
            Level::INFO,
            gauge_name = "final_population",
            gauge_value = summary.population,
            "Final population gauge"
        );
    }
}
