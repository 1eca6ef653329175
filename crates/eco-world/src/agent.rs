//! Agent state, life-cycle and the registry that owns every agent.

use eco_core::{AgentId, EnergyConfig, EvolutionConfig, EvolutionParams, Position, Species, Traits};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A bounded quantity: `current` stays within `[0, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub current: f32,
    pub max: f32,
}

impl Budget {
    pub fn new(current: f32, max: f32) -> Self {
        Self {
            current: current.clamp(0.0, max.max(0.0)),
            max: max.max(0.0),
        }
    }

    pub fn ratio(&self) -> f32 {
        if self.max > 0.0 {
            self.current / self.max
        } else {
            0.0
        }
    }
}

impl From<(f32, f32)> for Budget {
    fn from((current, max): (f32, f32)) -> Self {
        Self::new(current, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Idle,
    Moving,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Move,
    Eat,
    Idle,
    Replicate,
}

impl ActionKind {
    pub fn coefficient(&self, config: &EnergyConfig) -> f32 {
        match self {
            ActionKind::Move => config.move_cost,
            ActionKind::Eat => config.eat_cost,
            ActionKind::Idle => config.idle_cost,
            ActionKind::Replicate => config.replicate_cost,
        }
    }
}

/// Energy cost of an action: bigger, faster, keener and better-fed agents pay more.
pub fn action_cost(traits: &Traits, energy: f32, action: ActionKind, config: &EnergyConfig, modifier: f32) -> f32 {
    let half = action.coefficient(config) / 2.0;
    let body = 2.0 * traits.size * traits.size * traits.speed * traits.speed + traits.sense + traits.size;
    (half * (body + energy) + half * energy) * modifier
}

/// Scratch flags a species behaviour keeps between ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorMemory {
    pub searching: bool,
    pub prey_found: bool,
}

/// Cells crossed by one call to [`AgentRecord::advance`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveOutcome {
    pub from: Position,
    pub to: Position,
    pub segments: usize,
    /// Move cost the agent could not cover, owed to the soil
    pub overshoot: f32,
}

/// An agent in the simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub species: Species,
    pub position: Position,
    pub home: Position,
    pub traits: Traits,
    pub energy: Budget,
    pub fatigue: Budget,
    pub evolution: EvolutionParams,
    pub memory: BehaviorMemory,
    pub birth_tick: u64,
    pub age: u64,
    pub energy_threshold: f32,
    pub fatigue_threshold: f32,
    path: VecDeque<Position>,
    path_elapsed: f32,
    state: AgentState,
}

impl AgentRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: AgentId,
        species: Species,
        position: Position,
        traits: Traits,
        evolution: EvolutionParams,
        energy: Budget,
        fatigue: Budget,
        birth_tick: u64,
    ) -> Self {
        let mut record = Self {
            id,
            species,
            position,
            home: position,
            traits,
            energy,
            fatigue,
            evolution,
            memory: BehaviorMemory::default(),
            birth_tick,
            age: 0,
            energy_threshold: 0.3,
            fatigue_threshold: 0.3,
            path: VecDeque::new(),
            path_elapsed: 0.0,
            state: AgentState::Idle,
        };
        if energy.current <= 0.0 {
            record.state = AgentState::Dead;
        }
        record
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state != AgentState::Dead
    }

    /// Replace the pending path. An empty path leaves the agent idle.
    pub fn set_path(&mut self, path: Vec<Position>) {
        if !self.is_alive() {
            return;
        }
        self.path = path.into();
        self.path_elapsed = 0.0;
        self.state = if self.path.is_empty() {
            AgentState::Idle
        } else {
            AgentState::Moving
        };
    }

    pub fn has_pending_path(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn pending_destination(&self) -> Option<Position> {
        self.path.back().copied()
    }

    pub fn pending_path(&self) -> impl Iterator<Item = &Position> {
        self.path.iter()
    }

    /// Pay the idle cost for `dt`; dies if that empties the energy budget.
    /// Returns the part of the cost the agent could not cover.
    pub fn pay_idle(&mut self, dt: f32, config: &EnergyConfig) -> f32 {
        if !self.is_alive() {
            return 0.0;
        }
        let cost = action_cost(&self.traits, self.energy.current, ActionKind::Idle, config, dt);
        self.spend_energy(cost)
    }

    /// Walk the pending path for `dt` seconds, one segment per
    /// `distance / speed` seconds, paying the move cost per segment.
    pub fn advance(&mut self, dt: f32, config: &EnergyConfig) -> MoveOutcome {
        let from = self.position;
        let mut segments = 0;
        let mut overshoot = 0.0;
        if self.is_alive() && !self.path.is_empty() {
            self.path_elapsed += dt;
            while let Some(&next) = self.path.front() {
                let required = self.position.euclidean_distance(&next) / self.traits.speed.max(f32::EPSILON);
                if self.path_elapsed <= required {
                    break;
                }
                self.path_elapsed -= required;
                self.position = next;
                self.path.pop_front();
                segments += 1;
                let cost = action_cost(&self.traits, self.energy.current, ActionKind::Move, config, 1.0);
                overshoot += self.spend_energy(cost);
                if !self.is_alive() {
                    break;
                }
            }
            if self.is_alive() && self.path.is_empty() {
                self.state = AgentState::Idle;
                self.path_elapsed = 0.0;
            }
        }
        MoveOutcome {
            from,
            to: self.position,
            segments,
            overshoot,
        }
    }

    /// Remove energy, clamping at zero; the agent dies when it reaches zero.
    /// Returns the overshoot: how much of `amount` exceeded the energy left.
    /// Callers return it to the soil at the agent's cell.
    pub fn spend_energy(&mut self, amount: f32) -> f32 {
        let amount = amount.max(0.0);
        let overshoot = (amount - self.energy.current).max(0.0);
        self.energy.current = (self.energy.current - amount).clamp(0.0, self.energy.max);
        if self.energy.current <= 0.0 {
            self.die();
        }
        overshoot
    }

    /// Add energy up to the maximum; returns the overflow that did not fit
    pub fn gain_energy(&mut self, amount: f32) -> f32 {
        if !self.is_alive() {
            return amount.max(0.0);
        }
        let total = self.energy.current + amount.max(0.0);
        self.energy.current = total.min(self.energy.max);
        total - self.energy.current
    }

    pub fn consume_fatigue(&mut self, amount: f32) -> f32 {
        self.fatigue.current = (self.fatigue.current - amount).clamp(0.0, self.fatigue.max);
        self.fatigue.current
    }

    pub fn is_starving(&self) -> bool {
        self.energy.ratio() < self.energy_threshold
    }

    pub fn is_tired(&self) -> bool {
        self.fatigue.ratio() < self.fatigue_threshold
    }

    /// Consumed by a predator: all energy and capacity go to the eater
    pub fn eaten(&mut self) -> f32 {
        let energy = self.energy.current;
        self.energy = Budget::new(0.0, 0.0);
        self.die();
        energy
    }

    pub fn mark_territory(&mut self) {
        self.home = self.position;
    }

    pub fn wants_to_replicate(&self) -> bool {
        self.is_alive() && self.energy.ratio() >= self.evolution.replication_threshold
    }

    /// Offspring traits: a copy, perturbed on a Bernoulli draw against the
    /// mutation chance by uniform noise within the mutation epsilon.
    pub fn offspring_traits(&self, rng: &mut impl Rng, config: &EvolutionConfig) -> Traits {
        let mut traits = self.traits;
        if rng.gen::<f32>() < self.evolution.mutation_chance {
            let eps = config.mutation_epsilon.abs();
            if eps > 0.0 {
                traits.size += rng.gen_range(-eps..=eps);
                traits.speed += rng.gen_range(-eps..=eps);
                traits.sense += rng.gen_range(-eps..=eps);
            }
        }
        traits.clamped(config.trait_min, config.trait_max)
    }

    pub fn tick(&mut self) {
        self.age += 1;
    }

    fn die(&mut self) {
        self.state = AgentState::Dead;
        self.path.clear();
        self.path_elapsed = 0.0;
    }
}

/// Owns every agent: a dense array of slots plus an id index.
///
/// Each slot carries its own mutex so workers can update different agents
/// concurrently while the registry itself is only read-locked. When two slots
/// are needed at once they are locked in ascending id order.
#[derive(Default)]
pub struct AgentRegistry {
    slots: Vec<Mutex<AgentRecord>>,
    index: HashMap<AgentId, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: AgentRecord) {
        let id = record.id;
        if let Some(&slot) = self.index.get(&id) {
            *self.slots[slot].get_mut() = record;
            return;
        }
        self.index.insert(id, self.slots.len());
        self.slots.push(Mutex::new(record));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn living_count(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().is_alive()).count()
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn lock(&self, id: AgentId) -> Option<MutexGuard<'_, AgentRecord>> {
        self.index.get(&id).map(|&slot| self.slots[slot].lock())
    }

    /// Lock two distinct agents, lower id first. Guards come back in argument order.
    pub fn lock_pair(
        &self,
        a: AgentId,
        b: AgentId,
    ) -> Option<(MutexGuard<'_, AgentRecord>, MutexGuard<'_, AgentRecord>)> {
        if a == b {
            return None;
        }
        let slot_a = *self.index.get(&a)?;
        let slot_b = *self.index.get(&b)?;
        if a < b {
            let guard_a = self.slots[slot_a].lock();
            let guard_b = self.slots[slot_b].lock();
            Some((guard_a, guard_b))
        } else {
            let guard_b = self.slots[slot_b].lock();
            let guard_a = self.slots[slot_a].lock();
            Some((guard_a, guard_b))
        }
    }

    pub fn get_mut(&mut self, id: AgentId) -> Option<&mut AgentRecord> {
        let slot = *self.index.get(&id)?;
        Some(self.slots[slot].get_mut())
    }

    /// All ids, ascending
    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Clones of every record, ascending by id
    pub fn snapshot(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self.slots.iter().map(|s| s.lock().clone()).collect();
        records.sort_unstable_by_key(|r| r.id);
        records
    }

    /// Remove every agent, returned ascending by id
    pub fn drain(&mut self) -> Vec<AgentRecord> {
        self.index.clear();
        let mut records: Vec<AgentRecord> = self.slots.drain(..).map(|s| s.into_inner()).collect();
        records.sort_unstable_by_key(|r| r.id);
        records
    }

    /// Remove every dead agent, returned ascending by id
    pub fn remove_dead(&mut self) -> Vec<AgentRecord> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.slots.len());
        for slot in self.slots.drain(..) {
            let record = slot.into_inner();
            if record.is_alive() {
                kept.push(Mutex::new(record));
            } else {
                removed.push(record);
            }
        }
        self.slots = kept;
        self.index = self
            .slots
            .iter_mut()
            .enumerate()
            .map(|(i, s)| (s.get_mut().id, i))
            .collect();
        removed.sort_unstable_by_key(|r| r.id);
        removed
    }
}
