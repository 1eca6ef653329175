//! Per-species behaviour, dispatched through a static table.

use crate::agent::AgentRecord;
use crate::partition::AgentSnapshot;
use eco_core::{Direction, Position, Species};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

/// Rabbits path toward grass whose fill fraction is at least this
const GRASS_SEARCH_QUALITY: f32 = 0.3;
/// Rabbits graze once their cell is fuller than this
const RABBIT_GRAZE_FRACTION: f32 = 0.1;
/// Hungry foxes graze once their cell is fuller than this
const FOX_GRAZE_FRACTION: f32 = 0.2;
/// Foxes go hungry below this energy ratio
const FOX_HUNGER_RATIO: f32 = 0.1;

/// What an agent's behaviour sees of the world during the agent phase
pub trait WorldView {
    fn in_bounds(&self, pos: Position) -> bool;

    fn grass_fraction(&self, pos: Position) -> f32;

    /// The agent standing on `pos` at the start of the tick, if any
    fn agent_at(&self, pos: Position) -> Option<AgentSnapshot>;

    /// Minimum predator/prey size ratio for a kill
    fn predation_size_ratio(&self) -> f32;

    fn shortest_path(&mut self, src: Position, dest: Position) -> Vec<Position>;

    fn best_resource(&mut self, src: Position, radius: f32, min_quality: f32) -> Option<Position>;

    fn rng(&mut self) -> &mut ChaCha8Rng;
}

/// Outcome of one behaviour update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Wait,
    Eat,
}

pub type BehaviorFn = fn(&mut AgentRecord, &mut dyn WorldView) -> Intent;

/// Static description of a species
#[derive(Clone, Copy)]
pub struct SpeciesBehavior {
    pub species: Species,
    /// Species this one may eat
    pub diet: &'static [Species],
    pub update: BehaviorFn,
}

impl SpeciesBehavior {
    pub fn eats(&self, prey: Species) -> bool {
        self.diet.contains(&prey)
    }
}

static BEHAVIORS: [SpeciesBehavior; 2] = [
    SpeciesBehavior {
        species: Species::Rabbit,
        diet: &[],
        update: rabbit_update,
    },
    SpeciesBehavior {
        species: Species::Fox,
        diet: &[Species::Rabbit],
        update: fox_update,
    },
];

pub fn behavior_of(species: Species) -> &'static SpeciesBehavior {
    match species {
        Species::Rabbit => &BEHAVIORS[0],
        Species::Fox => &BEHAVIORS[1],
    }
}

fn rabbit_update(agent: &mut AgentRecord, world: &mut dyn WorldView) -> Intent {
    let pos = agent.position;
    if !agent.memory.searching {
        agent.memory.searching = true;
        let best = world.best_resource(pos, agent.traits.sense, GRASS_SEARCH_QUALITY);
        match best {
            Some(target) if below_replication_level(agent) => {
                let path = world.shortest_path(pos, target);
                assign_path(agent, path);
            }
            _ => wander(agent, world),
        }
        return Intent::Wait;
    }

    if !agent.has_pending_path() {
        agent.memory.searching = false;
    }
    if world.grass_fraction(pos) > RABBIT_GRAZE_FRACTION {
        Intent::Eat
    } else {
        Intent::Wait
    }
}

fn fox_update(agent: &mut AgentRecord, world: &mut dyn WorldView) -> Intent {
    let pos = agent.position;
    let hungry = agent.energy.current < FOX_HUNGER_RATIO * agent.energy.max;

    if !agent.memory.searching {
        agent.memory.searching = true;
        if let Some(prey) = scan_for_prey(agent, world) {
            let path = world.shortest_path(pos, prey);
            assign_path(agent, path);
            agent.memory.prey_found = true;
        } else if hungry {
            if let Some(target) = world.best_resource(pos, agent.traits.sense, GRASS_SEARCH_QUALITY) {
                if below_replication_level(agent) {
                    let path = world.shortest_path(pos, target);
                    assign_path(agent, path);
                }
            }
        }
        return Intent::Wait;
    }

    let intent = if agent.memory.prey_found {
        if hungry || !agent.has_pending_path() {
            Intent::Eat
        } else {
            Intent::Wait
        }
    } else if hungry && world.grass_fraction(pos) > FOX_GRAZE_FRACTION {
        Intent::Eat
    } else {
        Intent::Wait
    };

    if !agent.has_pending_path() {
        agent.memory.searching = false;
        agent.memory.prey_found = false;
    }
    intent
}

/// Ring-by-ring scan along the eight compass rays for edible prey
fn scan_for_prey(agent: &AgentRecord, world: &dyn WorldView) -> Option<Position> {
    let behavior = behavior_of(agent.species);
    let ratio = world.predation_size_ratio();
    let reach = agent.traits.sense.floor() as i32;
    for radius in 1..=reach {
        for direction in Direction::all() {
            let (dx, dy) = direction.to_delta();
            let cell = agent.position.add(dx * radius, dy * radius);
            if !world.in_bounds(cell) {
                continue;
            }
            let Some(other) = world.agent_at(cell) else {
                continue;
            };
            if other.id == agent.id || !behavior.eats(other.species) || other.size <= 0.0 {
                continue;
            }
            if agent.traits.size / other.size >= ratio {
                return Some(cell);
            }
        }
    }
    None
}

/// One step to a random in-bounds neighbour
fn wander(agent: &mut AgentRecord, world: &mut dyn WorldView) {
    let pos = agent.position;
    let candidates: Vec<Position> = pos.neighbors().filter(|&p| world.in_bounds(p)).collect();
    let Some(&target) = candidates.choose(world.rng()) else {
        return;
    };
    let path = world.shortest_path(pos, target);
    assign_path(agent, path);
}

fn below_replication_level(agent: &AgentRecord) -> bool {
    agent.energy.current < agent.energy.max * agent.evolution.replication_threshold
}

fn assign_path(agent: &mut AgentRecord, path: Vec<Position>) {
    if !path.is_empty() {
        agent.set_path(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eco_core::{AgentId, EvolutionParams, Traits};
    use rand::SeedableRng;
    use std::collections::HashMap;

    struct StubWorld {
        width: i32,
        height: i32,
        grass: HashMap<Position, f32>,
        agents: HashMap<Position, AgentSnapshot>,
        best: Option<Position>,
        rng: ChaCha8Rng,
        searches: usize,
    }

    impl StubWorld {
        fn new() -> Self {
            Self {
                width: 10,
                height: 10,
                grass: HashMap::new(),
                agents: HashMap::new(),
                best: None,
                rng: ChaCha8Rng::seed_from_u64(3),
                searches: 0,
            }
        }
    }

    impl WorldView for StubWorld {
        fn in_bounds(&self, pos: Position) -> bool {
            pos.in_bounds(self.width, self.height)
        }

        fn grass_fraction(&self, pos: Position) -> f32 {
            self.grass.get(&pos).copied().unwrap_or(0.0)
        }

        fn agent_at(&self, pos: Position) -> Option<AgentSnapshot> {
            self.agents.get(&pos).copied()
        }

        fn predation_size_ratio(&self) -> f32 {
            1.2
        }

        fn shortest_path(&mut self, src: Position, dest: Position) -> Vec<Position> {
            // Straight-line stand-in: good enough for behaviour tests
            let mut path = Vec::new();
            let mut cur = src;
            while cur != dest {
                cur = cur.add((dest.x - cur.x).signum(), (dest.y - cur.y).signum());
                path.push(cur);
            }
            path
        }

        fn best_resource(&mut self, _src: Position, _radius: f32, _min_quality: f32) -> Option<Position> {
            self.searches += 1;
            self.best
        }

        fn rng(&mut self) -> &mut ChaCha8Rng {
            &mut self.rng
        }
    }

    fn agent(species: Species, pos: Position, energy: f32, max: f32, size: f32) -> AgentRecord {
        AgentRecord::new(
            AgentId(1),
            species,
            pos,
            Traits::new(size, 1.0, 4.0),
            EvolutionParams::new(0.7, 0.5, 0.5),
            (energy, max).into(),
            (500.0, 1000.0).into(),
            0,
        )
    }

    fn snapshot(id: u64, species: Species, pos: Position, size: f32) -> AgentSnapshot {
        AgentSnapshot {
            id: AgentId(id),
            species,
            position: pos,
            size,
            energy_ratio: 0.5,
        }
    }

    #[test]
    fn test_dispatch_table() {
        assert!(behavior_of(Species::Fox).eats(Species::Rabbit));
        assert!(!behavior_of(Species::Rabbit).eats(Species::Fox));
        assert_eq!(behavior_of(Species::Rabbit).species, Species::Rabbit);
    }

    #[test]
    fn test_rabbit_paths_to_grass_when_below_threshold() {
        let mut world = StubWorld::new();
        world.best = Some(Position::new(4, 2));
        let mut rabbit = agent(Species::Rabbit, Position::new(2, 2), 300.0, 1000.0, 1.0);

        let intent = (behavior_of(Species::Rabbit).update)(&mut rabbit, &mut world);
        assert_eq!(intent, Intent::Wait);
        assert!(rabbit.memory.searching);
        assert_eq!(rabbit.pending_destination(), Some(Position::new(4, 2)));
    }

    #[test]
    fn test_well_fed_rabbit_wanders() {
        let mut world = StubWorld::new();
        world.best = Some(Position::new(4, 2));
        let mut rabbit = agent(Species::Rabbit, Position::new(0, 0), 900.0, 1000.0, 1.0);

        rabbit_update(&mut rabbit, &mut world);
        let dest = rabbit.pending_destination().unwrap();
        assert_eq!(dest.chebyshev_distance(&Position::new(0, 0)), 1);
        assert!(world.in_bounds(dest));
    }

    #[test]
    fn test_rabbit_grazes_while_searching() {
        let mut world = StubWorld::new();
        let pos = Position::new(5, 5);
        let mut rabbit = agent(Species::Rabbit, pos, 300.0, 1000.0, 1.0);
        rabbit.memory.searching = true;

        assert_eq!(rabbit_update(&mut rabbit, &mut world), Intent::Wait);
        assert!(!rabbit.memory.searching);

        rabbit.memory.searching = true;
        world.grass.insert(pos, 0.5);
        assert_eq!(rabbit_update(&mut rabbit, &mut world), Intent::Eat);
    }

    #[test]
    fn test_fox_hunts_smaller_rabbit() {
        let mut world = StubWorld::new();
        let prey_pos = Position::new(5, 3);
        world.agents.insert(prey_pos, snapshot(2, Species::Rabbit, prey_pos, 1.0));
        let mut fox = agent(Species::Fox, Position::new(5, 5), 1800.0, 2000.0, 1.5);

        fox_update(&mut fox, &mut world);
        assert!(fox.memory.prey_found);
        assert_eq!(fox.pending_destination(), Some(prey_pos));

        // Walk the path, then the next update eats
        let config = eco_core::EnergyConfig::default();
        fox.advance(10.0, &config);
        assert_eq!(fox.position, prey_pos);
        assert_eq!(fox_update(&mut fox, &mut world), Intent::Eat);
        assert!(!fox.memory.searching);
        assert!(!fox.memory.prey_found);
    }

    #[test]
    fn test_fox_ignores_large_rabbits_and_foxes() {
        let mut world = StubWorld::new();
        let a = Position::new(5, 4);
        let b = Position::new(6, 5);
        world.agents.insert(a, snapshot(2, Species::Rabbit, a, 1.4));
        world.agents.insert(b, snapshot(3, Species::Fox, b, 0.5));
        let mut fox = agent(Species::Fox, Position::new(5, 5), 1800.0, 2000.0, 1.5);

        fox_update(&mut fox, &mut world);
        assert!(!fox.memory.prey_found);
        assert!(!fox.has_pending_path());
        // Not hungry: no grass search either
        assert_eq!(world.searches, 0);
    }

    #[test]
    fn test_hungry_fox_looks_for_grass() {
        let mut world = StubWorld::new();
        world.best = Some(Position::new(7, 5));
        let mut fox = agent(Species::Fox, Position::new(5, 5), 100.0, 2000.0, 1.5);

        fox_update(&mut fox, &mut world);
        assert_eq!(world.searches, 1);
        assert_eq!(fox.pending_destination(), Some(Position::new(7, 5)));

        fox.advance(10.0, &eco_core::EnergyConfig::default());
        world.grass.insert(fox.position, 0.5);
        assert_eq!(fox_update(&mut fox, &mut world), Intent::Eat);
    }
}
