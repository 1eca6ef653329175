use eco_core::{
    AgentId, EvolutionParams, ExecutionMode, Position, SimulationConfig, SpawnGroup, Species, Traits,
};
use eco_world::agent::{AgentRecord, AgentRegistry};
use eco_world::partition::{PartitionIndex, SpatialPartitioner};
use eco_world::SimulationEngine;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;

fn busy_config(mode: ExecutionMode) -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.seed = 7;
    config.dt = 0.25;
    config.num_ticks = 40;
    config.terrain.width = 24;
    config.terrain.height = 24;
    config.terrain.initial_grass_coverage = 0.6;
    config.terrain.obstacle_density = 0.05;
    config.scheduler.mode = mode;
    config.scheduler.partition_size = 8;
    config.species.rabbit.evolution = EvolutionParams::new(0.6, 0.5, 0.75);
    config.population.groups = vec![
        SpawnGroup {
            species: Species::Rabbit,
            count: 30,
            traits: None,
        },
        SpawnGroup {
            species: Species::Fox,
            count: 5,
            traits: None,
        },
    ];
    config.log.sample_interval = 5;
    config.log.metrics_interval = 20;
    config
}

fn run_fingerprint(mode: ExecutionMode) -> (String, u64, usize) {
    let mut engine = SimulationEngine::new(busy_config(mode)).unwrap();
    assert_eq!(engine.spawn_initial_population(), 35);
    let summary = engine.run();
    let agents = serde_json::to_string(&engine.agents()).unwrap();
    (agents, engine.total_grid_energy().to_bits(), summary.population)
}

#[test]
fn test_partitioned_matches_sequential() {
    let sequential = run_fingerprint(ExecutionMode::Sequential);
    let single = run_fingerprint(ExecutionMode::Partitioned { workers: 1 });
    let pooled = run_fingerprint(ExecutionMode::Partitioned { workers: 4 });
    assert_eq!(sequential, single);
    assert_eq!(sequential, pooled);
}

#[test]
fn test_occupancy_stays_consistent() {
    let mut engine = SimulationEngine::new(busy_config(ExecutionMode::Partitioned { workers: 3 })).unwrap();
    engine.spawn_initial_population();
    for _ in 0..30 {
        engine.tick(0.25);
        let living: Vec<_> = engine.agents().into_iter().filter(|a| a.is_alive()).collect();
        let cells: HashSet<Position> = living.iter().map(|a| a.position).collect();
        assert_eq!(cells.len(), living.len(), "two agents share a cell");
        for agent in &living {
            assert_eq!(engine.occupant(agent.position), Some(agent.id));
            assert!(engine.view_terrain(|grid| grid.is_passable(agent.position)));
        }
        assert_eq!(engine.view_terrain(|grid| grid.occupied_count()), living.len());
    }
}

#[test]
fn test_starved_population_returns_to_soil() {
    let mut engine = SimulationEngine::new(busy_config(ExecutionMode::Partitioned { workers: 2 })).unwrap();
    engine.spawn_initial_population();
    let expected: f32 = engine
        .agents()
        .iter()
        .map(|a| a.energy.max * engine.config().energy.death_threshold)
        .sum();
    // Spend exactly what each agent holds so nothing overshoots into the soil
    for agent in engine.agents() {
        assert_eq!(engine.consume_energy(agent.id, agent.energy.current), 0.0);
    }
    let before = engine.total_grid_energy();

    let report = engine.tick(0.0);
    assert_eq!(report.deaths, 35);
    assert_eq!(report.population, 0);
    assert_eq!(engine.view_terrain(|grid| grid.occupied_count()), 0);
    let deposited = engine.total_grid_energy() - before;
    assert!((deposited - expected as f64).abs() < 1.0, "deposited {deposited}, expected {expected}");
}

#[test]
fn test_fox_kills_smaller_rabbit_during_tick() {
    let mut config = busy_config(ExecutionMode::Partitioned { workers: 2 });
    config.population.groups.clear();
    config.terrain.initial_grass_coverage = 0.0;
    config.terrain.obstacle_density = 0.0;
    let mut engine = SimulationEngine::new(config).unwrap();

    let never = EvolutionParams::new(2.0, 0.0, 0.0);
    let rabbit = engine
        .spawn(Position::new(8, 8), Traits::new(1.0, 0.01, 1.0), never, Species::Rabbit)
        .unwrap();
    let fox = engine
        .spawn(Position::new(7, 8), Traits::new(1.5, 1.0, 3.0), never, Species::Fox)
        .unwrap();
    // A hungry fox hunts instead of resting
    engine.consume_energy(fox, 1500.0);

    let mut killed = false;
    for _ in 0..20 {
        engine.tick(0.5);
        if engine.agent(rabbit).is_none() {
            killed = true;
            break;
        }
    }
    assert!(killed, "fox never caught the rabbit");
    assert!(engine.counters().predations >= 1);
    assert!(engine.agent(fox).unwrap().energy.current > 100.0);
}

#[test]
fn test_cancelled_run_stops_immediately() {
    let mut engine = SimulationEngine::new(busy_config(ExecutionMode::Sequential)).unwrap();
    engine.spawn_initial_population();
    let summary = engine.run_with_cancel(&AtomicBool::new(true));
    assert!(summary.cancelled);
    assert_eq!(summary.ticks_run, 0);
    assert_eq!(summary.population, 35);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["population"], 35);
}

#[test]
fn test_population_log_sampling() {
    let mut engine = SimulationEngine::new(busy_config(ExecutionMode::Sequential)).unwrap();
    engine.spawn_initial_population();
    for _ in 0..11 {
        engine.tick(0.25);
    }
    assert_eq!(engine.current_tick(), 11);
    // Samples at ticks 0, 5 and 10
    assert_eq!(engine.population_log().len(), 3);
    assert_eq!(engine.population_log().latest().unwrap().tick, 10);
    assert!(engine.population_log().mean_count(Species::Rabbit) > 0.0);
}

#[test]
fn test_config_round_trip_builds_same_world() {
    let config = busy_config(ExecutionMode::Sequential);
    let json = config.to_json().unwrap();
    let parsed: SimulationConfig = serde_json::from_str(&json).unwrap();
    let a = SimulationEngine::new(config).unwrap();
    let b = SimulationEngine::new(parsed).unwrap();
    assert_eq!(a.total_grid_energy(), b.total_grid_energy());
}

#[test]
fn test_zero_workers_rejected() {
    let config = busy_config(ExecutionMode::Partitioned { workers: 0 });
    assert!(SimulationEngine::new(config).is_err());
}

fn registry_from(cells: &[(i32, i32)]) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for (i, &(x, y)) in cells.iter().enumerate() {
        registry.insert(AgentRecord::new(
            AgentId(i as u64),
            if i % 3 == 0 { Species::Fox } else { Species::Rabbit },
            Position::new(x, y),
            Traits::default(),
            EvolutionParams::new(0.7, 0.0, 0.0),
            (100.0, 200.0).into(),
            (100.0, 200.0).into(),
            0,
        ));
    }
    registry
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_rebuild_is_idempotent(
        cells in prop::collection::hash_set((0i32..20, 0i32..20), 0..40)
    ) {
        let cells: Vec<_> = cells.into_iter().collect();
        let registry = registry_from(&cells);
        let index = PartitionIndex::new(SpatialPartitioner::new(20, 20, 6));

        index.rebuild(&registry);
        let first: Vec<_> = index.partitioner().ids().map(|p| index.member_ids(p)).collect();
        index.rebuild(&registry);
        let second: Vec<_> = index.partitioner().ids().map(|p| index.member_ids(p)).collect();
        prop_assert_eq!(&first, &second);

        let total: usize = first.iter().map(Vec::len).sum();
        prop_assert_eq!(total, cells.len());
    }
}
