//! Population statistics and run counters.

use crate::types::{Species, Traits};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Trait averages and head count for one species at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeciesSample {
    pub count: usize,
    pub avg_size: f32,
    pub avg_speed: f32,
    pub avg_sense: f32,
}

impl SpeciesSample {
    pub fn from_traits<'a>(traits: impl IntoIterator<Item = &'a Traits>) -> Self {
        let mut sample = SpeciesSample::default();
        for t in traits {
            let n = sample.count as f32;
            let new_n = n + 1.0;
            // Incremental mean
            sample.avg_size = (sample.avg_size * n + t.size) / new_n;
            sample.avg_speed = (sample.avg_speed * n + t.speed) / new_n;
            sample.avg_sense = (sample.avg_sense * n + t.sense) / new_n;
            sample.count += 1;
        }
        sample
    }
}

/// One row of the population log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationSample {
    pub tick: u64,
    pub rabbits: SpeciesSample,
    pub foxes: SpeciesSample,
    /// Mean grass fill across the grid (0.0 to 1.0)
    pub grass_fraction: f32,
}

impl PopulationSample {
    pub fn species(&self, species: Species) -> &SpeciesSample {
        match species {
            Species::Rabbit => &self.rabbits,
            Species::Fox => &self.foxes,
        }
    }

    pub fn total(&self) -> usize {
        self.rabbits.count + self.foxes.count
    }
}

/// Rolling window of population samples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationLog {
    window: usize,
    samples: VecDeque<PopulationSample>,
}

impl PopulationLog {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
        }
    }

    /// Append a sample, evicting the oldest once the window is full
    pub fn record(&mut self, sample: PopulationSample) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&PopulationSample> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &PopulationSample> {
        self.samples.iter()
    }

    /// Average head count of a species over the window
    pub fn mean_count(&self, species: Species) -> f32 {
        self.mean_of(|s| s.species(species).count as f32)
    }

    pub fn mean_size(&self, species: Species) -> f32 {
        self.mean_of(|s| s.species(species).avg_size)
    }

    pub fn mean_speed(&self, species: Species) -> f32 {
        self.mean_of(|s| s.species(species).avg_speed)
    }

    pub fn mean_sense(&self, species: Species) -> f32 {
        self.mean_of(|s| s.species(species).avg_sense)
    }

    pub fn mean_grass_fraction(&self) -> f32 {
        self.mean_of(|s| s.grass_fraction)
    }

    fn mean_of(&self, f: impl Fn(&PopulationSample) -> f32) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(f).sum::<f32>() / self.samples.len() as f32
    }
}

/// Cumulative counters over a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationCounters {
    pub births: u64,
    pub deaths: u64,
    pub predations: u64,
    pub replication_attempts: u64,
    pub replication_successes: u64,
    pub peak_population: usize,
}

impl SimulationCounters {
    pub fn observe_population(&mut self, population: usize) {
        self.peak_population = self.peak_population.max(population);
    }

    pub fn replication_success_rate(&self) -> f64 {
        if self.replication_attempts == 0 {
            0.0
        } else {
            self.replication_successes as f64 / self.replication_attempts as f64
        }
    }
}
