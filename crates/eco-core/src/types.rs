//! Core type definitions for the simulation.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SQRT_2: f32 = std::f32::consts::SQRT_2;

/// Stable identifier for an agent, never reused within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier for a spatial partition (row-major tile index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub usize);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// 2D cell coordinate on the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn add(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
        }
    }

    pub fn step(&self, direction: Direction) -> Self {
        let (dx, dy) = direction.to_delta();
        self.add(dx, dy)
    }

    pub fn in_bounds(&self, width: i32, height: i32) -> bool {
        self.x >= 0 && self.y >= 0 && self.x < width && self.y < height
    }

    /// Absolute per-axis offsets, widened so any two positions subtract safely
    fn deltas(&self, other: &Position) -> (i64, i64) {
        (
            (self.x as i64 - other.x as i64).abs(),
            (self.y as i64 - other.y as i64).abs(),
        )
    }

    /// Octile distance: orthogonal steps cost 1, diagonal steps cost sqrt(2)
    pub fn octile_distance(&self, other: &Position) -> f32 {
        let (dx, dy) = self.deltas(other);
        let (dx, dy) = (dx as f32, dy as f32);
        dx.max(dy) + (SQRT_2 - 1.0) * dx.min(dy)
    }

    pub fn euclidean_distance(&self, other: &Position) -> f32 {
        let (dx, dy) = self.deltas(other);
        let (dx, dy) = (dx as f64, dy as f64);
        (dx * dx + dy * dy).sqrt() as f32
    }

    /// Chebyshev distance, saturating at `i32::MAX` for far-apart extremes
    pub fn chebyshev_distance(&self, other: &Position) -> i32 {
        let (dx, dy) = self.deltas(other);
        i32::try_from(dx.max(dy)).unwrap_or(i32::MAX)
    }

    /// The eight surrounding cells in fixed scan order (may lie off-grid)
    pub fn neighbors(&self) -> impl Iterator<Item = Position> + '_ {
        Direction::all().into_iter().map(move |d| self.step(d))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Direction for movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    North,
    South,
    East,
    West,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
}

impl Direction {
    pub fn to_delta(&self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
            Direction::NorthEast => (1, -1),
            Direction::NorthWest => (-1, -1),
            Direction::SouthEast => (1, 1),
            Direction::SouthWest => (-1, 1),
        }
    }

    pub fn is_diagonal(&self) -> bool {
        let (dx, dy) = self.to_delta();
        dx != 0 && dy != 0
    }

    /// Traversal cost of one step in this direction
    pub fn step_cost(&self) -> f32 {
        if self.is_diagonal() {
            SQRT_2
        } else {
            1.0
        }
    }

    /// All directions in scan order: row above left to right, then the
    /// middle row, then the row below.
    pub fn all() -> [Direction; 8] {
        [
            Direction::NorthWest,
            Direction::North,
            Direction::NorthEast,
            Direction::West,
            Direction::East,
            Direction::SouthWest,
            Direction::South,
            Direction::SouthEast,
        ]
    }
}

/// Axis-aligned rectangle of cells, `max` bounds exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl Region {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn contains(&self, pos: Position) -> bool {
        pos.x >= self.min_x && pos.x < self.max_x && pos.y >= self.min_y && pos.y < self.max_y
    }

    pub fn width(&self) -> i32 {
        (self.max_x - self.min_x).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.max_y - self.min_y).max(0)
    }

    pub fn area(&self) -> usize {
        (self.width() * self.height()) as usize
    }

    /// Row-major iterator over the cells of the region
    pub fn positions(&self) -> impl Iterator<Item = Position> {
        let region = *self;
        (region.min_y..region.max_y)
            .flat_map(move |y| (region.min_x..region.max_x).map(move |x| Position::new(x, y)))
    }
}

/// Species tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Species {
    Rabbit,
    Fox,
}

impl Species {
    pub fn all() -> [Species; 2] {
        [Species::Rabbit, Species::Fox]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Species::Rabbit => "rabbit",
            Species::Fox => "fox",
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Heritable body traits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Traits {
    pub size: f32,
    pub speed: f32,
    pub sense: f32,
}

impl Traits {
    pub fn new(size: f32, speed: f32, sense: f32) -> Self {
        Self { size, speed, sense }
    }

    pub fn is_finite(&self) -> bool {
        self.size.is_finite() && self.speed.is_finite() && self.sense.is_finite()
    }

    /// Clamp every trait into `[min, max]`; a NaN trait falls to `min`
    pub fn clamped(&self, min: f32, max: f32) -> Self {
        let clamp = |v: f32| if v.is_nan() { min } else { v.clamp(min, max) };
        Self {
            size: clamp(self.size),
            speed: clamp(self.speed),
            sense: clamp(self.sense),
        }
    }
}

impl Default for Traits {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }
}

/// Reproduction parameters carried by every agent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvolutionParams {
    /// Energy ratio at or above which a meal triggers a replication attempt
    pub replication_threshold: f32,
    /// Probability that a replication attempt goes ahead
    pub replication_chance: f32,
    /// Probability that an offspring's traits are perturbed
    pub mutation_chance: f32,
}

impl EvolutionParams {
    pub fn new(replication_threshold: f32, replication_chance: f32, mutation_chance: f32) -> Self {
        Self {
            replication_threshold,
            replication_chance,
            mutation_chance,
        }
    }
}

/// Purpose tags mixed into derived random streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSalt {
    Behavior = 1,
    Replication = 2,
    Terrain = 3,
    Spawn = 4,
    Query = 5,
}

/// Derive an independent random stream for `(seed, tick, subject, salt)`.
///
/// Streams depend only on their inputs, never on which worker thread asks
/// for them or in which order, so partitioned ticks reproduce sequential ones.
pub fn stream_rng(seed: u64, tick: u64, subject: u64, salt: StreamSalt) -> ChaCha8Rng {
    let mut h = mix64(seed ^ 0x9E37_79B9_7F4A_7C15);
    h = mix64(h ^ tick);
    h = mix64(h ^ subject);
    h = mix64(h ^ salt as u64);
    ChaCha8Rng::seed_from_u64(h)
}

fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
