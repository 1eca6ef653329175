//! Terrain grid: per-cell grass, fertilizer and occupancy layers.
//!
//! Grass and fertilizer are stored as `f32` bit patterns in atomics so that a
//! single cell can be updated through a shared reference (an agent grazing
//! while other readers hold the terrain lock).
//!
//! Growth runs in three passes, each of which may be split into disjoint
//! regions and run concurrently under the terrain read lock. A region task
//! only writes cells inside its region and only reads what earlier passes
//! wrote, so regions never race:
//!
//! 1. plan: regenerate fertilizer and decide how much grass each cell grows
//!    and where that growth lands (itself, or its least-grassy unsaturated
//!    neighbour when the cell is already saturated);
//! 2. absorb: every cell takes in what was routed to it, up to its capacity;
//! 3. settle: every source pays fertilizer for exactly what its target
//!    absorbed.

use crate::scheduler::rwlock::{TerrainLock, TerrainReadGuard, TerrainWriteGuard};
use eco_core::{AgentId, Position, Region, TerrainConfig};
use parking_lot::{Mutex, MutexGuard};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

const NO_TARGET: usize = usize::MAX;

/// A layer of `f32` values addressable through `&self`
#[derive(Debug)]
pub struct CellField {
    cells: Vec<AtomicU32>,
}

impl CellField {
    pub fn new(len: usize, value: f32) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU32::new(value.to_bits())).collect(),
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> f32 {
        f32::from_bits(self.cells[index].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, index: usize, value: f32) {
        self.cells[index].store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn sum(&self) -> f64 {
        (0..self.cells.len()).map(|i| self.get(i) as f64).sum()
    }
}

/// Which agent holds each cell, if any
#[derive(Debug)]
pub struct OccupancyLayer {
    // 0 = vacant, otherwise agent id + 1
    cells: Vec<AtomicU64>,
}

impl OccupancyLayer {
    pub fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn get(&self, index: usize) -> Option<AgentId> {
        match self.cells[index].load(Ordering::Acquire) {
            0 => None,
            raw => Some(AgentId(raw - 1)),
        }
    }

    /// Take a vacant cell. Fails if anyone already holds it.
    pub fn claim(&self, index: usize, id: AgentId) -> bool {
        self.cells[index]
            .compare_exchange(0, id.0 + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give a cell back. Fails if `id` does not hold it.
    pub fn release(&self, index: usize, id: AgentId) -> bool {
        self.cells[index]
            .compare_exchange(id.0 + 1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn occupied_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) != 0)
            .count()
    }
}

/// Scratch arrays for the growth passes, rewritten every update
#[derive(Debug)]
struct GrowthScratch {
    intent: CellField,
    target: Vec<AtomicUsize>,
    scale: CellField,
}

impl GrowthScratch {
    fn new(len: usize) -> Self {
        Self {
            intent: CellField::new(len, 0.0),
            target: (0..len).map(|_| AtomicUsize::new(NO_TARGET)).collect(),
            scale: CellField::new(len, 0.0),
        }
    }

    fn target(&self, index: usize) -> usize {
        self.target[index].load(Ordering::Relaxed)
    }

    fn set_target(&self, index: usize, target: usize) {
        self.target[index].store(target, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct TerrainGrid {
    width: i32,
    height: i32,
    grass: CellField,
    fertilizer: CellField,
    grass_rate: Vec<f32>,
    fertilizer_rate: Vec<f32>,
    grass_threshold: Vec<(f32, f32)>,
    fertilizer_threshold: Vec<(f32, f32)>,
    obstacles: Vec<bool>,
    occupancy: OccupancyLayer,
    scratch: GrowthScratch,
}

impl TerrainGrid {
    /// Bare grid: no grass, no fertilizer, zero rates
    pub fn new(width: i32, height: i32, grass_max: f32, fertilizer_max: f32) -> Self {
        let size = (width.max(0) * height.max(0)) as usize;
        Self {
            width,
            height,
            grass: CellField::new(size, 0.0),
            fertilizer: CellField::new(size, 0.0),
            grass_rate: vec![0.0; size],
            fertilizer_rate: vec![0.0; size],
            grass_threshold: vec![(0.0, grass_max); size],
            fertilizer_threshold: vec![(0.0, fertilizer_max); size],
            obstacles: vec![false; size],
            occupancy: OccupancyLayer::new(size),
            scratch: GrowthScratch::new(size),
        }
    }

    /// Draw rates, obstacles, the fertilizer gradient and the initial grass patch
    pub fn from_config(config: &TerrainConfig, rng: &mut ChaCha8Rng) -> Self {
        let mut grid = Self::new(
            config.width,
            config.height,
            config.grass_max,
            config.fertilizer_max,
        );

        for i in 0..grid.cell_count() {
            grid.grass_rate[i] = sample_range(rng, config.grass_rate_range);
            grid.fertilizer_rate[i] = sample_range(rng, config.fertilizer_rate_range);
            grid.obstacles[i] = rng.gen::<f32>() < config.obstacle_density;
        }

        // Fertilizer falls off linearly from the centre of the grid
        let centre = Position::new(config.width / 2, config.height / 2);
        let max_d = Position::new(0, 0).euclidean_distance(&centre);
        for i in 0..grid.cell_count() {
            let pos = grid.position_of(i);
            let fraction = if max_d > 0.0 {
                (1.0 - pos.euclidean_distance(&centre) / max_d).clamp(0.0, 1.0)
            } else {
                1.0
            };
            let (lo, hi) = grid.fertilizer_threshold[i];
            grid.fertilizer.set(i, lo + fraction * (hi - lo));
        }

        let mut open: Vec<usize> = (0..grid.cell_count())
            .filter(|&i| !grid.obstacles[i])
            .collect();
        open.shuffle(rng);
        let seeded = ((config.initial_grass_coverage * grid.cell_count() as f32) as usize).min(open.len());
        for &i in &open[..seeded] {
            let (lo, hi) = grid.grass_threshold[i];
            let fraction = sample_range(rng, config.initial_grass_range);
            grid.grass.set(i, (lo + fraction * (hi - lo)).clamp(lo, hi));
        }

        grid
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn cell_count(&self) -> usize {
        self.obstacles.len()
    }

    pub fn bounds(&self) -> Region {
        Region::new(0, 0, self.width, self.height)
    }

    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.in_bounds(self.width, self.height)
    }

    pub fn index(&self, pos: Position) -> Option<usize> {
        if self.in_bounds(pos) {
            Some((pos.y * self.width + pos.x) as usize)
        } else {
            None
        }
    }

    pub fn position_of(&self, index: usize) -> Position {
        let x = (index as i32) % self.width;
        let y = (index as i32) / self.width;
        Position::new(x, y)
    }

    /// In bounds and not an obstacle
    pub fn is_passable(&self, pos: Position) -> bool {
        self.index(pos).map_or(false, |i| !self.obstacles[i])
    }

    pub fn is_obstacle(&self, pos: Position) -> bool {
        self.index(pos).map_or(false, |i| self.obstacles[i])
    }

    pub fn set_obstacle(&mut self, pos: Position, blocked: bool) {
        if let Some(i) = self.index(pos) {
            self.obstacles[i] = blocked;
            if blocked {
                self.grass.set(i, self.grass_threshold[i].0);
            }
        }
    }

    pub fn grass(&self, pos: Position) -> f32 {
        self.index(pos).map_or(0.0, |i| self.grass.get(i))
    }

    pub fn fertilizer(&self, pos: Position) -> f32 {
        self.index(pos).map_or(0.0, |i| self.fertilizer.get(i))
    }

    /// Grass as a fraction of the cell's capacity above its minimum
    pub fn grass_fraction(&self, pos: Position) -> f32 {
        self.index(pos).map_or(0.0, |i| {
            let (lo, hi) = self.grass_threshold[i];
            fraction_of(self.grass.get(i), lo, hi)
        })
    }

    pub fn fertilizer_fraction(&self, pos: Position) -> f32 {
        self.index(pos).map_or(0.0, |i| {
            let (lo, hi) = self.fertilizer_threshold[i];
            fraction_of(self.fertilizer.get(i), lo, hi)
        })
    }

    pub fn grass_threshold(&self, pos: Position) -> Option<(f32, f32)> {
        self.index(pos).map(|i| self.grass_threshold[i])
    }

    pub fn fertilizer_threshold(&self, pos: Position) -> Option<(f32, f32)> {
        self.index(pos).map(|i| self.fertilizer_threshold[i])
    }

    pub fn grass_rate(&self, pos: Position) -> f32 {
        self.index(pos).map_or(0.0, |i| self.grass_rate[i])
    }

    pub fn fertilizer_rate(&self, pos: Position) -> f32 {
        self.index(pos).map_or(0.0, |i| self.fertilizer_rate[i])
    }

    pub fn set_rates(&mut self, pos: Position, grass_rate: f32, fertilizer_rate: f32) {
        if let Some(i) = self.index(pos) {
            self.grass_rate[i] = grass_rate;
            self.fertilizer_rate[i] = fertilizer_rate;
        }
    }

    /// Set grass, clamped into the cell's thresholds
    pub fn set_grass(&self, pos: Position, value: f32) {
        if let Some(i) = self.index(pos) {
            let (lo, hi) = self.grass_threshold[i];
            self.grass.set(i, value.clamp(lo, hi));
        }
    }

    /// Set fertilizer, clamped into the cell's thresholds
    pub fn set_fertilizer(&self, pos: Position, value: f32) {
        if let Some(i) = self.index(pos) {
            let (lo, hi) = self.fertilizer_threshold[i];
            self.fertilizer.set(i, value.clamp(lo, hi));
        }
    }

    pub fn occupant(&self, pos: Position) -> Option<AgentId> {
        self.index(pos).and_then(|i| self.occupancy.get(i))
    }

    pub fn claim_cell(&self, pos: Position, id: AgentId) -> bool {
        self.index(pos).map_or(false, |i| self.occupancy.claim(i, id))
    }

    pub fn release_cell(&self, pos: Position, id: AgentId) -> bool {
        self.index(pos).map_or(false, |i| self.occupancy.release(i, id))
    }

    pub fn occupied_count(&self) -> usize {
        self.occupancy.occupied_count()
    }

    /// Remove up to `fraction` of the cell's capacity above its minimum.
    ///
    /// Returns the amount actually removed; never more than was present and
    /// never drives the cell below its minimum. Callers sharing the grid must
    /// hold the cell's block mutex (see [`CellAccess`]).
    pub fn consume_grass(&self, pos: Position, fraction: f32) -> f32 {
        let Some(i) = self.index(pos) else {
            return 0.0;
        };
        let (lo, hi) = self.grass_threshold[i];
        let current = self.grass.get(i);
        let wanted = (fraction.max(0.0) * (hi - lo)).min(current);
        let remaining = (current - wanted).clamp(lo, hi);
        self.grass.set(i, remaining);
        (current - remaining).max(0.0)
    }

    /// Add fertilizer to a single cell; returns the amount it accepted
    pub fn add_fertilizer(&self, pos: Position, amount: f32) -> f32 {
        let Some(i) = self.index(pos) else {
            return 0.0;
        };
        let (_, hi) = self.fertilizer_threshold[i];
        let current = self.fertilizer.get(i);
        let accepted = amount.max(0.0).min(hi - current).max(0.0);
        self.fertilizer.set(i, current + accepted);
        accepted
    }

    /// Cells a deposit at `origin` spills into: the origin, then square rings
    /// of growing radius, each ring in row-major order.
    pub fn deposit_order(&self, origin: Position) -> impl Iterator<Item = Position> + '_ {
        let max_radius = self.width.max(self.height);
        (0..=max_radius).flat_map(move |r| {
            (-r..=r).flat_map(move |dy| {
                (-r..=r).filter_map(move |dx| {
                    let pos = origin.add(dx, dy);
                    let on_ring = dx.abs().max(dy.abs()) == r;
                    (on_ring && self.in_bounds(pos)).then_some(pos)
                })
            })
        })
    }

    /// Return energy to the soil at `pos`, spilling into surrounding cells
    /// once the cell is full. Returns what could not be placed anywhere.
    pub fn deposit_fertilizer(&self, pos: Position, amount: f32) -> f32 {
        if !self.in_bounds(pos) {
            return amount.max(0.0);
        }
        let mut left = amount.max(0.0);
        for cell in self.deposit_order(pos) {
            if left <= 0.0 {
                break;
            }
            left -= self.add_fertilizer(cell, left);
        }
        left.max(0.0)
    }

    pub fn total_grass(&self) -> f64 {
        self.grass.sum()
    }

    pub fn total_fertilizer(&self) -> f64 {
        self.fertilizer.sum()
    }

    /// Grass plus fertilizer over every cell
    pub fn total_energy(&self) -> f64 {
        self.total_grass() + self.total_fertilizer()
    }

    pub fn mean_grass_fraction(&self) -> f32 {
        let open: Vec<usize> = (0..self.cell_count()).filter(|&i| !self.obstacles[i]).collect();
        if open.is_empty() {
            return 0.0;
        }
        let sum: f32 = open
            .iter()
            .map(|&i| {
                let (lo, hi) = self.grass_threshold[i];
                fraction_of(self.grass.get(i), lo, hi)
            })
            .sum();
        sum / open.len() as f32
    }

    /// Advance the whole grid by `dt`
    pub fn update(&self, dt: f32) {
        let all = self.bounds();
        self.plan_growth(all, dt);
        self.absorb_growth(all);
        self.settle_growth(all);
    }

    /// Pass 1: regenerate fertilizer and route each cell's growth
    pub fn plan_growth(&self, region: Region, dt: f32) {
        for pos in self.clip(region).positions() {
            let i = (pos.y * self.width + pos.x) as usize;
            self.scratch.intent.set(i, 0.0);
            self.scratch.set_target(i, NO_TARGET);
            if self.obstacles[i] {
                continue;
            }

            let (f_lo, f_hi) = self.fertilizer_threshold[i];
            let fert = (self.fertilizer.get(i) + self.fertilizer_rate[i] * dt * f_hi).clamp(f_lo, f_hi);
            self.fertilizer.set(i, fert);

            let (_, g_hi) = self.grass_threshold[i];
            let growth = (self.grass_rate[i] * dt * g_hi).min(fert - f_lo).max(0.0);
            if growth <= 0.0 {
                continue;
            }

            if self.grass.get(i) >= g_hi {
                if let Some(target) = self.lowest_unsaturated_neighbor(pos) {
                    self.scratch.intent.set(i, growth / 8.0);
                    self.scratch.set_target(i, target);
                }
            } else {
                self.scratch.intent.set(i, growth);
                self.scratch.set_target(i, i);
            }
        }
    }

    /// Pass 2: each cell absorbs what was routed to it, up to capacity
    pub fn absorb_growth(&self, region: Region) {
        for pos in self.clip(region).positions() {
            let t = (pos.y * self.width + pos.x) as usize;
            let mut incoming = 0.0;
            for source in std::iter::once(pos).chain(pos.neighbors()) {
                if let Some(s) = self.index(source) {
                    if self.scratch.target(s) == t {
                        incoming += self.scratch.intent.get(s);
                    }
                }
            }
            if incoming <= 0.0 {
                self.scratch.scale.set(t, 0.0);
                continue;
            }
            let (_, g_hi) = self.grass_threshold[t];
            let grass = self.grass.get(t);
            let absorbed = incoming.min((g_hi - grass).max(0.0));
            self.grass.set(t, (grass + absorbed).min(g_hi));
            self.scratch.scale.set(t, absorbed / incoming);
        }
    }

    /// Pass 3: debit each source for the share its target absorbed
    pub fn settle_growth(&self, region: Region) {
        for pos in self.clip(region).positions() {
            let s = (pos.y * self.width + pos.x) as usize;
            let target = self.scratch.target(s);
            if target == NO_TARGET {
                continue;
            }
            let paid = self.scratch.intent.get(s) * self.scratch.scale.get(target);
            let (f_lo, _) = self.fertilizer_threshold[s];
            self.fertilizer
                .set(s, (self.fertilizer.get(s) - paid).max(f_lo));
        }
    }

    /// Unsaturated, passable neighbour with the least grass; ties go to the
    /// first in scan order.
    fn lowest_unsaturated_neighbor(&self, pos: Position) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for n in pos.neighbors() {
            let Some(j) = self.index(n) else { continue };
            if self.obstacles[j] {
                continue;
            }
            let grass = self.grass.get(j);
            if grass >= self.grass_threshold[j].1 {
                continue;
            }
            if best.map_or(true, |(_, lowest)| grass < lowest) {
                best = Some((j, grass));
            }
        }
        best.map(|(j, _)| j)
    }

    fn clip(&self, region: Region) -> Region {
        Region::new(
            region.min_x.max(0),
            region.min_y.max(0),
            region.max_x.min(self.width),
            region.max_y.min(self.height),
        )
    }
}

fn fraction_of(value: f32, lo: f32, hi: f32) -> f32 {
    if hi > lo {
        ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn sample_range(rng: &mut ChaCha8Rng, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

/// One mutex per square block of cells
#[derive(Debug)]
pub struct CellBlocks {
    block_size: i32,
    blocks_x: i32,
    locks: Vec<Mutex<()>>,
}

impl CellBlocks {
    pub fn new(width: i32, height: i32, block_size: i32) -> Self {
        let block_size = block_size.max(1);
        let blocks_x = (width + block_size - 1) / block_size;
        let blocks_y = (height + block_size - 1) / block_size;
        Self {
            block_size,
            blocks_x,
            locks: (0..(blocks_x * blocks_y).max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn block_of(&self, pos: Position) -> usize {
        let bx = pos.x.max(0) / self.block_size;
        let by = pos.y.max(0) / self.block_size;
        ((by * self.blocks_x + bx) as usize).min(self.locks.len() - 1)
    }

    pub fn lock(&self, pos: Position) -> MutexGuard<'_, ()> {
        self.locks[self.block_of(pos)].lock()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Single-cell mutations through a shared grid reference, each one taken
/// under the mutex of the block the cell lives in. Never holds more than one
/// block mutex at a time.
pub struct CellAccess<'a> {
    grid: &'a TerrainGrid,
    blocks: &'a CellBlocks,
}

impl<'a> CellAccess<'a> {
    pub fn new(grid: &'a TerrainGrid, blocks: &'a CellBlocks) -> Self {
        Self { grid, blocks }
    }

    pub fn grid(&self) -> &'a TerrainGrid {
        self.grid
    }

    pub fn consume_grass(&self, pos: Position, fraction: f32) -> f32 {
        let _block = self.blocks.lock(pos);
        self.grid.consume_grass(pos, fraction)
    }

    pub fn deposit_fertilizer(&self, pos: Position, amount: f32) -> f32 {
        if !self.grid.in_bounds(pos) {
            return amount.max(0.0);
        }
        let mut left = amount.max(0.0);
        for cell in self.grid.deposit_order(pos) {
            if left <= 0.0 {
                break;
            }
            let _block = self.blocks.lock(cell);
            left -= self.grid.add_fertilizer(cell, left);
        }
        left.max(0.0)
    }
}

/// The terrain grid behind its reader-writer lock, plus the cell-block mutexes
pub struct SharedTerrain {
    grid: TerrainLock<TerrainGrid>,
    blocks: CellBlocks,
}

impl SharedTerrain {
    pub fn new(grid: TerrainGrid, block_size: i32) -> Self {
        let blocks = CellBlocks::new(grid.width(), grid.height(), block_size);
        Self {
            grid: TerrainLock::new(grid),
            blocks,
        }
    }

    pub fn read(&self) -> TerrainReadGuard<'_, TerrainGrid> {
        self.grid.read()
    }

    pub fn write(&self) -> TerrainWriteGuard<'_, TerrainGrid> {
        self.grid.write()
    }

    pub fn blocks(&self) -> &CellBlocks {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    fn flat_grid(width: i32, height: i32) -> TerrainGrid {
        let grid = TerrainGrid::new(width, height, 300.0, 1000.0);
        for i in 0..grid.cell_count() {
            grid.fertilizer.set(i, 500.0);
        }
        grid
    }

    #[test]
    fn test_grid_creation() {
        let grid = TerrainGrid::new(10, 8, 300.0, 1000.0);
        assert_eq!(grid.width(), 10);
        assert_eq!(grid.height(), 8);
        assert_eq!(grid.cell_count(), 80);
        assert_eq!(grid.grass_threshold(Position::new(3, 3)), Some((0.0, 300.0)));
        assert_eq!(grid.grass_threshold(Position::new(10, 3)), None);
    }

    #[test]
    fn test_out_of_bounds_is_noop() {
        let grid = flat_grid(4, 4);
        let outside = Position::new(-1, 2);
        assert_eq!(grid.grass(outside), 0.0);
        assert_eq!(grid.consume_grass(outside, 1.0), 0.0);
        assert_eq!(grid.occupant(outside), None);
        assert!(!grid.claim_cell(outside, AgentId(1)));
        assert_eq!(grid.deposit_fertilizer(outside, 10.0), 10.0);
    }

    #[test]
    fn test_from_config() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let config = TerrainConfig {
            width: 20,
            height: 20,
            obstacle_density: 0.1,
            ..Default::default()
        };
        let grid = TerrainGrid::from_config(&config, &mut rng);

        let seeded = (0..grid.cell_count()).filter(|&i| grid.grass.get(i) > 0.0).count();
        assert_eq!(seeded, 40);
        let obstacles = grid.obstacles.iter().filter(|&&o| o).count();
        assert!(obstacles > 0);

        // Fertilizer is densest at the centre
        let centre = grid.fertilizer(Position::new(10, 10));
        let corner = grid.fertilizer(Position::new(0, 0));
        assert!((centre - 1000.0).abs() < 1e-3);
        assert!(corner < 1e-3);

        for i in 0..grid.cell_count() {
            let r = grid.grass_rate[i];
            assert!((0.0001..0.05).contains(&r));
        }
    }

    #[test]
    fn test_consume_grass() {
        let grid = flat_grid(4, 4);
        let pos = Position::new(1, 1);
        grid.set_grass(pos, 100.0);

        // 10% of capacity is 30
        assert!((grid.consume_grass(pos, 0.1) - 30.0).abs() < 1e-4);
        assert!((grid.grass(pos) - 70.0).abs() < 1e-4);

        // Asking for more than is there returns what was there
        assert!((grid.consume_grass(pos, 1.0) - 70.0).abs() < 1e-4);
        assert_eq!(grid.grass(pos), 0.0);
        assert_eq!(grid.consume_grass(pos, 1.0), 0.0);
    }

    #[test]
    fn test_growth_from_fertilizer() {
        let mut grid = flat_grid(3, 3);
        let pos = Position::new(1, 1);
        grid.set_rates(pos, 0.01, 0.0);
        let before = grid.total_energy();

        grid.update(1.0);

        // 0.01 * 1.0 * 300 = 3 grass, paid for by 3 fertilizer
        assert!((grid.grass(pos) - 3.0).abs() < 1e-4);
        assert!((grid.fertilizer(pos) - 497.0).abs() < 1e-3);
        assert!((grid.total_energy() - before).abs() < 1e-2);
    }

    #[test]
    fn test_growth_limited_by_fertilizer() {
        let mut grid = flat_grid(3, 3);
        let pos = Position::new(1, 1);
        grid.set_fertilizer(pos, 1.0);
        grid.set_rates(pos, 0.01, 0.0);
        grid.update(1.0);
        assert!((grid.grass(pos) - 1.0).abs() < 1e-4);
        assert_eq!(grid.fertilizer(pos), 0.0);
    }

    #[test]
    fn test_saturated_cell_spills_to_lowest_neighbor() {
        let mut grid = flat_grid(3, 3);
        let centre = Position::new(1, 1);
        for pos in grid.bounds().positions() {
            grid.set_grass(pos, 200.0);
        }
        grid.set_grass(centre, 300.0);
        grid.set_grass(Position::new(2, 2), 50.0);
        grid.set_rates(centre, 0.08, 0.0);

        grid.update(1.0);

        // 0.08 * 300 = 24, an eighth of it lands on the emptiest neighbour
        assert_eq!(grid.grass(centre), 300.0);
        assert!((grid.grass(Position::new(2, 2)) - 53.0).abs() < 1e-4);
        assert!((grid.grass(Position::new(0, 0)) - 200.0).abs() < 1e-4);
        assert!((grid.fertilizer(centre) - 497.0).abs() < 1e-3);
    }

    #[test]
    fn test_spill_ties_use_scan_order() {
        let mut grid = flat_grid(3, 3);
        let centre = Position::new(1, 1);
        grid.set_grass(centre, 300.0);
        grid.set_rates(centre, 0.08, 0.0);
        grid.update(1.0);
        // All neighbours at zero: the first in scan order (top-left) wins
        assert!(grid.grass(Position::new(0, 0)) > 0.0);
        assert_eq!(grid.grass(Position::new(1, 0)), 0.0);
    }

    #[test]
    fn test_saturated_without_room_keeps_fertilizer() {
        let mut grid = flat_grid(2, 1);
        for pos in grid.bounds().positions() {
            grid.set_grass(pos, 300.0);
            grid.set_rates(pos, 0.05, 0.0);
        }
        grid.update(1.0);
        assert_eq!(grid.fertilizer(Position::new(0, 0)), 500.0);
        assert_eq!(grid.grass(Position::new(1, 0)), 300.0);
    }

    #[test]
    fn test_fertilizer_regenerates_to_max() {
        let mut grid = flat_grid(1, 1);
        let pos = Position::new(0, 0);
        grid.set_rates(pos, 0.0, 0.3);
        grid.update(1.0);
        assert!((grid.fertilizer(pos) - 800.0).abs() < 1e-3);
        grid.update(1.0);
        assert_eq!(grid.fertilizer(pos), 1000.0);
    }

    #[test]
    fn test_region_passes_match_full_update() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let config = TerrainConfig {
            width: 12,
            height: 12,
            initial_grass_coverage: 0.6,
            ..Default::default()
        };
        let whole = TerrainGrid::from_config(&config, &mut rng.clone());
        let split = TerrainGrid::from_config(&config, &mut rng);

        whole.update(5.0);

        // Quadrants processed in reverse order
        let quads = [
            Region::new(6, 6, 12, 12),
            Region::new(0, 6, 6, 12),
            Region::new(6, 0, 12, 6),
            Region::new(0, 0, 6, 6),
        ];
        for q in quads {
            split.plan_growth(q, 5.0);
        }
        for q in quads {
            split.absorb_growth(q);
        }
        for q in quads {
            split.settle_growth(q);
        }

        for pos in whole.bounds().positions() {
            assert_eq!(whole.grass(pos), split.grass(pos));
            assert_eq!(whole.fertilizer(pos), split.fertilizer(pos));
        }
    }

    #[test]
    fn test_region_passes_run_concurrently() {
        let config = TerrainConfig {
            width: 16,
            height: 16,
            initial_grass_coverage: 0.7,
            ..Default::default()
        };
        let rng = ChaCha8Rng::seed_from_u64(21);
        let whole = TerrainGrid::from_config(&config, &mut rng.clone());
        let shared = SharedTerrain::new(TerrainGrid::from_config(&config, &mut rng.clone()), 4);
        whole.update(2.0);

        let quads = [
            Region::new(0, 0, 8, 8),
            Region::new(8, 0, 16, 8),
            Region::new(0, 8, 8, 16),
            Region::new(8, 8, 16, 16),
        ];
        let barrier = std::sync::Barrier::new(quads.len());
        std::thread::scope(|scope| {
            for q in quads {
                let shared = &shared;
                let barrier = &barrier;
                scope.spawn(move || {
                    // Every task holds the read lock at once; a writer-only
                    // design would deadlock at the first barrier
                    let grid = shared.read();
                    barrier.wait();
                    grid.plan_growth(q, 2.0);
                    barrier.wait();
                    grid.absorb_growth(q);
                    barrier.wait();
                    grid.settle_growth(q);
                });
            }
        });

        let split = shared.read();
        for pos in whole.bounds().positions() {
            assert_eq!(whole.grass(pos), split.grass(pos));
            assert_eq!(whole.fertilizer(pos), split.fertilizer(pos));
        }
    }

    #[test]
    fn test_deposit_spills_outward() {
        let grid = TerrainGrid::new(3, 3, 300.0, 100.0);
        let centre = Position::new(1, 1);
        let left = grid.deposit_fertilizer(centre, 250.0);
        assert_eq!(left, 0.0);
        assert_eq!(grid.fertilizer(centre), 100.0);
        // Ring 1 filled in row-major order
        assert_eq!(grid.fertilizer(Position::new(0, 0)), 100.0);
        assert_eq!(grid.fertilizer(Position::new(1, 0)), 50.0);
        assert_eq!(grid.fertilizer(Position::new(2, 0)), 0.0);

        let overflow = grid.deposit_fertilizer(centre, 10_000.0);
        assert!((overflow - (10_000.0 - 650.0)).abs() < 1e-2);
    }

    #[test]
    fn test_occupancy_claims() {
        let grid = flat_grid(2, 2);
        let pos = Position::new(1, 0);
        assert!(grid.claim_cell(pos, AgentId(0)));
        assert!(!grid.claim_cell(pos, AgentId(5)));
        assert_eq!(grid.occupant(pos), Some(AgentId(0)));
        assert!(!grid.release_cell(pos, AgentId(5)));
        assert!(grid.release_cell(pos, AgentId(0)));
        assert_eq!(grid.occupant(pos), None);
    }

    #[test]
    fn test_cell_blocks() {
        let blocks = CellBlocks::new(10, 10, 4);
        assert_eq!(blocks.len(), 9);
        assert_eq!(blocks.block_of(Position::new(0, 0)), 0);
        assert_eq!(blocks.block_of(Position::new(5, 1)), 1);
        assert_eq!(blocks.block_of(Position::new(9, 9)), 8);
    }

    #[test]
    fn test_cell_access_under_shared_terrain() {
        let shared = SharedTerrain::new(flat_grid(8, 8), 4);
        {
            let grid = shared.read();
            grid.set_grass(Position::new(2, 2), 150.0);
            let access = CellAccess::new(&grid, shared.blocks());
            assert!((access.consume_grass(Position::new(2, 2), 0.5) - 150.0).abs() < 1e-4);
            assert_eq!(access.deposit_fertilizer(Position::new(0, 0), 100.0), 0.0);
        }
        assert_eq!(shared.read().fertilizer(Position::new(0, 0)), 600.0);
        shared.write().update(1.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_update_keeps_cells_in_bounds(seed in 0u64..1000, dt in 0.01f32..50.0) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let config = TerrainConfig {
                width: 10,
                height: 10,
                initial_grass_coverage: 0.8,
                ..Default::default()
            };
            let grid = TerrainGrid::from_config(&config, &mut rng);
            for _ in 0..5 {
                grid.update(dt);
            }
            for pos in grid.bounds().positions() {
                let (g_lo, g_hi) = grid.grass_threshold(pos).unwrap();
                let (f_lo, f_hi) = grid.fertilizer_threshold(pos).unwrap();
                prop_assert!(grid.grass(pos) >= g_lo && grid.grass(pos) <= g_hi);
                prop_assert!(grid.fertilizer(pos) >= f_lo && grid.fertilizer(pos) <= f_hi);
            }
        }

        #[test]
        fn test_consume_returns_exact_deficit(start in 0.0f32..300.0, fraction in 0.0f32..1.5) {
            let grid = TerrainGrid::new(1, 1, 300.0, 1000.0);
            let pos = Position::new(0, 0);
            grid.set_grass(pos, start);
            let taken = grid.consume_grass(pos, fraction);
            prop_assert!(taken >= 0.0 && taken <= start + 1e-4);
            prop_assert!((start - grid.grass(pos) - taken).abs() < 1e-3);
            prop_assert!(grid.grass(pos) >= 0.0);
        }

        #[test]
        fn test_growth_never_creates_energy(seed in 0u64..1000) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let config = TerrainConfig {
                width: 8,
                height: 8,
                initial_grass_coverage: 0.9,
                // No fertilizer regeneration: a closed terrain
                fertilizer_rate_range: (0.0, 0.0),
                ..Default::default()
            };
            let grid = TerrainGrid::from_config(&config, &mut rng);
            let before = grid.total_energy();
            grid.update(30.0);
            prop_assert!(grid.total_energy() <= before + 0.05);
        }
    }
}
