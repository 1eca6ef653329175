//! A* shortest paths and best-resource search over the terrain grid.
//!
//! Searches run on a [`SearchLayer`], a per-cell scratch array reset at the
//! start of every search. Parallel callers check layers out of a
//! [`SearchLayerPool`] so no two searches share scratch state.

use crate::terrain::TerrainGrid;
use eco_core::{Direction, Position};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// Per-cell search bookkeeping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchNode {
    pub traveled: f32,
    pub heuristic: f32,
    pub total: f32,
    pub predecessor: Option<usize>,
}

impl SearchNode {
    const UNVISITED: SearchNode = SearchNode {
        traveled: f32::INFINITY,
        heuristic: f32::INFINITY,
        total: f32::INFINITY,
        predecessor: None,
    };
}

#[derive(Debug, Clone)]
pub struct SearchLayer {
    width: i32,
    height: i32,
    nodes: Vec<SearchNode>,
}

impl SearchLayer {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            nodes: vec![SearchNode::UNVISITED; (width.max(0) * height.max(0)) as usize],
        }
    }

    pub fn reset(&mut self) {
        self.nodes.fill(SearchNode::UNVISITED);
    }

    pub fn node(&self, index: usize) -> &SearchNode {
        &self.nodes[index]
    }

    fn fits(&self, grid: &TerrainGrid) -> bool {
        self.width == grid.width() && self.height == grid.height()
    }
}

/// Free list of search layers sized for one grid
pub struct SearchLayerPool {
    width: i32,
    height: i32,
    free: Mutex<Vec<SearchLayer>>,
}

impl SearchLayerPool {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn checkout(&self) -> PooledLayer<'_> {
        let layer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| SearchLayer::new(self.width, self.height));
        PooledLayer { pool: self, layer }
    }

    pub fn idle_layers(&self) -> usize {
        self.free.lock().len()
    }
}

/// A layer on loan from a pool; returned on drop
pub struct PooledLayer<'a> {
    pool: &'a SearchLayerPool,
    layer: SearchLayer,
}

impl Deref for PooledLayer<'_> {
    type Target = SearchLayer;

    fn deref(&self) -> &SearchLayer {
        &self.layer
    }
}

impl DerefMut for PooledLayer<'_> {
    fn deref_mut(&mut self) -> &mut SearchLayer {
        &mut self.layer
    }
}

impl Drop for PooledLayer<'_> {
    fn drop(&mut self) {
        let layer = std::mem::replace(&mut self.layer, SearchLayer::new(0, 0));
        self.pool.free.lock().push(layer);
    }
}

/// Open-list entry: lowest total first, then first pushed
#[derive(Debug, Clone, Copy)]
struct OpenEntry {
    total: f32,
    seq: u64,
    index: usize,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert both keys
        other
            .total
            .total_cmp(&self.total)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct PathEngine<'a> {
    grid: &'a TerrainGrid,
    layer: &'a mut SearchLayer,
    max_open_nodes: usize,
}

impl<'a> PathEngine<'a> {
    pub fn new(grid: &'a TerrainGrid, layer: &'a mut SearchLayer, max_open_nodes: usize) -> Self {
        if !layer.fits(grid) {
            *layer = SearchLayer::new(grid.width(), grid.height());
        }
        Self {
            grid,
            layer,
            max_open_nodes: max_open_nodes.max(1),
        }
    }

    /// Shortest 8-connected path from `src` to `dest`.
    ///
    /// The result excludes `src` and ends at `dest`; it is empty when the two
    /// coincide, when either lies off-grid, when `dest` is blocked, when no
    /// route exists, or when the open list outgrows its cap.
    pub fn shortest_path(&mut self, src: Position, dest: Position, rng: &mut impl Rng) -> Vec<Position> {
        if src == dest || !self.grid.in_bounds(src) || !self.grid.is_passable(dest) {
            return Vec::new();
        }
        let (Some(start), Some(goal)) = (self.grid.index(src), self.grid.index(dest)) else {
            return Vec::new();
        };

        self.layer.reset();
        let h = src.octile_distance(&dest);
        self.layer.nodes[start] = SearchNode {
            traveled: 0.0,
            heuristic: h,
            total: h,
            predecessor: None,
        };

        let mut open = BinaryHeap::new();
        let mut seq = 0u64;
        open.push(OpenEntry {
            total: h,
            seq,
            index: start,
        });

        while let Some(entry) = open.pop() {
            let current = entry.index;
            let node = self.layer.nodes[current];
            if entry.total > node.total {
                continue;
            }
            if current == goal {
                return self.reconstruct(start, goal);
            }

            let at = self.grid.position_of(current);
            let mut directions = Direction::all();
            directions.shuffle(rng);
            for direction in directions {
                let next = at.step(direction);
                if !self.grid.is_passable(next) {
                    continue;
                }
                let Some(n) = self.grid.index(next) else { continue };
                let traveled = node.traveled + direction.step_cost();
                let heuristic = next.octile_distance(&dest);
                let total = traveled + heuristic;
                if self.layer.nodes[n].total <= total {
                    continue;
                }
                self.layer.nodes[n] = SearchNode {
                    traveled,
                    heuristic,
                    total,
                    predecessor: Some(current),
                };
                seq += 1;
                open.push(OpenEntry {
                    total,
                    seq,
                    index: n,
                });
            }

            if open.len() > self.max_open_nodes {
                debug!(
                    event = "path_search_abandoned",
                    src_x = src.x,
                    src_y = src.y,
                    dest_x = dest.x,
                    dest_y = dest.y,
                    open_nodes = open.len(),
                    max_open_nodes = self.max_open_nodes,
                    "Open list exceeded cap, treating as no path"
                );
                return Vec::new();
            }
        }

        Vec::new()
    }

    fn reconstruct(&self, start: usize, goal: usize) -> Vec<Position> {
        let mut path = Vec::new();
        let mut at = goal;
        while at != start {
            if path.len() > self.layer.nodes.len() {
                warn!(event = "cyclic_path_rejected", "Predecessor chain does not terminate");
                return Vec::new();
            }
            path.push(self.grid.position_of(at));
            match self.layer.nodes[at].predecessor {
                Some(prev) => at = prev,
                None => {
                    warn!(event = "broken_path_rejected", "Predecessor chain ends before source");
                    return Vec::new();
                }
            }
        }
        path.reverse();
        path
    }

    /// Richest grass cell reachable within `radius` (euclidean) of `src`.
    ///
    /// Candidates must exceed `min_quality` as a fraction of capacity; the
    /// source cell counts. Ties among the richest are broken at random.
    pub fn best_resource(
        &mut self,
        src: Position,
        radius: f32,
        min_quality: f32,
        rng: &mut impl Rng,
    ) -> Option<Position> {
        let start = self.grid.index(src)?;
        self.layer.reset();
        self.layer.nodes[start] = SearchNode {
            traveled: 0.0,
            heuristic: 0.0,
            total: 0.0,
            predecessor: None,
        };

        let mut open = BinaryHeap::new();
        let mut seq = 0u64;
        open.push(OpenEntry {
            total: 0.0,
            seq,
            index: start,
        });

        let mut candidates = Vec::new();
        while let Some(entry) = open.pop() {
            let current = entry.index;
            let node = self.layer.nodes[current];
            if entry.total > node.total {
                continue;
            }
            let at = self.grid.position_of(current);
            let quality = self.grid.grass_fraction(at);
            if quality > min_quality {
                candidates.push((at, quality));
            }
            if at.euclidean_distance(&src) >= radius || open.len() > self.max_open_nodes {
                continue;
            }

            let mut directions = Direction::all();
            directions.shuffle(rng);
            for direction in directions {
                let next = at.step(direction);
                if !self.grid.is_passable(next) {
                    continue;
                }
                let Some(n) = self.grid.index(next) else { continue };
                let traveled = node.traveled + direction.step_cost();
                if self.layer.nodes[n].total <= traveled {
                    continue;
                }
                self.layer.nodes[n] = SearchNode {
                    traveled,
                    heuristic: 0.0,
                    total: traveled,
                    predecessor: Some(current),
                };
                seq += 1;
                open.push(OpenEntry {
                    total: traveled,
                    seq,
                    index: n,
                });
            }
        }

        candidates.shuffle(rng);
        let mut best: Option<(Position, f32)> = None;
        for (pos, quality) in candidates {
            if best.map_or(true, |(_, top)| quality > top) {
                best = Some((pos, quality));
            }
        }
        best.map(|(pos, _)| pos)
    }

    /// First vacant, passable neighbour of `src` in fixed scan order
    pub fn empty_neighbor(&self, src: Position) -> Option<Position> {
        empty_neighbor(self.grid, src)
    }
}

/// First vacant, passable neighbour of `src` in fixed scan order
pub fn empty_neighbor(grid: &TerrainGrid, src: Position) -> Option<Position> {
    if !grid.in_bounds(src) {
        return None;
    }
    src.neighbors()
        .find(|&n| grid.is_passable(n) && grid.occupant(n).is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eco_core::{AgentId, SQRT_2};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn open_grid(width: i32, height: i32) -> TerrainGrid {
        TerrainGrid::new(width, height, 300.0, 1000.0)
    }

    fn path_cost(src: Position, path: &[Position]) -> f32 {
        let mut cost = 0.0;
        let mut at = src;
        for &step in path {
            assert_eq!(at.chebyshev_distance(&step), 1, "steps must be adjacent");
            cost += if at.x != step.x && at.y != step.y { SQRT_2 } else { 1.0 };
            at = step;
        }
        cost
    }

    #[test]
    fn test_diagonal_path_length() {
        let grid = open_grid(10, 10);
        let mut layer = SearchLayer::new(10, 10);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut engine = PathEngine::new(&grid, &mut layer, 1000);

        let path = engine.shortest_path(Position::new(0, 0), Position::new(9, 9), &mut rng);
        assert_eq!(path.len(), 9);
        assert_eq!(path.last(), Some(&Position::new(9, 9)));
        assert!(!path.contains(&Position::new(0, 0)));
    }

    #[test]
    fn test_same_cell_is_empty() {
        let grid = open_grid(5, 5);
        let mut layer = SearchLayer::new(5, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut engine = PathEngine::new(&grid, &mut layer, 1000);
        let a = Position::new(2, 2);
        assert!(engine.shortest_path(a, a, &mut rng).is_empty());
    }

    #[test]
    fn test_out_of_bounds_is_empty() {
        let grid = open_grid(5, 5);
        let mut layer = SearchLayer::new(5, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut engine = PathEngine::new(&grid, &mut layer, 1000);
        assert!(engine
            .shortest_path(Position::new(0, 0), Position::new(7, 1), &mut rng)
            .is_empty());
        assert!(engine
            .shortest_path(Position::new(-1, 0), Position::new(3, 1), &mut rng)
            .is_empty());
    }

    #[test]
    fn test_blocked_grid_has_no_path() {
        let mut grid = open_grid(7, 7);
        let src = Position::new(3, 3);
        for n in src.neighbors().collect::<Vec<_>>() {
            grid.set_obstacle(n, true);
        }
        let mut layer = SearchLayer::new(7, 7);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut engine = PathEngine::new(&grid, &mut layer, 1000);
        assert!(engine.shortest_path(src, Position::new(0, 0), &mut rng).is_empty());
    }

    #[test]
    fn test_routes_around_wall() {
        let mut grid = open_grid(10, 10);
        for y in 0..9 {
            grid.set_obstacle(Position::new(5, y), true);
        }
        let mut layer = SearchLayer::new(10, 10);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut engine = PathEngine::new(&grid, &mut layer, 1000);

        let src = Position::new(0, 0);
        let path = engine.shortest_path(src, Position::new(9, 0), &mut rng);
        assert!(!path.is_empty());
        assert!(path.iter().all(|&p| !grid.is_obstacle(p)));
        assert!(path.contains(&Position::new(5, 9)));
    }

    #[test]
    fn test_open_list_cap() {
        let grid = open_grid(40, 40);
        let mut layer = SearchLayer::new(40, 40);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut engine = PathEngine::new(&grid, &mut layer, 4);
        assert!(engine
            .shortest_path(Position::new(0, 0), Position::new(39, 20), &mut rng)
            .is_empty());
    }

    #[test]
    fn test_best_resource_picks_richest() {
        let grid = open_grid(10, 10);
        grid.set_grass(Position::new(4, 4), 150.0);
        grid.set_grass(Position::new(6, 5), 270.0);
        grid.set_grass(Position::new(9, 9), 300.0);

        let mut layer = SearchLayer::new(10, 10);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut engine = PathEngine::new(&grid, &mut layer, 1000);

        // (9, 9) is out of reach at radius 3
        let best = engine.best_resource(Position::new(5, 5), 3.0, 0.3, &mut rng);
        assert_eq!(best, Some(Position::new(6, 5)));

        // Below the quality bar everywhere in reach
        let none = engine.best_resource(Position::new(1, 1), 2.0, 0.3, &mut rng);
        assert_eq!(none, None);
    }

    #[test]
    fn test_best_resource_includes_source() {
        let grid = open_grid(5, 5);
        grid.set_grass(Position::new(2, 2), 200.0);
        let mut layer = SearchLayer::new(5, 5);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut engine = PathEngine::new(&grid, &mut layer, 1000);
        assert_eq!(
            engine.best_resource(Position::new(2, 2), 0.0, 0.1, &mut rng),
            Some(Position::new(2, 2))
        );
    }

    #[test]
    fn test_best_resource_ties_are_random() {
        let grid = open_grid(5, 5);
        grid.set_grass(Position::new(1, 2), 200.0);
        grid.set_grass(Position::new(3, 2), 200.0);
        let mut layer = SearchLayer::new(5, 5);
        let mut engine = PathEngine::new(&grid, &mut layer, 1000);

        let mut seen = std::collections::HashSet::new();
        for seed in 0..32 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            if let Some(pos) = engine.best_resource(Position::new(2, 2), 3.0, 0.1, &mut rng) {
                seen.insert(pos);
            }
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_empty_neighbor_scan_order() {
        let mut grid = open_grid(5, 5);
        let src = Position::new(2, 2);
        assert_eq!(empty_neighbor(&grid, src), Some(Position::new(1, 1)));

        grid.claim_cell(Position::new(1, 1), AgentId(1));
        grid.set_obstacle(Position::new(2, 1), true);
        assert_eq!(empty_neighbor(&grid, src), Some(Position::new(3, 1)));

        // Corner: off-grid neighbours are skipped
        assert_eq!(empty_neighbor(&grid, Position::new(0, 0)), Some(Position::new(1, 0)));
        assert_eq!(empty_neighbor(&grid, Position::new(9, 9)), None);
    }

    #[test]
    fn test_layer_pool_reuses_layers() {
        let pool = SearchLayerPool::new(8, 8);
        {
            let _a = pool.checkout();
            let _b = pool.checkout();
            assert_eq!(pool.idle_layers(), 0);
        }
        assert_eq!(pool.idle_layers(), 2);
        let _c = pool.checkout();
        assert_eq!(pool.idle_layers(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_open_grid_path_matches_octile(
            sx in 0i32..15, sy in 0i32..15, dx in 0i32..15, dy in 0i32..15, seed in 0u64..100
        ) {
            let grid = open_grid(15, 15);
            let mut layer = SearchLayer::new(15, 15);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut engine = PathEngine::new(&grid, &mut layer, 1000);
            let src = Position::new(sx, sy);
            let dest = Position::new(dx, dy);
            let path = engine.shortest_path(src, dest, &mut rng);
            if src == dest {
                prop_assert!(path.is_empty());
            } else {
                prop_assert_eq!(path.len() as i32, src.chebyshev_distance(&dest));
                prop_assert!((path_cost(src, &path) - src.octile_distance(&dest)).abs() < 1e-3);
            }
        }

        #[test]
        fn test_paths_never_revisit_a_cell(
            seed in 0u64..500, density in 0.0f32..0.4, dx in 0i32..12, dy in 0i32..12
        ) {
            let mut grid = open_grid(12, 12);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for pos in grid.bounds().positions() {
                if pos != Position::new(0, 0) && rng.gen::<f32>() < density {
                    grid.set_obstacle(pos, true);
                }
            }
            let mut layer = SearchLayer::new(12, 12);
            let mut engine = PathEngine::new(&grid, &mut layer, 1000);
            let src = Position::new(0, 0);
            let dest = Position::new(dx, dy);
            let path = engine.shortest_path(src, dest, &mut rng);
            let mut seen = std::collections::HashSet::new();
            for step in &path {
                prop_assert!(*step != src);
                prop_assert!(grid.is_passable(*step));
                prop_assert!(seen.insert(*step), "cell {} visited twice", step);
            }
            if let Some(last) = path.last() {
                prop_assert_eq!(*last, dest);
                path_cost(src, &path);
            }
        }
    }
}
