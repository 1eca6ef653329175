//! Spatial partitioning of the grid into fixed square tiles.

use crate::agent::{AgentRecord, AgentRegistry};
use eco_core::{AgentId, PartitionId, Position, Region, Species};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Divides a `width × height` grid into `size × size` tiles, numbered
/// row-major. Edge tiles are clipped to the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialPartitioner {
    width: i32,
    height: i32,
    size: i32,
    cols: i32,
    rows: i32,
}

impl SpatialPartitioner {
    pub fn new(width: i32, height: i32, size: i32) -> Self {
        let size = size.max(1);
        let width = width.max(0);
        let height = height.max(0);
        Self {
            width,
            height,
            size,
            cols: (width + size - 1) / size,
            rows: (height + size - 1) / size,
        }
    }

    pub fn count(&self) -> usize {
        (self.cols * self.rows) as usize
    }

    pub fn tile_size(&self) -> i32 {
        self.size
    }

    /// Grid width and height covered by the tiles
    pub fn extent(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    pub fn partition_of(&self, pos: Position) -> Option<PartitionId> {
        if !pos.in_bounds(self.width, self.height) {
            return None;
        }
        let col = pos.x / self.size;
        let row = pos.y / self.size;
        Some(PartitionId((row * self.cols + col) as usize))
    }

    fn coords(&self, pid: PartitionId) -> (i32, i32) {
        let i = pid.0 as i32;
        (i % self.cols.max(1), i / self.cols.max(1))
    }

    /// Cells covered by a tile; empty for an unknown id
    pub fn bounds(&self, pid: PartitionId) -> Region {
        if pid.0 >= self.count() {
            return Region::new(0, 0, 0, 0);
        }
        let (col, row) = self.coords(pid);
        let min_x = col * self.size;
        let min_y = row * self.size;
        Region::new(
            min_x,
            min_y,
            (min_x + self.size).min(self.width),
            (min_y + self.size).min(self.height),
        )
    }

    pub fn regions(&self) -> Vec<Region> {
        self.ids().map(|pid| self.bounds(pid)).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = PartitionId> {
        (0..self.count()).map(PartitionId)
    }

    /// Tiles intersecting `region`, ascending
    pub fn tiles_overlapping(&self, region: Region) -> Vec<PartitionId> {
        let min_x = region.min_x.max(0);
        let min_y = region.min_y.max(0);
        let max_x = region.max_x.min(self.width);
        let max_y = region.max_y.min(self.height);
        if min_x >= max_x || min_y >= max_y {
            return Vec::new();
        }
        let mut out = Vec::new();
        for row in (min_y / self.size)..=((max_y - 1) / self.size) {
            for col in (min_x / self.size)..=((max_x - 1) / self.size) {
                out.push(PartitionId((row * self.cols + col) as usize));
            }
        }
        out
    }

    /// Tiles whose coordinates differ by at most one on each axis, a tile
    /// being its own neighbour
    pub fn are_neighbors(&self, a: PartitionId, b: PartitionId) -> bool {
        if a.0 >= self.count() || b.0 >= self.count() {
            return false;
        }
        let (ax, ay) = self.coords(a);
        let (bx, by) = self.coords(b);
        (ax - bx).abs() <= 1 && (ay - by).abs() <= 1
    }

    /// The 3×3 block of tiles around `pid` (itself included), ascending
    pub fn neighbors_of(&self, pid: PartitionId) -> Vec<PartitionId> {
        if pid.0 >= self.count() {
            return Vec::new();
        }
        let (col, row) = self.coords(pid);
        let mut out = Vec::with_capacity(9);
        for r in (row - 1).max(0)..=(row + 1).min(self.rows - 1) {
            for c in (col - 1).max(0)..=(col + 1).min(self.cols - 1) {
                out.push(PartitionId((r * self.cols + c) as usize));
            }
        }
        out
    }
}

/// What other agents can see of an agent during the parallel phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub species: Species,
    pub position: Position,
    pub size: f32,
    pub energy_ratio: f32,
}

impl From<&AgentRecord> for AgentSnapshot {
    fn from(record: &AgentRecord) -> Self {
        Self {
            id: record.id,
            species: record.species,
            position: record.position,
            size: record.traits.size,
            energy_ratio: record.energy.ratio(),
        }
    }
}

/// Per-tile membership, rebuilt from the registry at the start of every tick
pub struct PartitionIndex {
    partitioner: SpatialPartitioner,
    buckets: Vec<Mutex<Vec<AgentSnapshot>>>,
}

impl PartitionIndex {
    pub fn new(partitioner: SpatialPartitioner) -> Self {
        let buckets = (0..partitioner.count()).map(|_| Mutex::new(Vec::new())).collect();
        Self { partitioner, buckets }
    }

    pub fn partitioner(&self) -> &SpatialPartitioner {
        &self.partitioner
    }

    /// Re-bucket every living agent by its current position. Buckets are
    /// sorted by id, so rebuilding without movement is idempotent.
    pub fn rebuild(&self, registry: &AgentRegistry) {
        for bucket in &self.buckets {
            bucket.lock().clear();
        }
        for id in registry.ids() {
            let Some(record) = registry.lock(id) else {
                continue;
            };
            if !record.is_alive() {
                continue;
            }
            let snapshot = AgentSnapshot::from(&*record);
            drop(record);
            if let Some(pid) = self.partitioner.partition_of(snapshot.position) {
                self.buckets[pid.0].lock().push(snapshot);
            }
        }
    }

    /// Copy of one tile's members, ascending by id
    pub fn members(&self, pid: PartitionId) -> Vec<AgentSnapshot> {
        self.buckets.get(pid.0).map(|b| b.lock().clone()).unwrap_or_default()
    }

    pub fn member_ids(&self, pid: PartitionId) -> Vec<AgentId> {
        self.members(pid).iter().map(|s| s.id).collect()
    }

    /// Snapshot the neighbours of `pid`, then lock `pid` itself.
    ///
    /// Neighbour buckets are copied one lock at a time, ascending, and
    /// released immediately; only the centre stays locked, so two tasks never
    /// wait on each other while holding a tile.
    pub fn lock_neighborhood(&self, pid: PartitionId) -> Neighborhood<'_> {
        let neighbors = self.partitioner.neighbors_of(pid);
        let mut visible = Vec::new();
        for &n in neighbors.iter().filter(|&&n| n != pid) {
            visible.extend(self.buckets[n.0].lock().iter().copied());
        }
        let guard = self.buckets.get(pid.0).map(|b| b.lock());
        Neighborhood {
            center: pid,
            tiles: neighbors,
            guard,
            visible,
        }
    }
}

/// A locked tile plus a read-only copy of its neighbours' members
pub struct Neighborhood<'a> {
    center: PartitionId,
    tiles: Vec<PartitionId>,
    guard: Option<MutexGuard<'a, Vec<AgentSnapshot>>>,
    visible: Vec<AgentSnapshot>,
}

impl Neighborhood<'_> {
    pub fn center(&self) -> PartitionId {
        self.center
    }

    /// Ids of the agents the centre tile owns this tick
    pub fn own_members(&self) -> Vec<AgentId> {
        self.own().map(|s| s.id).collect()
    }

    fn own(&self) -> impl Iterator<Item = &AgentSnapshot> {
        self.guard.iter().flat_map(|g| g.iter())
    }

    fn all(&self) -> impl Iterator<Item = &AgentSnapshot> {
        self.own().chain(self.visible.iter())
    }

    pub fn agent_at(&self, pos: Position) -> Option<AgentSnapshot> {
        self.all().find(|s| s.position == pos).copied()
    }

    /// Agents within `radius` (euclidean) of `pos`, ascending by id
    pub fn nearby(&self, pos: Position, radius: f32) -> Vec<AgentSnapshot> {
        let mut out: Vec<AgentSnapshot> = self
            .all()
            .filter(|s| s.position.euclidean_distance(&pos) <= radius)
            .copied()
            .collect();
        out.sort_unstable_by_key(|s| s.id);
        out
    }

    /// Tiles this neighbourhood can see, ascending
    pub fn tiles(&self) -> &[PartitionId] {
        &self.tiles
    }
}
