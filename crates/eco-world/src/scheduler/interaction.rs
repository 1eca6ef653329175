//! Cross-partition effects queued during the agent phase.

use eco_core::{AgentId, PartitionId, Position};
use parking_lot::Mutex;

/// An effect that may touch state owned by another partition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InteractionRequest {
    /// The agent walked from `from` to `to`; its cell claim must follow
    Relocate { agent: AgentId, from: Position, to: Position },
    /// Graze the grass on `cell`
    Graze { agent: AgentId, cell: Position },
    /// Attempt to eat whoever stands on `cell`
    Predation {
        predator: AgentId,
        prey: AgentId,
        cell: Position,
    },
    /// Energy the agent owed but could not pay, deposited on `cell`
    ReturnEnergy { agent: AgentId, cell: Position, amount: f32 },
}

impl InteractionRequest {
    pub fn actor(&self) -> AgentId {
        match *self {
            InteractionRequest::Relocate { agent, .. } => agent,
            InteractionRequest::Graze { agent, .. } => agent,
            InteractionRequest::Predation { predator, .. } => predator,
            InteractionRequest::ReturnEnergy { agent, .. } => agent,
        }
    }
}

/// Requests produced by one partition task, in submission order
#[derive(Debug, Clone)]
pub struct RequestBatch {
    pub partition: PartitionId,
    pub requests: Vec<InteractionRequest>,
}

impl RequestBatch {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            requests: Vec::new(),
        }
    }

    pub fn push(&mut self, request: InteractionRequest) {
        self.requests.push(request);
    }
}

/// Collects batches from concurrent tasks and hands them back in a total
/// order that does not depend on which task finished first.
#[derive(Default)]
pub struct InteractionQueue {
    batches: Mutex<Vec<RequestBatch>>,
}

impl InteractionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, batch: RequestBatch) {
        if batch.requests.is_empty() {
            return;
        }
        self.batches.lock().push(batch);
    }

    pub fn pending(&self) -> usize {
        self.batches.lock().iter().map(|b| b.requests.len()).sum()
    }

    /// Empty the queue: batches ascending by partition id, each batch in the
    /// order its task submitted requests
    pub fn drain_ordered(&self) -> Vec<InteractionRequest> {
        let mut batches = std::mem::take(&mut *self.batches.lock());
        batches.sort_by_key(|b| b.partition);
        batches.into_iter().flat_map(|b| b.requests).collect()
    }
}
