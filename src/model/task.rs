use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{Result, ensure};

use crate::model::candidate::Candidate;
use crate::model::cost::{CostModel, TaskCost};
use crate::model::source::TaskSources;
use crate::model::worker::GroupingId;

static TASK_IDS: AtomicU32 = AtomicU32::new(0);
static TOKEN_IDS: AtomicU32 = AtomicU32::new(0);
static BATCH_IDS: AtomicU32 = AtomicU32::new(0);

/// Identity of one task request. Two requests with identical costs are
/// still distinct.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u32);

impl TaskId {
    fn fresh() -> Self {
        TaskId(TASK_IDS.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque handle of a task-source collaborator, minted by the caller.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SourceId(pub usize);

/// Sized, serial-numbered token marking the means to enter an auction.
/// The live flag is an audit trail of which tasks are mid-auction.
#[derive(Clone, Debug)]
pub struct EntryToken {
    id: u32,
    size: usize,
    live: bool,
}

impl EntryToken {
    pub fn new(size: usize) -> Self {
        EntryToken {
            id: TOKEN_IDS.fetch_add(1, Ordering::Relaxed),
            size,
            live: false,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn serial(&self) -> u32 {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub(crate) fn set_live(&mut self, live: bool) {
        self.live = live;
    }
}

/// One demand for exactly one grouping of a fixed size, owning a lazily
/// tendered cache of candidate costs. Only feasible offers are kept.
#[derive(Clone, Debug)]
pub struct TaskRequest {
    id: TaskId,
    source: SourceId,
    token: EntryToken,
    offers: HashMap<usize, TaskCost>,
}

impl TaskRequest {
    pub fn new(source: SourceId, size: usize) -> Self {
        TaskRequest {
            id: TaskId::fresh(),
            source,
            token: EntryToken::new(size),
            offers: HashMap::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn size(&self) -> usize {
        self.token.size()
    }

    pub fn token(&self) -> &EntryToken {
        &self.token
    }

    pub(crate) fn token_mut(&mut self) -> &mut EntryToken {
        &mut self.token
    }

    /// Ask every candidate not yet priced for its cost, caching the
    /// feasible answers. Costs are computed once per pairing and never
    /// recomputed unless [`reset_costs`](Self::reset_costs) is called.
    pub fn tender_costs(&mut self, candidates: &mut [Candidate], model: &dyn CostModel) {
        for (index, candidate) in candidates.iter_mut().enumerate() {
            if self.offers.contains_key(&index) {
                continue;
            }
            let cost = candidate.tender(self, model);
            if cost.is_feasible() {
                self.offers.insert(index, cost);
            }
        }
    }

    /// Effective cost of one candidate, infinite when no feasible offer
    /// was tendered.
    pub fn cost_of(&self, candidate: usize) -> f64 {
        self.offers
            .get(&candidate)
            .map_or(f64::INFINITY, TaskCost::final_value)
    }

    pub fn count_viable_candidates(&self) -> usize {
        self.offers.len()
    }

    pub fn viable_candidates(&self) -> impl Iterator<Item = usize> + '_ {
        self.offers.keys().copied()
    }

    pub fn reset_costs(&mut self) {
        self.offers.clear();
    }
}

impl PartialEq for TaskRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskRequest {}

/// A candidate or confirmed matching edge.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Assignment {
    pub task: TaskId,
    pub grouping: GroupingId,
}

/// An immutable set of task requests sharing one size, solved by exactly
/// one auction at a time. Receives the confirmed assignment set as its
/// outcome.
#[derive(Clone, Debug)]
pub struct TaskBatch {
    id: u32,
    task_size: usize,
    tasks: Vec<TaskRequest>,
    outcome: Vec<Assignment>,
}

impl TaskBatch {
    /// Tasks whose token size differs from `task_size` are rejected. An
    /// empty batch is allowed; validating one ends the auction early.
    pub fn new(tasks: Vec<TaskRequest>, task_size: usize) -> Result<Self> {
        for task in &tasks {
            ensure!(
                task.size() == task_size,
                "task {:?} of size {} cannot join a batch of size {}",
                task.id(),
                task.size(),
                task_size,
            );
        }
        Ok(TaskBatch {
            id: BATCH_IDS.fetch_add(1, Ordering::Relaxed),
            task_size,
            tasks,
            outcome: Vec::new(),
        })
    }

    pub fn serial(&self) -> u32 {
        self.id
    }

    pub fn task_size(&self) -> usize {
        self.task_size
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskRequest] {
        &self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [TaskRequest] {
        &mut self.tasks
    }

    pub fn outcome(&self) -> &[Assignment] {
        &self.outcome
    }

    pub(crate) fn set_outcome(&mut self, outcome: Vec<Assignment>) {
        self.outcome = outcome;
    }

    pub(crate) fn clear_outcome(&mut self) {
        self.outcome.clear();
    }

    /// Summed bandwidth figure over the batch's sources, for queue
    /// ordering by outer layers.
    pub fn total_bandwidth(&self, sources: &dyn TaskSources) -> u32 {
        self.tasks
            .iter()
            .map(|t| sources.total_bandwidth(t.source()))
            .sum()
    }

    /// Largest bandwidth figure over the batch's sources.
    pub fn max_bandwidth(&self, sources: &dyn TaskSources) -> u32 {
        self.tasks
            .iter()
            .map(|t| sources.max_bandwidth(t.source()))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_distinct_by_identity() {
        let a = TaskRequest::new(SourceId(0), 2);
        let b = TaskRequest::new(SourceId(0), 2);
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.token().serial(), b.token().serial());
    }

    #[test]
    fn unoffered_candidates_cost_infinity() {
        let task = TaskRequest::new(SourceId(0), 1);
        assert_eq!(task.cost_of(3), f64::INFINITY);
        assert_eq!(task.count_viable_candidates(), 0);
    }

    #[test]
    fn batches_reject_mixed_token_sizes() {
        let tasks = vec![TaskRequest::new(SourceId(0), 2), TaskRequest::new(SourceId(0), 3)];
        assert!(TaskBatch::new(tasks, 2).is_err());
    }

    #[test]
    fn empty_batches_are_allowed() {
        let batch = TaskBatch::new(Vec::new(), 1).unwrap();
        assert!(batch.is_empty());
    }
}
