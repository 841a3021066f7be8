//! One matching attempt over one task batch and one candidate snapshot: a
//! small state machine wrapping one assignment solver.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use crate::model::{Assignment, Candidate, CostModel, TaskBatch};
use crate::solver::{AssignmentSolver, Viability};

static AUCTION_IDS: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuctionState {
    Initialised,
    ReadyToCall,
    Success,
    /// Not enough candidates, no viable matching, or the alternative
    /// search is spent.
    Failure,
    /// Backtracking ran past the root: no success left to branch from.
    TreeFailure,
    /// The batch held no tasks, so there was nothing to do.
    EmptyBatch,
}

/// A node in the allocation decision tree. Alternative outcomes are
/// explored by re-running the auction with further assignment sets
/// forbidden; the actual matching decision is deferred to the solver.
pub struct Auction {
    id: u32,
    batch: TaskBatch,
    candidates: Vec<Candidate>,
    solver: Option<AssignmentSolver>,
    result: Vec<Assignment>,
    state: AuctionState,
}

impl Auction {
    /// The batch may have been processed before on a different branch, so
    /// stale costs and outcomes are dropped here.
    pub fn new(candidates: Vec<Candidate>, mut batch: TaskBatch) -> Auction {
        for task in batch.tasks_mut() {
            task.reset_costs();
        }
        batch.clear_outcome();
        Auction {
            id: AUCTION_IDS.fetch_add(1, Ordering::Relaxed),
            batch,
            candidates,
            solver: None,
            result: Vec::new(),
            state: AuctionState::Initialised,
        }
    }

    pub fn serial(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> AuctionState {
        self.state
    }

    pub fn batch(&self) -> &TaskBatch {
        &self.batch
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn solver(&self) -> Option<&AssignmentSolver> {
        self.solver.as_ref()
    }

    /// The confirmed assignment set, resolved to concrete groupings.
    /// Empty unless the auction is in [`AuctionState::Success`].
    pub fn result(&self) -> &[Assignment] {
        &self.result
    }

    /// Cheap checks before anything is solved: enough candidates of the
    /// batch's task size, and a batch worth calling at all.
    pub fn validate(&mut self) -> AuctionState {
        let fitting = self
            .candidates
            .iter()
            .filter(|c| c.size() == self.batch.task_size())
            .count();
        self.state = if fitting < self.batch.len() {
            AuctionState::Failure
        } else if self.batch.is_empty() {
            AuctionState::EmptyBatch
        } else {
            AuctionState::ReadyToCall
        };
        debug!(auction = %self.id, state = ?self.state, "validated");
        self.state
    }

    /// Run one solve attempt. Success means the confirmed set covers the
    /// batch exactly; anything else - including a padded or partial
    /// matching - is a failure.
    pub fn call(&mut self, model: &dyn CostModel) -> AuctionState {
        if matches!(self.state, AuctionState::Failure | AuctionState::EmptyBatch) {
            return self.state;
        }
        self.set_tokens_live(true);

        if self.solver.is_none() {
            self.build_solver(model);
            if self.state == AuctionState::Failure {
                self.set_tokens_live(false);
                return self.state;
            }
        }

        let solver = self.solver.as_mut().unwrap();
        if solver.solve() && solver.assignments().len() == self.batch.len() {
            let assignments = solver.assignments().to_vec();
            match self.resolve(&assignments) {
                Some(resolved) => {
                    self.result = resolved.clone();
                    self.batch.set_outcome(resolved);
                    self.state = AuctionState::Success;
                }
                None => self.state = AuctionState::Failure,
            }
        } else {
            self.state = AuctionState::Failure;
        }

        self.set_tokens_live(false);
        debug!(auction = %self.id, state = ?self.state, "called");
        self.state
    }

    /// Ask the solver for the next-best distinct assignment set. A solver
    /// that pre-committed everything has nothing else to offer, and a
    /// terminally failed one cannot re-enter the call.
    pub fn find_alternative(&mut self, model: &dyn CostModel) -> AuctionState {
        self.result.clear();
        self.batch.clear_outcome();
        self.state = AuctionState::ReadyToCall;
        match self.solver.as_ref().map(AssignmentSolver::viability) {
            Some(Viability::Live) => {
                self.call(model);
            }
            Some(_) => self.state = AuctionState::Failure,
            None => {}
        }
        self.state
    }

    fn build_solver(&mut self, model: &dyn CostModel) {
        for task in self.batch.tasks_mut() {
            task.tender_costs(&mut self.candidates, model);
        }
        let solver = AssignmentSolver::new(self.batch.tasks(), self.candidates.len());
        if matches!(
            solver.viability(),
            Viability::InfeasibleInput | Viability::InternalError
        ) {
            self.state = AuctionState::Failure;
        }
        self.solver = Some(solver);
    }

    /// Resolve solver edges to concrete groupings, unboxing any proxy to
    /// its per-task choice. A proxy with no choice, or two edges landing
    /// on the same concrete grouping, voids the whole set.
    fn resolve(&self, edges: &[(usize, usize)]) -> Option<Vec<Assignment>> {
        let mut resolved = Vec::with_capacity(edges.len());
        let mut groupings = BTreeSet::new();
        for &(task_index, candidate_index) in edges {
            let task = self.batch.tasks()[task_index].id();
            let grouping = self.candidates[candidate_index].resolve(task)?;
            if !groupings.insert(grouping) {
                return None;
            }
            resolved.push(Assignment { task, grouping });
        }
        Some(resolved)
    }

    fn set_tokens_live(&mut self, live: bool) {
        for task in self.batch.tasks_mut() {
            task.token_mut().set_live(live);
        }
    }
}
