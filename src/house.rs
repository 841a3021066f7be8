//! LIFO stacks of settled auctions, with commit and rollback as exact
//! inverses so that backtracking can undo any prefix of the history and
//! try again.

use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, instrument};

use crate::auction::{Auction, AuctionState};
use crate::model::{Candidate, CostModel, DomainId, SourceId, TaskBatch, TaskId, TaskSources, WorkerPool};

/// Recently failed auctions are kept for inspection, but only this many.
const FAILURE_STACK_CAPACITY: usize = 5;

/// Sequences auctions over a shared worker pool. Successes stack up;
/// undoing one rolls its commitments back and demotes it to the bounded
/// failure cache.
#[derive(Default)]
pub struct AuctionHouse {
    successes: Vec<Auction>,
    failures: VecDeque<Auction>,
}

impl AuctionHouse {
    pub fn new() -> Self {
        AuctionHouse::default()
    }

    pub fn success_count(&self) -> usize {
        self.successes.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn last_success(&self) -> Option<&Auction> {
        self.successes.last()
    }

    /// Build, validate and call a new auction for the batch. With
    /// `use_proxies`, batches of more than one task are offered one
    /// domain-proxy column per feasible domain instead of raw groupings,
    /// limiting allocation to one per domain; when the domains cannot
    /// cover the batch the raw groupings are used after all. A success is
    /// committed to the pool and sources immediately.
    #[instrument(skip_all, fields(batch = %batch.serial()))]
    pub fn create_next(
        &mut self,
        pool: &mut WorkerPool,
        sources: &mut dyn TaskSources,
        model: &dyn CostModel,
        batch: TaskBatch,
        use_proxies: bool,
    ) -> AuctionState {
        let candidates = Self::candidates_for(pool, sources, &batch, use_proxies);
        let mut auction = Auction::new(candidates, batch);
        let mut state = auction.validate();
        if state == AuctionState::ReadyToCall {
            state = auction.call(model);
        }
        if state == AuctionState::Success {
            Self::commit(pool, sources, &auction);
            self.successes.push(auction);
        } else {
            self.push_failed(auction);
        }
        debug!(state = ?state, successes = %self.successes.len(), "auction settled");
        state
    }

    /// Undo the most recent success and ask it for the next-best distinct
    /// outcome. The alternative is recommitted on success; otherwise the
    /// auction is demoted to the failure cache. An empty success stack is
    /// the root of the tree: nothing left to revisit.
    #[instrument(skip_all)]
    pub fn branch_from_last(
        &mut self,
        pool: &mut WorkerPool,
        sources: &mut dyn TaskSources,
        model: &dyn CostModel,
    ) -> AuctionState {
        let Some(mut auction) = self.successes.pop() else {
            return AuctionState::TreeFailure;
        };
        Self::rollback(pool, sources, &auction);
        let state = auction.find_alternative(model);
        if state == AuctionState::Success {
            Self::commit(pool, sources, &auction);
            self.successes.push(auction);
        } else {
            self.push_failed(auction);
        }
        debug!(state = ?state, successes = %self.successes.len(), "branched from last success");
        state
    }

    /// Roll back up to `count` successes, most recent first, demoting each
    /// to the failure cache. Ends quietly when the stack runs out.
    #[instrument(skip_all)]
    pub fn undo_some(
        &mut self,
        pool: &mut WorkerPool,
        sources: &mut dyn TaskSources,
        count: usize,
    ) {
        for _ in 0..count {
            let Some(auction) = self.successes.pop() else {
                return;
            };
            Self::rollback(pool, sources, &auction);
            self.push_failed(auction);
        }
    }

    fn candidates_for(
        pool: &WorkerPool,
        sources: &dyn TaskSources,
        batch: &TaskBatch,
        use_proxies: bool,
    ) -> Vec<Candidate> {
        let size = batch.task_size();
        if use_proxies && batch.len() > 1 {
            let unused: BTreeSet<DomainId> = batch
                .tasks()
                .iter()
                .flat_map(|task| sources.unused_domains(task.source()))
                .collect();
            if let Some(by_domain) = pool.available_by_domain(size, batch.len(), &unused) {
                return by_domain
                    .into_iter()
                    .map(|(domain, members)| Candidate::proxy(domain, members, size))
                    .collect();
            }
        }
        pool.available_groupings(size)
            .into_iter()
            .map(|grouping| Candidate::concrete(grouping, size))
            .collect()
    }

    fn source_of(auction: &Auction, task: TaskId) -> SourceId {
        auction
            .batch()
            .tasks()
            .iter()
            .find(|t| t.id() == task)
            .expect("confirmed task missing from its batch")
            .source()
    }

    fn commit(pool: &mut WorkerPool, sources: &mut dyn TaskSources, auction: &Auction) {
        for assignment in auction.result() {
            let source = Self::source_of(auction, assignment.task);
            sources.receive_grouping(source, assignment.task, assignment.grouping);
            pool.assign_all(&[assignment.grouping]);
        }
    }

    fn rollback(pool: &mut WorkerPool, sources: &mut dyn TaskSources, auction: &Auction) {
        for assignment in auction.result() {
            let source = Self::source_of(auction, assignment.task);
            sources.recall_grouping(source, assignment.task, assignment.grouping);
            pool.reset_availability(&[assignment.grouping]);
        }
    }

    fn push_failed(&mut self, auction: Auction) {
        self.failures.push_front(auction);
        self.failures.truncate(FAILURE_STACK_CAPACITY);
    }
}
