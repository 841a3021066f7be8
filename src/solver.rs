//! Stateful orchestrator around the cost matrix: normalizes non-square
//! problems, pre-commits forced assignments, runs the Hungarian kernel, and
//! drives the iterative search for alternative solutions.

use std::collections::BTreeSet;

use pathfinding::matrix::Matrix;
use tracing::{debug, trace};

use crate::combinatorial::SubsetEnumerator;
use crate::matrix::CostMatrix;
use crate::model::TaskRequest;

/// One live pairing in the auction's index space: (task index, candidate
/// index).
pub type Edge = (usize, usize);

/// Terminal/non-terminal classification of whether the solver can still
/// produce (further) solutions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Viability {
    /// Can solve, and iterate for alternatives.
    Live,
    /// Every task had a unique viable candidate; the result is fixed and
    /// no alternative is structurally possible.
    ForcedOnly,
    /// Some task had no viable candidate at all.
    InfeasibleInput,
    /// Sizing went wrong or the reduction produced NaN.
    InternalError,
    /// The combinatorial space is drained; no further solution exists.
    SearchExhausted,
}

/// Solves one batch of tendered task requests against one candidate list.
///
/// The first [`solve`](Self::solve) returns the optimum; every later call
/// searches for the next-best *distinct* assignment set by forbidding
/// combinations of edges, cheapest first. Once the base costs have changed
/// externally the solver must be discarded.
pub struct AssignmentSolver {
    n_tasks: usize,
    n_candidates: usize,
    base_costs: Vec<Vec<f64>>,
    viable: Vec<BTreeSet<usize>>,
    forced: Vec<Edge>,
    matrix_tasks: Vec<usize>,
    matrix_candidates: Vec<usize>,
    template: Option<CostMatrix>,
    active: Option<CostMatrix>,
    enumerator: Option<SubsetEnumerator<Edge>>,
    seen_branches: BTreeSet<Vec<Edge>>,
    confirmed: Vec<Edge>,
    viability: Viability,
    solved: usize,
}

impl AssignmentSolver {
    /// The tasks must already have tendered their costs against the
    /// candidate list; only the cached offers are consulted here.
    pub fn new(tasks: &[TaskRequest], n_candidates: usize) -> AssignmentSolver {
        let n_tasks = tasks.len();
        let mut base_costs = vec![vec![f64::INFINITY; n_candidates]; n_tasks];
        let mut viable: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n_tasks];
        for (t, task) in tasks.iter().enumerate() {
            for c in task.viable_candidates() {
                base_costs[t][c] = task.cost_of(c);
                viable[t].insert(c);
            }
        }

        let mut solver = AssignmentSolver {
            n_tasks,
            n_candidates,
            base_costs,
            viable,
            forced: Vec::new(),
            matrix_tasks: Vec::new(),
            matrix_candidates: Vec::new(),
            template: None,
            active: None,
            enumerator: None,
            seen_branches: BTreeSet::new(),
            confirmed: Vec::new(),
            viability: Viability::Live,
            solved: 0,
        };
        solver.initialize();
        solver
    }

    fn initialize(&mut self) {
        if self.viable.iter().any(BTreeSet::is_empty) {
            self.viability = Viability::InfeasibleInput;
            debug!("a task has no viable candidate");
            return;
        }

        self.extract_forced_assignments();

        let forced_tasks: BTreeSet<usize> = self.forced.iter().map(|&(t, _)| t).collect();
        self.matrix_tasks = (0..self.n_tasks).filter(|t| !forced_tasks.contains(t)).collect();
        if self.matrix_tasks.is_empty() {
            self.viability = Viability::ForcedOnly;
            debug!(forced = %self.forced.len(), "all tasks pre-committed, no matrix needed");
            return;
        }

        let forced_candidates: BTreeSet<usize> = self.forced.iter().map(|&(_, c)| c).collect();
        self.matrix_candidates = (0..self.n_candidates)
            .filter(|c| !forced_candidates.contains(c))
            .collect();

        // Padding squares the problem; a batch larger than the candidate
        // list cannot be padded and is a sizing failure.
        if self.matrix_candidates.len() < self.matrix_tasks.len() {
            self.viability = Viability::InternalError;
            return;
        }

        let size = self.matrix_candidates.len();
        let mut grid = Matrix::new(size, size, 0.0f64);
        for (row, &candidate) in self.matrix_candidates.iter().enumerate() {
            for (col, &task) in self.matrix_tasks.iter().enumerate() {
                grid[(row, col)] = self.base_costs[task][candidate];
            }
        }
        let mut template = CostMatrix::new(grid);
        template.reduce();
        if template.any_nan() {
            self.viability = Viability::InternalError;
            return;
        }
        self.active = Some(template.branch());
        self.template = Some(template);
        debug!(
            size = %size,
            tasks = %self.matrix_tasks.len(),
            forced = %self.forced.len(),
            "cost matrix initialised"
        );
    }

    /// Repeatedly pre-commit tasks with exactly one viable candidate,
    /// removing that candidate from every other task's options, since
    /// candidates are exclusive.
    fn extract_forced_assignments(&mut self) {
        let mut keep_checking = true;
        while keep_checking {
            keep_checking = false;
            for task in 0..self.n_tasks {
                if self.viable[task].len() != 1 {
                    continue;
                }
                let candidate = *self.viable[task].iter().next().unwrap();
                self.forced.push((task, candidate));
                self.viable[task].clear();
                for other in 0..self.n_tasks {
                    self.viable[other].remove(&candidate);
                }
                keep_checking = true;
            }
        }
    }

    pub fn viability(&self) -> Viability {
        self.viability
    }

    pub fn has_matrix(&self) -> bool {
        self.template.is_some()
    }

    /// The confirmed assignment set of the most recent successful solve,
    /// as (task index, candidate index) pairs. Padding never appears.
    pub fn assignments(&self) -> &[Edge] {
        &self.confirmed
    }

    /// Tender-time cost of the confirmed set, `None` when nothing is
    /// confirmed.
    pub fn total_cost(&self) -> Option<f64> {
        if self.confirmed.is_empty() {
            return None;
        }
        Some(
            self.confirmed
                .iter()
                .map(|&(t, c)| self.base_costs[t][c])
                .sum(),
        )
    }

    /// Run one solve step. The first call produces the optimal assignment;
    /// each later call searches for the next-best distinct one. `false`
    /// leaves the previous confirmed set cleared and, when the search
    /// space is drained, parks the solver in
    /// [`Viability::SearchExhausted`].
    pub fn solve(&mut self) -> bool {
        let outcome = match self.viability {
            Viability::ForcedOnly => true,
            Viability::Live => {
                if self.solved == 0 && self.seen_branches.is_empty() {
                    self.solve_active_matrix()
                } else {
                    self.solve_next()
                }
            }
            _ => false,
        };
        self.finish(outcome)
    }

    /// Assemble the confirmed set: forced assignments first, then the
    /// starred cells of the solved matrix. Any duplicated task or
    /// candidate clears the whole set rather than reporting an
    /// inconsistent matching.
    fn finish(&mut self, outcome: bool) -> bool {
        let mut outcome = outcome;
        self.confirmed.clear();
        if outcome {
            self.confirmed.extend(self.forced.iter().copied());
            if self.template.is_some() {
                for edge in self.active_solution() {
                    let duplicate = self
                        .confirmed
                        .iter()
                        .any(|&(t, c)| t == edge.0 || c == edge.1);
                    if duplicate {
                        self.confirmed.clear();
                        break;
                    }
                    self.confirmed.push(edge);
                }
            }
        }
        if self.confirmed.is_empty() {
            outcome = false;
        } else {
            self.solved += 1;
        }
        outcome
    }

    /// Non-padding starred cells of the active matrix, in auction index
    /// space.
    fn active_solution(&self) -> Vec<Edge> {
        let Some(active) = &self.active else {
            return Vec::new();
        };
        active
            .starred_cells()
            .into_iter()
            .filter(|&(_, col)| col < self.matrix_tasks.len())
            .map(|(row, col)| (self.matrix_tasks[col], self.matrix_candidates[row]))
            .collect()
    }

    /// The crossing/modification loop. On a solved matrix the assignment
    /// set is recorded; reproducing an already-seen set is not a result,
    /// so the caller keeps searching.
    fn solve_active_matrix(&mut self) -> bool {
        let active = self.active.as_mut().expect("no cost matrix to solve");
        loop {
            if active.apply_minimum_crossings() {
                break;
            }
            if !active.modify_costs_by_lowest_uncrossed() {
                return false;
            }
        }
        let mut branch = self.active_solution();
        branch.sort_unstable();
        self.seen_branches.insert(branch)
    }

    /// Iterative alternative search: forbid the next candidate combination
    /// of edges, re-reduce, and solve, until a distinct solution appears
    /// or the space is drained.
    fn solve_next(&mut self) -> bool {
        loop {
            if self.enumerator.is_none() && !self.rebuild_enumerator() {
                self.viability = Viability::SearchExhausted;
                debug!(solved = %self.solved, "alternative search exhausted");
                return false;
            }
            match self.enumerator.as_mut().unwrap().next_mask() {
                None => {
                    // This universe is drained; retiring it rebuilds the
                    // enumerator (or ends the search) on the next pass.
                    if !self.retire_enumerator() {
                        self.viability = Viability::SearchExhausted;
                        debug!(solved = %self.solved, "alternative search exhausted");
                        return false;
                    }
                }
                Some(mask) => {
                    let edges: Vec<Edge> = {
                        let enumerator = self.enumerator.as_ref().unwrap();
                        enumerator.items(mask).copied().collect()
                    };
                    let mut branch = self.template.as_ref().unwrap().branch();
                    for &edge in &edges {
                        if let Some((row, col)) = self.matrix_coords(edge) {
                            branch.override_cost(row, col, f64::INFINITY);
                        }
                    }
                    branch.reduce();
                    if !branch.check_viable() {
                        // This combination alone kills the matrix, so any
                        // superset of it is dead too.
                        trace!(mask = %format!("{mask:#b}"), "combination unviable, avoiding supersets");
                        self.enumerator.as_mut().unwrap().add_avoid_mask(mask);
                        continue;
                    }
                    self.active = Some(branch);
                    if self.solve_active_matrix() {
                        return true;
                    }
                }
            }
        }
    }

    /// Build a fresh enumerator over the ranked live edges, retiring an
    /// exhausted one first. `false` when the search space is gone.
    fn rebuild_enumerator(&mut self) -> bool {
        let ranking = self.build_ranking();
        if ranking.is_empty() {
            return false;
        }
        debug!(edges = %ranking.len(), "seeding alternative search order");
        self.enumerator = Some(SubsetEnumerator::new(ranking));
        true
    }

    /// Every combination over the exhausted universe failed, so each of
    /// its edges is individually part of no further solution: forbid them
    /// permanently, rewrite the cached branches they subsumed, and check
    /// the template still stands.
    fn retire_enumerator(&mut self) -> bool {
        let Some(old) = self.enumerator.take() else {
            return false;
        };
        let universe = old.elements().to_vec();
        debug!(edges = %universe.len(), "retiring drained edge universe");
        for &(task, candidate) in &universe {
            if let Some((row, col)) = self.matrix_coords((task, candidate)) {
                self.template
                    .as_mut()
                    .unwrap()
                    .override_cost(row, col, f64::INFINITY);
            }
            self.viable[task].remove(&candidate);
        }
        self.retire_subsumed_branches(&universe);
        if !self.template.as_ref().unwrap().check_viable() {
            return false;
        }
        self.rebuild_enumerator()
    }

    fn retire_subsumed_branches(&mut self, eliminated: &[Edge]) {
        let eliminated: BTreeSet<Edge> = eliminated.iter().copied().collect();
        let old = std::mem::take(&mut self.seen_branches);
        for branch in old {
            let live: Vec<Edge> = branch
                .into_iter()
                .filter(|edge| !eliminated.contains(edge))
                .collect();
            if !live.is_empty() {
                self.seen_branches.insert(live);
            }
        }
    }

    /// Rank the live edges: cheapest tender-time cost first, ties broken
    /// by a round-robin interleave across tasks with the fewest options,
    /// themselves ordered by summed row-and-column cost. Capped at the
    /// enumerator's capacity; the overflow is reached after the first
    /// tranche retires.
    fn build_ranking(&self) -> Vec<Edge> {
        let cross_sum = |(task, candidate): Edge| -> f64 {
            let row: f64 = self.viable[task]
                .iter()
                .map(|&c| self.base_costs[task][c])
                .sum();
            let column: f64 = (0..self.n_tasks)
                .filter(|&t| t != task && self.viable[t].contains(&candidate))
                .map(|t| self.base_costs[t][candidate])
                .sum();
            row + column
        };

        let mut per_task: Vec<(usize, Vec<Edge>)> = (0..self.n_tasks)
            .filter(|&t| !self.viable[t].is_empty())
            .map(|t| {
                let mut edges: Vec<Edge> = self.viable[t].iter().map(|&c| (t, c)).collect();
                edges.sort_by(|&a, &b| cross_sum(a).total_cmp(&cross_sum(b)));
                (t, edges)
            })
            .collect();
        per_task.sort_by_key(|(t, edges)| (edges.len(), *t));

        let mut interleaved = Vec::new();
        let mut depth = 0;
        loop {
            let mut advanced = false;
            for (_, edges) in &per_task {
                if let Some(&edge) = edges.get(depth) {
                    interleaved.push(edge);
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
            depth += 1;
        }

        // Stable sort: equal costs keep the interleaved order.
        let mut ranking = interleaved;
        ranking.sort_by(|&(ta, ca), &(tb, cb)| {
            self.base_costs[ta][ca].total_cmp(&self.base_costs[tb][cb])
        });
        ranking.truncate(SubsetEnumerator::<Edge>::MAX_ELEMENTS);
        ranking
    }

    fn matrix_coords(&self, (task, candidate): Edge) -> Option<(usize, usize)> {
        let row = self.matrix_candidates.iter().position(|&c| c == candidate)?;
        let col = self.matrix_tasks.iter().position(|&t| t == task)?;
        Some((row, col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Candidate, CostModel, GroupingId, SourceId, TaskCost};

    struct Table {
        costs: Vec<Vec<f64>>,
    }

    impl CostModel for Table {
        fn calculate_cost(&self, grouping: GroupingId, task: &TaskRequest) -> TaskCost {
            let value = self.costs[task.size() - 1][grouping.0];
            if value.is_finite() {
                TaskCost::new(value)
            } else {
                TaskCost::INFEASIBLE
            }
        }
    }

    /// Build a solver over `costs[task][candidate]`, using token size as a
    /// back-channel to identify tasks inside the table model.
    fn solver_over(costs: &[&[f64]]) -> AssignmentSolver {
        let n_candidates = costs[0].len();
        let mut candidates: Vec<Candidate> = (0..n_candidates)
            .map(|c| Candidate::concrete(GroupingId(c), 1))
            .collect();
        let model = Table {
            costs: costs.iter().map(|row| row.to_vec()).collect(),
        };
        let mut tasks: Vec<TaskRequest> = (0..costs.len())
            .map(|t| TaskRequest::new(SourceId(0), t + 1))
            .collect();
        for task in &mut tasks {
            task.tender_costs(&mut candidates, &model);
        }
        AssignmentSolver::new(&tasks, n_candidates)
    }

    fn sorted(edges: &[Edge]) -> Vec<Edge> {
        let mut edges = edges.to_vec();
        edges.sort_unstable();
        edges
    }

    #[test]
    fn first_solve_returns_the_unique_optimum() {
        let mut solver = solver_over(&[&[4.0, 1.0, 3.0], &[2.0, 0.0, 5.0], &[3.0, 2.0, 2.0]]);
        assert_eq!(solver.viability(), Viability::Live);
        assert!(solver.solve());
        assert_eq!(sorted(solver.assignments()), vec![(0, 1), (1, 0), (2, 2)]);
        assert_eq!(solver.total_cost(), Some(5.0));
    }

    #[test]
    fn padding_fills_the_missing_tasks() {
        // Three candidates, two tasks: one zero-cost padding column.
        let mut solver = solver_over(&[&[1.0, 2.0, 3.0], &[2.0, 4.0, 8.0]]);
        assert!(solver.solve());
        let assignments = solver.assignments();
        assert_eq!(assignments.len(), 2);
        let tasks: BTreeSet<usize> = assignments.iter().map(|&(t, _)| t).collect();
        assert_eq!(tasks, BTreeSet::from([0, 1]));
    }

    #[test]
    fn task_without_options_is_infeasible_input() {
        let inf = f64::INFINITY;
        let solver = solver_over(&[&[1.0, 2.0], &[inf, inf]]);
        assert_eq!(solver.viability(), Viability::InfeasibleInput);
        assert!(!solver.has_matrix());
    }

    #[test]
    fn unique_options_everywhere_mean_forced_only() {
        let inf = f64::INFINITY;
        let mut solver = solver_over(&[&[1.0, inf, inf], &[inf, 2.0, inf], &[inf, inf, 3.0]]);
        assert_eq!(solver.viability(), Viability::ForcedOnly);
        assert!(!solver.has_matrix());
        assert!(solver.solve());
        assert_eq!(sorted(solver.assignments()), vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn forcing_cascades_through_freed_candidates() {
        let inf = f64::INFINITY;
        // Task 0 can only take candidate 0; with 0 gone, task 1 can only
        // take candidate 1; task 2 keeps a real choice.
        let mut solver = solver_over(&[
            &[5.0, inf, inf, inf],
            &[3.0, 4.0, inf, inf],
            &[1.0, 2.0, 3.0, 4.0],
        ]);
        assert_eq!(solver.viability(), Viability::Live);
        assert!(solver.solve());
        let assignments = sorted(solver.assignments());
        assert_eq!(&assignments[..2], &[(0, 0), (1, 1)]);
        assert_eq!(assignments[2].0, 2);
    }

    #[test]
    fn more_tasks_than_candidates_is_a_sizing_error() {
        // Task 0 is forced onto the only candidate, stranding task 1 with
        // nothing to pad the matrix with.
        let mut solver = solver_over(&[&[1.0], &[2.0]]);
        assert_eq!(solver.viability(), Viability::InternalError);
        assert!(!solver.solve());
    }

    #[test]
    fn alternatives_are_distinct_and_never_cheaper() {
        let mut solver = solver_over(&[&[1.0, 5.0, 9.0], &[2.0, 6.0, 10.0], &[3.0, 7.0, 11.0]]);
        assert!(solver.solve());
        let first = sorted(solver.assignments());
        let first_cost = solver.total_cost().unwrap();

        let mut previous_cost = first_cost;
        let mut seen = vec![first];
        while solver.solve() {
            let next = sorted(solver.assignments());
            let next_cost = solver.total_cost().unwrap();
            assert!(!seen.contains(&next), "{next:?} repeated");
            assert!(
                next_cost >= previous_cost,
                "cost regressed from {previous_cost} to {next_cost}"
            );
            seen.push(next);
            previous_cost = next_cost;
        }
        assert_eq!(solver.viability(), Viability::SearchExhausted);
        // A 3x3 all-finite problem has six distinct assignments.
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn exhausted_solver_stays_exhausted() {
        let mut solver = solver_over(&[&[1.0, 2.0], &[3.0, 4.0]]);
        assert!(solver.solve());
        while solver.solve() {}
        assert_eq!(solver.viability(), Viability::SearchExhausted);
        assert!(!solver.solve());
        assert_eq!(solver.viability(), Viability::SearchExhausted);
    }

    #[test]
    fn second_solution_forbids_an_edge_of_the_first() {
        let mut solver = solver_over(&[&[1.0, 4.0], &[2.0, 8.0]]);
        assert!(solver.solve());
        // Optimum pairs task 0 with candidate 1 and task 1 with candidate
        // 0: 4 + 2 beats 1 + 8.
        assert_eq!(sorted(solver.assignments()), vec![(0, 1), (1, 0)]);
        assert_eq!(solver.total_cost(), Some(6.0));

        assert!(solver.solve());
        assert_eq!(sorted(solver.assignments()), vec![(0, 0), (1, 1)]);
        assert_eq!(solver.total_cost(), Some(9.0));
    }
}
