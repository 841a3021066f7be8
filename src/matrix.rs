//! Square cost matrix and the Hungarian (Munkres) reduction/augmentation
//! steps. The matrix is pure index space; which candidate or task a row or
//! column stands for is the solver's business.

use std::sync::atomic::{AtomicU32, Ordering};

use pathfinding::matrix::Matrix;
use tracing::trace;

static MATRIX_IDS: AtomicU32 = AtomicU32::new(0);

/// Mutable state for one solve pass: costs, crossed rows/columns, starred
/// and primed zeros, and a cache of zero-cell coordinates. Deep-cloned via
/// [`branch`](CostMatrix::branch) to explore an alternative.
#[derive(Clone, Debug)]
pub struct CostMatrix {
    id: u32,
    size: usize,
    costs: Matrix<f64>,
    starred: Matrix<bool>,
    primed: Matrix<bool>,
    rows_crossed: Vec<bool>,
    cols_crossed: Vec<bool>,
    zero_cells: Vec<(usize, usize)>,
}

impl CostMatrix {
    /// The grid must be square; anything else is a caller error.
    pub fn new(costs: Matrix<f64>) -> Self {
        assert_eq!(
            costs.rows, costs.columns,
            "{} rows must equal {} columns",
            costs.rows, costs.columns,
        );
        let size = costs.rows;
        CostMatrix {
            id: MATRIX_IDS.fetch_add(1, Ordering::Relaxed),
            size,
            costs,
            starred: Matrix::new(size, size, false),
            primed: Matrix::new(size, size, false),
            rows_crossed: vec![false; size],
            cols_crossed: vec![false; size],
            zero_cells: Vec::new(),
        }
    }

    pub fn serial(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cost(&self, row: usize, column: usize) -> f64 {
        self.costs[(row, column)]
    }

    /// Deep copy of all mutable grids under a fresh serial, to branch a
    /// search without disturbing the template.
    pub fn branch(&self) -> CostMatrix {
        let mut clone = self.clone();
        clone.id = MATRIX_IDS.fetch_add(1, Ordering::Relaxed);
        clone
    }

    /// Escape hatch for unsolvable grids: a row or column of nothing but
    /// infinity can never hold an assignment.
    pub fn check_viable(&self) -> bool {
        let mut infinite_per_row = vec![0usize; self.size];
        let mut infinite_per_column = vec![0usize; self.size];
        for row in 0..self.size {
            for column in 0..self.size {
                if self.costs[(row, column)] == f64::INFINITY {
                    infinite_per_row[row] += 1;
                    if infinite_per_row[row] == self.size {
                        return false;
                    }
                    infinite_per_column[column] += 1;
                    if infinite_per_column[column] == self.size {
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn any_nan(&self) -> bool {
        (0..self.size)
            .any(|row| (0..self.size).any(|column| self.costs[(row, column)].is_nan()))
    }

    /// Subtract each column's minimum, then each row's minimum, and cache
    /// the zero cells that result.
    pub fn reduce(&mut self) {
        for column in 0..self.size {
            let lowest = (0..self.size)
                .map(|row| self.costs[(row, column)])
                .fold(f64::INFINITY, f64::min);
            if lowest.is_finite() && lowest != 0.0 {
                for row in 0..self.size {
                    self.costs[(row, column)] -= lowest;
                }
            }
        }
        for row in 0..self.size {
            let lowest = (0..self.size)
                .map(|column| self.costs[(row, column)])
                .fold(f64::INFINITY, f64::min);
            if lowest.is_finite() && lowest != 0.0 {
                for column in 0..self.size {
                    self.costs[(row, column)] -= lowest;
                }
            }
        }
        self.zero_cells.clear();
        self.cache_zero_cells();
    }

    fn cache_zero_cells(&mut self) {
        for row in 0..self.size {
            for column in 0..self.size {
                if self.costs[(row, column)] == 0.0 {
                    self.zero_cells.push((row, column));
                }
            }
        }
    }

    /// Force one cell, typically to infinity to forbid a pairing. The zero
    /// cache is invalid afterwards until the next reduction or crossing
    /// pass rebuilds it.
    pub fn override_cost(&mut self, row: usize, column: usize, value: f64) {
        self.zero_cells.clear();
        self.costs[(row, column)] = value;
    }

    /// Cover the zeros of the matrix with stars and crossings. `true`
    /// means the matrix is solved: one starred cell per row and column,
    /// readable via [`starred_cells`](Self::starred_cells). `false` means
    /// the costs need modification before another pass.
    pub fn apply_minimum_crossings(&mut self) -> bool {
        if self.zero_cells.is_empty() {
            self.cache_zero_cells();
        }
        self.uncross_all();
        self.unprime_all();
        self.star_single_zero_columns();
        if self.count_starred() == self.size {
            return true;
        }

        let mut covering_all_zeros = true;
        while covering_all_zeros {
            self.cross_starred_columns();
            let mut last_primed = None;
            loop {
                match self.find_uncrossed_zero() {
                    None => {
                        covering_all_zeros = false;
                        break;
                    }
                    Some(zero) => {
                        last_primed = Some(zero);
                        if !self.uncross_column_and_cross_row(zero.0) {
                            break;
                        }
                    }
                }
            }
            if covering_all_zeros {
                let start = last_primed.expect("crossing loop left no primed zero");
                let walk = self.find_prime_star_walk(start);
                self.apply_prime_star_walk(&walk);
                self.uncross_all();
                self.unprime_all();
            }
        }
        self.count_starred() == self.size
    }

    /// Modify the costs towards a global optimum: every finite cell gains
    /// `(crossings on its row and column - 1)` times the lowest uncrossed
    /// value, so uncrossed cells fall and doubly-crossed cells rise.
    /// `false` when no finite uncrossed minimum exists; the matrix is then
    /// unsolvable and is left untouched.
    pub fn modify_costs_by_lowest_uncrossed(&mut self) -> bool {
        let mut lowest = f64::INFINITY;
        for row in 0..self.size {
            for column in 0..self.size {
                if !self.rows_crossed[row] && !self.cols_crossed[column] {
                    lowest = lowest.min(self.costs[(row, column)]);
                }
            }
        }
        if !lowest.is_finite() {
            return false;
        }
        trace!(matrix = %self.id, lowest = %lowest, "modifying costs");
        self.zero_cells.clear();
        let mut any_change = false;
        for row in 0..self.size {
            for column in 0..self.size {
                let cost = self.costs[(row, column)];
                if cost == f64::INFINITY {
                    continue;
                }
                let crossings =
                    i32::from(self.rows_crossed[row]) + i32::from(self.cols_crossed[column]) - 1;
                if crossings != 0 {
                    any_change = true;
                }
                let modified = cost + f64::from(crossings) * lowest;
                self.costs[(row, column)] = modified;
                if modified == 0.0 {
                    self.zero_cells.push((row, column));
                }
            }
        }
        any_change
    }

    /// The solved assignment, as (row, column) coordinates of every star.
    pub fn starred_cells(&self) -> Vec<(usize, usize)> {
        let mut cells = Vec::new();
        for row in 0..self.size {
            for column in 0..self.size {
                if self.starred[(row, column)] {
                    cells.push((row, column));
                }
            }
        }
        cells
    }

    fn uncross_all(&mut self) {
        self.rows_crossed.fill(false);
        self.cols_crossed.fill(false);
    }

    fn unprime_all(&mut self) {
        for row in 0..self.size {
            for column in 0..self.size {
                self.primed[(row, column)] = false;
            }
        }
    }

    /// Star the zero of every column that holds exactly one cached zero,
    /// provided its row holds no star yet.
    fn star_single_zero_columns(&mut self) {
        #[derive(Clone, Copy)]
        enum ColumnZeros {
            None,
            One(usize),
            Several,
        }
        let mut per_column = vec![ColumnZeros::None; self.size];
        for &(row, column) in &self.zero_cells {
            per_column[column] = match per_column[column] {
                ColumnZeros::None => ColumnZeros::One(row),
                _ => ColumnZeros::Several,
            };
        }
        for (column, entry) in per_column.into_iter().enumerate() {
            if let ColumnZeros::One(row) = entry {
                if self.star_in_row(row).is_none() {
                    self.starred[(row, column)] = true;
                }
            }
        }
    }

    fn star_in_row(&self, row: usize) -> Option<usize> {
        (0..self.size).find(|&column| self.starred[(row, column)])
    }

    fn count_starred(&self) -> usize {
        (0..self.size)
            .filter(|&row| self.star_in_row(row).is_some())
            .count()
    }

    fn cross_starred_columns(&mut self) {
        for row in 0..self.size {
            for column in 0..self.size {
                if self.starred[(row, column)] {
                    self.cols_crossed[column] = true;
                }
            }
        }
    }

    /// Scan the cached zeros for one not covered by a crossed row or
    /// column; prime it on the way out.
    fn find_uncrossed_zero(&mut self) -> Option<(usize, usize)> {
        for &(row, column) in &self.zero_cells {
            if !self.rows_crossed[row] && !self.cols_crossed[column] {
                self.primed[(row, column)] = true;
                return Some((row, column));
            }
        }
        None
    }

    /// If the primed zero's row already holds a star, trade the star's
    /// column crossing for a row crossing and keep scanning.
    fn uncross_column_and_cross_row(&mut self, row: usize) -> bool {
        match self.star_in_row(row) {
            Some(column) => {
                self.cols_crossed[column] = false;
                self.rows_crossed[row] = true;
                true
            }
            None => false,
        }
    }

    /// Alternating chain from a primed zero in a starless row: primed zero
    /// -> starred zero in its column -> primed zero in that row -> ...
    fn find_prime_star_walk(&self, start: (usize, usize)) -> Vec<(usize, usize)> {
        let mut walk = vec![start];
        loop {
            let &(_, column) = walk.last().unwrap();
            let Some(starred_row) = (0..self.size).find(|&row| self.starred[(row, column)]) else {
                return walk;
            };
            walk.push((starred_row, column));
            let primed_column = (0..self.size)
                .find(|&c| self.primed[(starred_row, c)])
                .expect("starred row on the walk holds no primed zero");
            walk.push((starred_row, primed_column));
        }
    }

    /// Flip every star and prime along the walk, growing the star count by
    /// one.
    fn apply_prime_star_walk(&mut self, walk: &[(usize, usize)]) {
        for (step, &(row, column)) in walk.iter().rev().enumerate() {
            if step % 2 == 0 {
                self.primed[(row, column)] = false;
                self.starred[(row, column)] = true;
            } else {
                self.starred[(row, column)] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathfinding::prelude::kuhn_munkres_min;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn matrix_of(rows: &[&[f64]]) -> CostMatrix {
        let size = rows.len();
        let mut grid = Matrix::new(size, size, f64::INFINITY);
        for (r, row) in rows.iter().enumerate() {
            for (c, &value) in row.iter().enumerate() {
                grid[(r, c)] = value;
            }
        }
        CostMatrix::new(grid)
    }

    fn solve(matrix: &mut CostMatrix) -> bool {
        loop {
            if matrix.apply_minimum_crossings() {
                return true;
            }
            if !matrix.modify_costs_by_lowest_uncrossed() {
                return false;
            }
        }
    }

    fn assert_one_star_per_row_and_column(matrix: &CostMatrix) {
        let cells = matrix.starred_cells();
        assert_eq!(cells.len(), matrix.size());
        let mut rows: Vec<usize> = cells.iter().map(|&(r, _)| r).collect();
        let mut columns: Vec<usize> = cells.iter().map(|&(_, c)| c).collect();
        rows.sort_unstable();
        rows.dedup();
        columns.sort_unstable();
        columns.dedup();
        assert_eq!(rows.len(), matrix.size());
        assert_eq!(columns.len(), matrix.size());
    }

    #[test]
    fn unique_optimum_is_found() {
        let mut matrix = matrix_of(&[&[4.0, 1.0, 3.0], &[2.0, 0.0, 5.0], &[3.0, 2.0, 2.0]]);
        matrix.reduce();
        assert!(solve(&mut matrix));
        assert_one_star_per_row_and_column(&matrix);
        let mut cells = matrix.starred_cells();
        cells.sort_unstable();
        assert_eq!(cells, vec![(0, 1), (1, 0), (2, 2)]);
    }

    #[test]
    fn infeasible_pairs_are_never_assigned() {
        let inf = f64::INFINITY;
        let mut matrix = matrix_of(&[&[1.0, inf, inf], &[2.0, 3.0, inf], &[4.0, 5.0, 6.0]]);
        matrix.reduce();
        assert!(solve(&mut matrix));
        let mut cells = matrix.starred_cells();
        cells.sort_unstable();
        assert_eq!(cells, vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn all_infinite_row_is_not_viable() {
        let inf = f64::INFINITY;
        let matrix = matrix_of(&[&[inf, inf], &[1.0, 2.0]]);
        assert!(!matrix.check_viable());
        let matrix = matrix_of(&[&[inf, 1.0], &[inf, 2.0]]);
        assert!(!matrix.check_viable());
        let matrix = matrix_of(&[&[inf, 1.0], &[1.0, inf]]);
        assert!(matrix.check_viable());
    }

    #[test]
    fn override_to_infinity_survives_reduction() {
        let mut matrix = matrix_of(&[&[4.0, 1.0, 3.0], &[2.0, 0.0, 5.0], &[3.0, 2.0, 2.0]]);
        matrix.reduce();
        matrix.override_cost(0, 1, f64::INFINITY);
        matrix.reduce();
        assert_eq!(matrix.cost(0, 1), f64::INFINITY);
        assert!(solve(&mut matrix));
        assert!(!matrix.starred_cells().contains(&(0, 1)));
    }

    #[test]
    fn branching_leaves_the_template_untouched() {
        let mut template = matrix_of(&[&[1.0, 2.0], &[3.0, 4.0]]);
        template.reduce();
        let mut branch = template.branch();
        assert_ne!(branch.serial(), template.serial());
        branch.override_cost(0, 0, f64::INFINITY);
        assert_eq!(template.cost(0, 0), 0.0);
        assert_eq!(branch.cost(0, 0), f64::INFINITY);
    }

    #[test]
    fn modification_fails_when_nothing_finite_is_uncrossed() {
        let inf = f64::INFINITY;
        let mut matrix = matrix_of(&[&[inf, inf], &[inf, inf]]);
        assert!(!matrix.modify_costs_by_lowest_uncrossed());
    }

    #[test]
    fn random_matrices_match_the_reference_kernel() {
        let mut rng = StdRng::seed_from_u64(20_240_817);
        for round in 0..40 {
            let size = 2 + round % 6;
            let weights: Vec<Vec<i64>> = (0..size)
                .map(|_| (0..size).map(|_| rng.random_range(0..100)).collect())
                .collect();

            let mut grid = Matrix::new(size, size, 0.0f64);
            let mut reference = Matrix::new(size, size, 0i64);
            for r in 0..size {
                for c in 0..size {
                    grid[(r, c)] = weights[r][c] as f64;
                    reference[(r, c)] = weights[r][c];
                }
            }

            let mut matrix = CostMatrix::new(grid);
            matrix.reduce();
            assert!(solve(&mut matrix));
            assert_one_star_per_row_and_column(&matrix);
            let total: i64 = matrix
                .starred_cells()
                .iter()
                .map(|&(r, c)| weights[r][c])
                .sum();

            let (expected, _) = kuhn_munkres_min(&reference);
            assert_eq!(total, expected, "round {round} diverged from the reference");
        }
    }
}
