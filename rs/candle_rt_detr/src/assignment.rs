//! Minimum-cost bipartite assignment
//!
//! A shortest-augmenting-path solver (Jonker-Volgenant family) over a dense
//! row-major cost matrix. Rows are ground-truth objects and columns are
//! queries, so the solve is O(G^2 * Q) for `G <= Q`.
//!
//! The solver works on plain `f32` data and knows nothing about tensors or
//! gradients: the assignment is a discrete decision taken on detached costs.

use log::warn;

use crate::error::{DetrError, Result};

/// Dense `num_queries x num_gt` cost matrix for one image, row-major by query.
#[derive(Debug, Clone, PartialEq)]
pub struct CostMatrix {
    num_queries: usize,
    num_gt: usize,
    data: Vec<f32>,
}

impl CostMatrix {
    /// Wrap row-major `data`; fails unless it has `num_queries * num_gt` entries.
    pub fn new(num_queries: usize, num_gt: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != num_queries * num_gt {
            return Err(DetrError::shape(format!(
                "cost matrix data has {} entries, expected {} x {}",
                data.len(),
                num_queries,
                num_gt
            )));
        }
        Ok(Self {
            num_queries,
            num_gt,
            data,
        })
    }

    /// Matrix with no ground-truth columns.
    pub fn empty(num_queries: usize) -> Self {
        Self {
            num_queries,
            num_gt: 0,
            data: Vec::new(),
        }
    }

    /// Rows (predicted queries).
    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    /// Columns (ground-truth objects).
    pub fn num_gt(&self) -> usize {
        self.num_gt
    }

    /// True when there is nothing to assign.
    pub fn is_empty(&self) -> bool {
        self.num_gt == 0 || self.num_queries == 0
    }

    /// Cost of matching `query` to ground-truth object `gt`.
    #[inline]
    pub fn get(&self, query: usize, gt: usize) -> f32 {
        self.data[query * self.num_gt + gt]
    }

    /// Total cost of a set of `(query, gt)` pairs.
    pub fn total_cost(&self, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(q, g)| self.get(q, g) as f64).sum()
    }

    fn check_finite(&self) -> Result<()> {
        match self.data.iter().position(|c| !c.is_finite()) {
            Some(pos) => Err(DetrError::NonFiniteCost {
                row: pos / self.num_gt,
                col: pos % self.num_gt,
            }),
            None => Ok(()),
        }
    }
}

/// Query-to-ground-truth assignment for one image.
///
/// Pairs are `(query_index, gt_index)`, sorted by query index. Every
/// ground-truth index appears once (when `G <= Q`) and no query repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pairs: Vec<(usize, usize)>,
}

impl Assignment {
    /// Sorts `pairs` by query index.
    pub fn new(mut pairs: Vec<(usize, usize)>) -> Self {
        pairs.sort_unstable();
        Self { pairs }
    }

    /// `(query_index, gt_index)` pairs in query order.
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    /// Number of matched pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Matched query indices, ascending.
    pub fn query_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.pairs.iter().map(|&(q, _)| q)
    }

    /// Ground-truth index of each pair, in query order.
    pub fn gt_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.pairs.iter().map(|&(_, g)| g)
    }
}

/// Solve the rectangular assignment problem on `cost`.
///
/// With `G <= Q` every ground-truth object receives exactly one query and the
/// total cost is globally minimal. Ties between equal-cost columns go to the
/// lowest query index. `G = 0` returns an empty assignment.
pub fn linear_sum_assignment(cost: &CostMatrix) -> Result<Assignment> {
    if cost.is_empty() {
        return Ok(Assignment::default());
    }
    cost.check_finite()?;

    let (q, g) = (cost.num_queries, cost.num_gt);
    if g <= q {
        // rows = gt, cols = queries
        let col4row = solve(g, q, |row, col| cost.get(col, row) as f64)?;
        let pairs = col4row
            .into_iter()
            .enumerate()
            .map(|(gt, query)| (query, gt))
            .collect();
        Ok(Assignment::new(pairs))
    } else {
        warn!(
            "{} ground-truth objects exceed {} queries; only {} will be matched",
            g, q, q
        );
        let col4row = solve(q, g, |row, col| cost.get(row, col) as f64)?;
        Ok(Assignment::new(col4row.into_iter().enumerate().collect()))
    }
}

/// Shortest augmenting path solve for `nr <= nc`. Returns the column assigned
/// to each row.
fn solve<F>(nr: usize, nc: usize, cost: F) -> Result<Vec<usize>>
where
    F: Fn(usize, usize) -> f64,
{
    const UNASSIGNED: usize = usize::MAX;

    let mut u = vec![0f64; nr];
    let mut v = vec![0f64; nc];
    let mut shortest = vec![f64::INFINITY; nc];
    let mut path = vec![UNASSIGNED; nc];
    let mut col4row = vec![UNASSIGNED; nr];
    let mut row4col = vec![UNASSIGNED; nc];
    let mut visited_rows = vec![false; nr];
    let mut visited_cols = vec![false; nc];
    let mut remaining: Vec<usize> = Vec::with_capacity(nc);

    for cur_row in 0..nr {
        shortest.iter_mut().for_each(|s| *s = f64::INFINITY);
        visited_rows.iter_mut().for_each(|s| *s = false);
        visited_cols.iter_mut().for_each(|s| *s = false);
        remaining.clear();
        remaining.extend(0..nc);

        let mut min_val = 0f64;
        let mut row = cur_row;
        let sink = loop {
            visited_rows[row] = true;

            let mut best: Option<(usize, f64)> = None;
            for (slot, &col) in remaining.iter().enumerate() {
                let reduced = min_val + cost(row, col) - u[row] - v[col];
                if reduced < shortest[col] {
                    path[col] = row;
                    shortest[col] = reduced;
                }
                let better = match best {
                    None => true,
                    Some((best_slot, best_val)) => {
                        let best_col = remaining[best_slot];
                        let sc = shortest[col];
                        let free = (row4col[col] == UNASSIGNED, row4col[best_col] == UNASSIGNED);
                        sc < best_val
                            || (sc == best_val
                                && match free {
                                    (true, false) => true,
                                    (false, true) => false,
                                    _ => col < best_col,
                                })
                    }
                };
                if better {
                    best = Some((slot, shortest[col]));
                }
            }

            let (slot, lowest) = match best {
                Some(b) if b.1.is_finite() => b,
                _ => {
                    return Err(DetrError::shape(
                        "assignment problem is infeasible".to_string(),
                    ))
                }
            };
            min_val = lowest;
            let col = remaining.swap_remove(slot);
            visited_cols[col] = true;
            if row4col[col] == UNASSIGNED {
                break col;
            }
            row = row4col[col];
        };

        // Dual update
        u[cur_row] += min_val;
        for i in 0..nr {
            if visited_rows[i] && i != cur_row {
                u[i] += min_val - shortest[col4row[i]];
            }
        }
        for j in 0..nc {
            if visited_cols[j] {
                v[j] -= min_val - shortest[j];
            }
        }

        // Augment along the alternating path ending at `sink`
        let mut col = sink;
        loop {
            let row = path[col];
            row4col[col] = row;
            std::mem::swap(&mut col4row[row], &mut col);
            if row == cur_row {
                break;
            }
        }
    }

    Ok(col4row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: &[&[f32]]) -> CostMatrix {
        let q = rows.len();
        let g = rows[0].len();
        CostMatrix::new(q, g, rows.iter().flat_map(|r| r.iter().copied()).collect()).unwrap()
    }

    #[test]
    fn test_square_assignment() {
        // Classic 3x3 example, optimum = 5 (0->1, 1->0, 2->2)
        let cost = matrix(&[&[4.0, 1.0, 3.0], &[2.0, 0.0, 5.0], &[3.0, 2.0, 2.0]]);
        let a = linear_sum_assignment(&cost).unwrap();
        assert_eq!(a.pairs(), &[(0, 1), (1, 0), (2, 2)]);
        assert!((cost.total_cost(a.pairs()) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_more_queries_than_gt() {
        let cost = matrix(&[
            &[9.0, 9.0],
            &[1.0, 8.0],
            &[9.0, 9.0],
            &[7.0, 2.0],
            &[0.5, 0.5],
        ]);
        let a = linear_sum_assignment(&cost).unwrap();
        // 1->0 + 4->1 = 1.5 beats 4->0 + 3->1 = 2.5
        assert_eq!(a.pairs(), &[(1, 0), (4, 1)]);
    }

    #[test]
    fn test_ties_prefer_lowest_query() {
        let cost = matrix(&[&[1.0], &[1.0], &[1.0]]);
        let a = linear_sum_assignment(&cost).unwrap();
        assert_eq!(a.pairs(), &[(0, 0)]);
    }

    #[test]
    fn test_empty_gt() {
        let a = linear_sum_assignment(&CostMatrix::empty(300)).unwrap();
        assert!(a.is_empty());
    }

    #[test]
    fn test_more_gt_than_queries() {
        let cost = matrix(&[&[3.0, 1.0, 2.0]]);
        let a = linear_sum_assignment(&cost).unwrap();
        assert_eq!(a.pairs(), &[(0, 1)]);
    }

    #[test]
    fn test_non_finite_cost_rejected() {
        let cost = matrix(&[&[1.0, f32::NAN], &[0.0, 1.0]]);
        match linear_sum_assignment(&cost) {
            Err(DetrError::NonFiniteCost { row, col }) => assert_eq!((row, col), (0, 1)),
            other => panic!("expected NonFiniteCost, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_costs() {
        let cost = matrix(&[&[-7.5, 3.0], &[2.0, -7.5], &[-8.0, -8.0]]);
        let a = linear_sum_assignment(&cost).unwrap();
        let total = cost.total_cost(a.pairs());
        // two optimal pairings tie at -15.5
        assert!((total + 15.5).abs() < 1e-9, "total = {}", total);
    }
}
