//! Dense two-phase simplex for small linear programs.
//!
//! Minimizes `c·x` subject to linear constraints and `x >= 0`. Bland's rule
//! picks entering and leaving variables, so the method cannot cycle.

use crate::error::{Error, Result};

const EPS: f64 = 1e-9;
const MAX_PIVOTS: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Le,
    Ge,
    Eq,
}

#[derive(Debug, Clone)]
struct Constraint {
    coeffs: Vec<f64>,
    relation: Relation,
    rhs: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LinearProgram {
    num_vars: usize,
    objective: Vec<f64>,
    constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LpSolution {
    pub x: Vec<f64>,
    pub objective: f64,
}

impl LinearProgram {
    pub fn new(num_vars: usize) -> Self {
        Self {
            num_vars,
            objective: vec![0.0; num_vars],
            constraints: Vec::new(),
        }
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn minimize(&mut self, var: usize, coeff: f64) -> &mut Self {
        if var < self.num_vars {
            self.objective[var] = coeff;
        }
        self
    }

    /// Adds `Σ coeffs[i].1 * x[coeffs[i].0]  relation  rhs`.
    pub fn constrain(&mut self, terms: &[(usize, f64)], relation: Relation, rhs: f64) -> &mut Self {
        let mut coeffs = vec![0.0; self.num_vars];
        for &(var, c) in terms {
            if var < self.num_vars {
                coeffs[var] += c;
            }
        }
        self.constraints.push(Constraint {
            coeffs,
            relation,
            rhs,
        });
        self
    }

    pub fn solve(&self) -> Result<LpSolution> {
        let n = self.num_vars;
        let m = self.constraints.len();

        // rhs >= 0 so the initial basis is feasible
        let rows: Vec<Constraint> = self
            .constraints
            .iter()
            .map(|c| {
                if c.rhs < 0.0 {
                    Constraint {
                        coeffs: c.coeffs.iter().map(|v| -v).collect(),
                        relation: match c.relation {
                            Relation::Le => Relation::Ge,
                            Relation::Ge => Relation::Le,
                            Relation::Eq => Relation::Eq,
                        },
                        rhs: -c.rhs,
                    }
                } else {
                    c.clone()
                }
            })
            .collect();

        let num_slack = rows.iter().filter(|c| c.relation != Relation::Eq).count();
        let num_art = rows.iter().filter(|c| c.relation != Relation::Le).count();
        let art_start = n + num_slack;
        let cols = art_start + num_art;
        let rhs_col = cols;

        let mut tableau = vec![vec![0.0; cols + 1]; m];
        let mut basis = vec![0usize; m];
        let mut slack = n;
        let mut art = art_start;
        for (i, c) in rows.iter().enumerate() {
            tableau[i][..n].copy_from_slice(&c.coeffs);
            tableau[i][rhs_col] = c.rhs;
            match c.relation {
                Relation::Le => {
                    tableau[i][slack] = 1.0;
                    basis[i] = slack;
                    slack += 1;
                }
                Relation::Ge => {
                    tableau[i][slack] = -1.0;
                    slack += 1;
                    tableau[i][art] = 1.0;
                    basis[i] = art;
                    art += 1;
                }
                Relation::Eq => {
                    tableau[i][art] = 1.0;
                    basis[i] = art;
                    art += 1;
                }
            }
        }

        let mut tab = Tableau {
            rows: tableau,
            basis,
            rhs_col,
        };

        if num_art > 0 {
            let mut phase1 = vec![0.0; cols];
            for c in phase1.iter_mut().skip(art_start) {
                *c = 1.0;
            }
            tab.optimize(&phase1, cols)?;
            let infeasibility = tab.objective(&phase1);
            if infeasibility > 1e-7 {
                return Err(Error::scheduler(format!(
                    "linear program infeasible (residual {:.3e})",
                    infeasibility
                )));
            }
            tab.evict_artificials(art_start);
        }

        let mut phase2 = vec![0.0; cols];
        phase2[..n].copy_from_slice(&self.objective);
        tab.optimize(&phase2, art_start)?;

        let mut x = vec![0.0; n];
        for (i, &b) in tab.basis.iter().enumerate() {
            if b < n {
                x[b] = tab.rows[i][rhs_col];
            }
        }
        let objective = self.objective.iter().zip(&x).map(|(c, v)| c * v).sum();
        Ok(LpSolution { x, objective })
    }
}

struct Tableau {
    rows: Vec<Vec<f64>>,
    basis: Vec<usize>,
    rhs_col: usize,
}

impl Tableau {
    fn objective(&self, cost: &[f64]) -> f64 {
        self.basis
            .iter()
            .enumerate()
            .map(|(i, &b)| cost[b] * self.rows[i][self.rhs_col])
            .sum()
    }

    /// Minimizes `cost` letting only columns below `allowed` enter.
    fn optimize(&mut self, cost: &[f64], allowed: usize) -> Result<()> {
        for _ in 0..MAX_PIVOTS {
            let entering = (0..allowed).find(|&j| {
                if self.basis.contains(&j) {
                    return false;
                }
                let reduced = cost[j]
                    - self
                        .basis
                        .iter()
                        .enumerate()
                        .map(|(i, &b)| cost[b] * self.rows[i][j])
                        .sum::<f64>();
                reduced < -EPS
            });
            let entering = match entering {
                Some(j) => j,
                None => return Ok(()),
            };

            let mut leaving: Option<(usize, f64)> = None;
            for (i, row) in self.rows.iter().enumerate() {
                if row[entering] > EPS {
                    let ratio = row[self.rhs_col] / row[entering];
                    leaving = match leaving {
                        None => Some((i, ratio)),
                        Some((li, lr)) => {
                            if ratio < lr - EPS
                                || ((ratio - lr).abs() <= EPS && self.basis[i] < self.basis[li])
                            {
                                Some((i, ratio))
                            } else {
                                Some((li, lr))
                            }
                        }
                    };
                }
            }
            match leaving {
                Some((row, _)) => self.pivot(row, entering),
                None => return Err(Error::scheduler("linear program unbounded")),
            }
        }
        Err(Error::scheduler("simplex pivot limit reached"))
    }

    fn pivot(&mut self, row: usize, col: usize) {
        let p = self.rows[row][col];
        for v in self.rows[row].iter_mut() {
            *v /= p;
        }
        let pivot_row = self.rows[row].clone();
        for (i, r) in self.rows.iter_mut().enumerate() {
            if i == row {
                continue;
            }
            let factor = r[col];
            if factor.abs() > 0.0 {
                for (v, pv) in r.iter_mut().zip(&pivot_row) {
                    *v -= factor * pv;
                }
            }
        }
        self.basis[row] = col;
    }

    /// Replaces zero-valued artificial basics with real columns where
    /// possible; rows that cannot be pivoted are redundant and stay at zero.
    fn evict_artificials(&mut self, art_start: usize) {
        for i in 0..self.rows.len() {
            if self.basis[i] < art_start {
                continue;
            }
            if let Some(j) = (0..art_start)
                .find(|&j| !self.basis.contains(&j) && self.rows[i][j].abs() > EPS)
            {
                self.pivot(i, j);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_textbook_maximum() {
        // max 3x + 5y  s.t. x <= 4, 2y <= 12, 3x + 2y <= 18
        let mut lp = LinearProgram::new(2);
        lp.minimize(0, -3.0).minimize(1, -5.0);
        lp.constrain(&[(0, 1.0)], Relation::Le, 4.0)
            .constrain(&[(1, 2.0)], Relation::Le, 12.0)
            .constrain(&[(0, 3.0), (1, 2.0)], Relation::Le, 18.0);
        let sol = lp.solve().unwrap();
        assert_relative_eq!(sol.x[0], 2.0, epsilon = 1e-9);
        assert_relative_eq!(sol.x[1], 6.0, epsilon = 1e-9);
        assert_relative_eq!(sol.objective, -36.0, epsilon = 1e-9);
    }

    #[test]
    fn test_equality_and_ge_need_phase_one() {
        // min x + 2y  s.t. x + y = 10, x >= 3, y >= 2
        let mut lp = LinearProgram::new(2);
        lp.minimize(0, 1.0).minimize(1, 2.0);
        lp.constrain(&[(0, 1.0), (1, 1.0)], Relation::Eq, 10.0)
            .constrain(&[(0, 1.0)], Relation::Ge, 3.0)
            .constrain(&[(1, 1.0)], Relation::Ge, 2.0);
        let sol = lp.solve().unwrap();
        assert_relative_eq!(sol.x[0], 8.0, epsilon = 1e-9);
        assert_relative_eq!(sol.x[1], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_makespan_split() {
        // two devices, device 1 three times faster: min T
        // s.t. 1.0 * x0 <= T, (1/3) * x1 <= T, x0 + x1 = 1
        let mut lp = LinearProgram::new(3);
        lp.minimize(2, 1.0);
        lp.constrain(&[(0, 1.0), (2, -1.0)], Relation::Le, 0.0)
            .constrain(&[(1, 1.0 / 3.0), (2, -1.0)], Relation::Le, 0.0)
            .constrain(&[(0, 1.0), (1, 1.0)], Relation::Eq, 1.0);
        let sol = lp.solve().unwrap();
        assert_relative_eq!(sol.x[0], 0.25, epsilon = 1e-9);
        assert_relative_eq!(sol.x[1], 0.75, epsilon = 1e-9);
    }

    #[test]
    fn test_infeasible_and_unbounded() {
        let mut lp = LinearProgram::new(1);
        lp.constrain(&[(0, 1.0)], Relation::Le, 1.0)
            .constrain(&[(0, 1.0)], Relation::Ge, 2.0);
        assert!(matches!(lp.solve(), Err(Error::Scheduler(_))));

        let mut lp = LinearProgram::new(1);
        lp.minimize(0, -1.0);
        assert!(matches!(lp.solve(), Err(Error::Scheduler(_))));
    }

    #[test]
    fn test_negative_rhs_is_flipped() {
        // x - y <= -1 with min x + y  ->  y >= x + 1, optimum (0, 1)
        let mut lp = LinearProgram::new(2);
        lp.minimize(0, 1.0).minimize(1, 1.0);
        lp.constrain(&[(0, 1.0), (1, -1.0)], Relation::Le, -1.0);
        let sol = lp.solve().unwrap();
        assert_relative_eq!(sol.x[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(sol.x[1], 1.0, epsilon = 1e-9);
    }
}
