//! Solver boundary.
//!
//! The engine's real constraint solver sits behind [`Solver`]; the crate
//! ships [`EnumSolver`], which decides queries by walking every assignment of
//! the symbolic arrays involved. Each symbolic array carries a finite domain
//! bound, so the walk is exhaustive; a configurable assignment budget stands
//! in for the wall-clock timeout of a real solver.
//!
//! Callers treat [`Verdict::Unknown`] conservatively: a may-query becomes
//! "yes", a must-query becomes "no". Timeouts never abort the run.

use std::rc::Rc;

use tracing::debug;

use crate::expr::{eval, Assignment, ArrayRef, ExprRef};

/// Outcome of a solver query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The query is definitely true.
    True,
    /// The query is definitely false.
    False,
    /// Budget exhausted or the space was not finitely enumerable.
    Unknown,
}

impl Verdict {
    /// Conservative reading for may-style queries.
    pub fn may_hold(self) -> bool {
        !matches!(self, Verdict::False)
    }

    /// Conservative reading for must-style queries.
    pub fn must_hold(self) -> bool {
        matches!(self, Verdict::True)
    }
}

/// Constraint-solver interface consumed by the persistence queries.
pub trait Solver {
    /// Can `expr` be true under `constraints`?
    fn may_be_true(&self, constraints: &[ExprRef], expr: &ExprRef) -> Verdict;

    /// Is `expr` true under every model of `constraints`?
    fn must_be_true(&self, constraints: &[ExprRef], expr: &ExprRef) -> Verdict;

    /// Smallest and largest value `expr` takes under `constraints`, or
    /// `None` when the query could not be decided.
    fn get_range(&self, constraints: &[ExprRef], expr: &ExprRef) -> Option<(u64, u64)>;
}

/// Exhaustive-enumeration solver over bounded symbolic arrays.
#[derive(Debug)]
pub struct EnumSolver {
    /// Maximum number of assignments walked per query.
    budget: u64,
}

impl EnumSolver {
    /// Solver with the given per-query assignment budget.
    pub fn new(budget: u64) -> Self {
        Self { budget }
    }

    /// Gather the symbolic arrays of the query and all constraints.
    fn collect_arrays(constraints: &[ExprRef], expr: &ExprRef) -> Vec<ArrayRef> {
        let mut arrays = Vec::new();
        expr.symbolic_arrays(&mut arrays);
        for c in constraints {
            c.symbolic_arrays(&mut arrays);
        }
        arrays
    }

    /// Run `visit` for every assignment consistent with `constraints`.
    /// Returns `None` if the space is unbounded or over budget, otherwise
    /// the number of satisfying assignments visited.
    fn for_each_model(
        &self,
        constraints: &[ExprRef],
        expr: &ExprRef,
        mut visit: impl FnMut(u64) -> bool,
    ) -> Option<u64> {
        let arrays = Self::collect_arrays(constraints, expr);

        // Total assignment count; bail out early on overflow or missing
        // domain bounds.
        let mut total: u64 = 1;
        for array in &arrays {
            let bound = array.domain_bound?;
            let cells = array.size as u64;
            let per_array = bound.checked_pow(u32::try_from(cells).ok()?)?;
            total = total.checked_mul(per_array)?;
        }
        if total > self.budget {
            debug!(total, budget = self.budget, "solver budget exceeded");
            return None;
        }

        let mut counters: Vec<Vec<u64>> = arrays
            .iter()
            .map(|a| vec![0u64; a.size as usize])
            .collect();
        let mut models = 0u64;
        for _ in 0..total {
            let mut assignment = Assignment::new();
            for (array, cells) in arrays.iter().zip(&counters) {
                assignment.bind(array, cells.clone());
            }

            let satisfies = constraints
                .iter()
                .all(|c| matches!(eval::evaluate(c, &assignment), Ok(v) if v != 0));
            if satisfies {
                models += 1;
                let value = match eval::evaluate(expr, &assignment) {
                    Ok(v) => v,
                    // An out-of-bounds read under a satisfying assignment
                    // means the caller's bounds constraint is incomplete;
                    // treat the model as falsifying.
                    Err(_) => 0,
                };
                if !visit(value) {
                    return Some(models);
                }
            }

            Self::advance(&arrays, &mut counters);
        }
        Some(models)
    }

    fn advance(arrays: &[ArrayRef], counters: &mut [Vec<u64>]) {
        for (array, cells) in arrays.iter().zip(counters.iter_mut()) {
            let bound = array.domain_bound.unwrap_or(1);
            for cell in cells.iter_mut() {
                *cell += 1;
                if *cell < bound {
                    return;
                }
                *cell = 0;
            }
        }
    }
}

impl Solver for EnumSolver {
    fn may_be_true(&self, constraints: &[ExprRef], expr: &ExprRef) -> Verdict {
        // Constant fast path; no enumeration needed.
        if let Some(v) = expr.as_const() {
            if v != 0 {
                return Verdict::True;
            }
        }
        let mut found = false;
        match self.for_each_model(constraints, expr, |value| {
            if value != 0 {
                found = true;
                return false;
            }
            true
        }) {
            Some(_) => {
                if found {
                    Verdict::True
                } else {
                    Verdict::False
                }
            }
            None => Verdict::Unknown,
        }
    }

    fn must_be_true(&self, constraints: &[ExprRef], expr: &ExprRef) -> Verdict {
        let mut falsified = false;
        match self.for_each_model(constraints, expr, |value| {
            if value == 0 {
                falsified = true;
                return false;
            }
            true
        }) {
            // Vacuous truth on an infeasible path, matching a real solver.
            Some(_) => {
                if falsified {
                    Verdict::False
                } else {
                    Verdict::True
                }
            }
            None => Verdict::Unknown,
        }
    }

    fn get_range(&self, constraints: &[ExprRef], expr: &ExprRef) -> Option<(u64, u64)> {
        let mut lo = u64::MAX;
        let mut hi = 0u64;
        let models = self.for_each_model(constraints, expr, |value| {
            lo = lo.min(value);
            hi = hi.max(value);
            true
        })?;
        if models == 0 {
            return None;
        }
        Some((lo, hi))
    }
}

/// Convenience: a plain-`Rc` solver handle shared across components.
pub type SolverRef = Rc<dyn Solver>;
