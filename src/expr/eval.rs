//! Concrete evaluation of expressions under an assignment to the symbolic
//! arrays.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::{ArrayRef, Expr, UpdateList};

/// Why an expression could not be evaluated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("no assignment for symbolic array {0}")]
    Unassigned(String),
    #[error("read out of bounds: index {index} in array of size {size}")]
    OutOfBounds {
        /// Evaluated index.
        index: u64,
        /// Array size in cells.
        size: u32,
    },
}

/// Concrete values for symbolic arrays, keyed by array identity.
#[derive(Debug, Default, Clone)]
pub struct Assignment {
    cells: FxHashMap<usize, Vec<u64>>,
}

impl Assignment {
    /// Empty assignment.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(array: &ArrayRef) -> usize {
        Rc::as_ptr(array) as usize
    }

    /// Bind every cell of `array` to the values in `cells`.
    pub fn bind(&mut self, array: &ArrayRef, cells: Vec<u64>) {
        debug_assert_eq!(cells.len(), array.size as usize);
        self.cells.insert(Self::key(array), cells);
    }

    fn lookup(&self, array: &ArrayRef, index: u64) -> Result<u64, EvalError> {
        if index >= array.size as u64 {
            return Err(EvalError::OutOfBounds {
                index,
                size: array.size,
            });
        }
        if let Some(init) = &array.init {
            return Ok(init[index as usize]);
        }
        self.cells
            .get(&Self::key(array))
            .map(|cells| cells[index as usize])
            .ok_or_else(|| EvalError::Unassigned(array.name.clone()))
    }
}

/// Evaluate `expr` to a word under `assignment`.
pub fn evaluate(expr: &Expr, assignment: &Assignment) -> Result<u64, EvalError> {
    match expr {
        Expr::Const { value, .. } => Ok(*value),
        Expr::Read { updates, index } => {
            let idx = evaluate(index, assignment)?;
            read_update_list(updates, idx, assignment)
        }
        Expr::Eq(a, b) => Ok((evaluate(a, assignment)? == evaluate(b, assignment)?) as u64),
        Expr::Ult(a, b) => Ok((evaluate(a, assignment)? < evaluate(b, assignment)?) as u64),
        Expr::Ule(a, b) => Ok((evaluate(a, assignment)? <= evaluate(b, assignment)?) as u64),
        Expr::And(a, b) => Ok((evaluate(a, assignment)? != 0 && evaluate(b, assignment)? != 0) as u64),
        Expr::Or(a, b) => Ok((evaluate(a, assignment)? != 0 || evaluate(b, assignment)? != 0) as u64),
        Expr::Not(a) => Ok((evaluate(a, assignment)? == 0) as u64),
        Expr::Add(a, b) => {
            let width = a.width();
            Ok(evaluate(a, assignment)?.wrapping_add(evaluate(b, assignment)?) & width.mask())
        }
        Expr::UDiv(a, b) => {
            let divisor = evaluate(b, assignment)?;
            let width = a.width();
            if divisor == 0 {
                Ok(width.mask())
            } else {
                Ok(evaluate(a, assignment)? / divisor)
            }
        }
        Expr::ZExt(a, width) => Ok(evaluate(a, assignment)? & width.mask()),
    }
}

/// Read `index` through an update list: newest matching write wins, else the
/// root array.
fn read_update_list(
    updates: &UpdateList,
    index: u64,
    assignment: &Assignment,
) -> Result<u64, EvalError> {
    let mut node = updates.head.clone();
    while let Some(n) = node {
        let written = evaluate(&n.index, assignment)?;
        if written == index {
            return evaluate(&n.value, assignment);
        }
        node = n.next.clone();
    }
    assignment.lookup(&updates.root, index)
}
