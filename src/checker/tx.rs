//! Transaction-discipline checkers for persistent-object libraries.
//!
//! Transactions are flat: nested begins do not stack, and the added-range
//! list clears when the outermost transaction ends.

use smallvec::SmallVec;

use crate::expr::{Expr, ExprRef, Width};
use crate::ir::InstKind;

use super::{CheckCtx, Checker, ViolationKind};

/// Entry points of the modeled transaction library.
pub const TX_BEGIN: &str = "pmemobj_tx_begin";
/// Adds `[ptr, ptr+size)` to the current transaction.
pub const TX_ADD: &str = "pmemobj_tx_add_range";
/// Ends the current transaction.
pub const TX_END: &str = "pmemobj_tx_end";

/// Symbolic `[start, end)` range.
type TxRange = (ExprRef, ExprRef);

/// Shared transaction bookkeeping for the two transaction checkers.
#[derive(Debug, Default)]
struct TxTracker {
    in_tx: bool,
    added: Vec<TxRange>,
}

impl TxTracker {
    /// Track begin/end; returns the added range when the call was a
    /// `TX_ADD` with resolvable arguments.
    fn observe_call(&mut self, cx: &CheckCtx<'_>) -> Option<TxRange> {
        let name = cx.direct_callee_name()?;
        match name {
            TX_BEGIN => {
                self.in_tx = true;
                None
            }
            TX_END => {
                self.in_tx = false;
                self.added.clear();
                None
            }
            TX_ADD => {
                let InstKind::Call { args, .. } = &cx.module.inst(cx.inst).kind else {
                    return None;
                };
                let start = cx.operand_value(*args.first()?)?;
                let size = cx.operand_value(*args.get(1)?)?;
                let end = Expr::add(start.clone(), size);
                Some((start, end))
            }
            _ => None,
        }
    }

    /// May `range` overlap any of `ranges` under the path condition?
    fn overlaps(cx: &CheckCtx<'_>, ranges: &[TxRange], range: &TxRange) -> bool {
        for added in ranges {
            let first = Expr::ult(added.0.clone(), range.1.clone());
            let second = Expr::ult(range.0.clone(), added.1.clone());
            let both = Expr::and(first, second);
            // A solver timeout counts as "may overlap".
            if cx.solver.may_be_true(&cx.state.constraints, &both).may_hold() {
                return true;
            }
        }
        false
    }
}

/// Flags ranges added to the same transaction more than once.
#[derive(Debug, Default)]
pub struct TxAddChecker {
    tracker: TxTracker,
}

impl Checker for TxAddChecker {
    fn name(&self) -> &'static str {
        "tx-add"
    }

    fn after_instruction(&mut self, cx: &mut CheckCtx<'_>) {
        let Some(range) = self.tracker.observe_call(cx) else {
            if !self.tracker.in_tx {
                self.tracker.added.clear();
            }
            return;
        };
        if TxTracker::overlaps(cx, &self.tracker.added, &range) {
            cx.report(
                ViolationKind::TxOverlap,
                format!(
                    "overlapping transaction add at {}",
                    cx.module.describe_inst(cx.inst)
                ),
            );
            cx.state.terminate_with_error("overlapping transaction add");
        }
        self.tracker.added.push(range);
    }
}

/// Flags stores to protected structures made outside a transaction (or
/// inside one that never added the range).
///
/// The protected struct types come from configuration (`tx-struct`); every
/// operand of a protected type that resolves into a persistent object
/// registers a must-be-in-tx range.
#[derive(Debug, Default)]
pub struct TxOnlyChecker {
    tracker: TxTracker,
    needed: Vec<TxRange>,
}

impl TxOnlyChecker {
    fn collect_protected_operands(&mut self, cx: &CheckCtx<'_>) {
        let inst = cx.module.inst(cx.inst);
        let operands: SmallVec<[crate::ir::ValueId; 4]> = match &inst.kind {
            InstKind::Store { value, ptr, .. } => SmallVec::from_slice(&[*value, *ptr]),
            InstKind::Load { ptr } => SmallVec::from_slice(&[*ptr]),
            InstKind::Gep { base } => SmallVec::from_slice(&[*base]),
            InstKind::Call { args, .. } => args.clone(),
            _ => return,
        };
        for op in operands {
            let Some(st) = &cx.module.value(op).pointee_struct else {
                continue;
            };
            if !cx.config.tx_structs.iter().any(|name| **name == *st.name) {
                continue;
            }
            let Some(addr) = cx.operand_value(op) else {
                continue;
            };
            // Only ranges inside persistent objects need the discipline.
            if let Some(base) = addr.as_const() {
                if cx.state.object_at(base).is_none() {
                    continue;
                }
            }
            let end = Expr::add(addr.clone(), Expr::constant(st.size, Width::W64));
            self.needed.push((addr, end));
        }
    }
}

impl Checker for TxOnlyChecker {
    fn name(&self) -> &'static str {
        "tx-only"
    }

    fn after_instruction(&mut self, cx: &mut CheckCtx<'_>) {
        if let Some(range) = self.tracker.observe_call(cx) {
            self.tracker.added.push(range);
        } else if !self.tracker.in_tx {
            self.tracker.added.clear();
        }

        if let InstKind::Store { ptr, size, .. } = cx.module.inst(cx.inst).kind {
            if let Some(start) = cx.operand_value(ptr) {
                let end = Expr::add(start.clone(), Expr::constant(size, Width::W64));
                let store_range = (start, end);
                if TxTracker::overlaps(cx, &self.needed, &store_range) {
                    if !self.tracker.in_tx {
                        cx.report(
                            ViolationKind::NonTransactionalUpdate,
                            format!(
                                "store outside any transaction at {}",
                                cx.module.describe_inst(cx.inst)
                            ),
                        );
                    } else if !TxTracker::overlaps(cx, &self.tracker.added, &store_range) {
                        cx.report(
                            ViolationKind::NonTransactionalUpdate,
                            format!(
                                "store to range the transaction never added at {}",
                                cx.module.describe_inst(cx.inst)
                            ),
                        );
                    }
                }
            }
        }

        self.collect_protected_operands(cx);
    }
}
