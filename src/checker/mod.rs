//! Pluggable per-instruction checkers.
//!
//! The engine calls [`CheckerHandler::handle`] after every executed
//! instruction on every path; plugins see the instruction, the state, and
//! the engine's last memory resolution. All transaction- and type-driven
//! persistence policy lives here rather than in the core shadow state.

use tracing::{info, warn};

use crate::config::Config;
use crate::ir::{InstId, Module};
use crate::solver::Solver;
use crate::state::ExecutionState;

pub mod tx;
pub mod volatile;

pub use tx::{TxAddChecker, TxOnlyChecker};
pub use volatile::VolatileFilter;

/// Policy violations reported by checkers (distinct from the shadow-state
/// bug categories, which live in the root-cause registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Two ranges added to one transaction may overlap.
    TxOverlap,
    /// A store to a must-be-in-transaction range outside any transaction
    /// (or to a range the transaction never added).
    NonTransactionalUpdate,
    /// Two ranges checked with `check_ordered_before` were not ordered.
    UnorderedWrites,
}

/// One reported violation.
#[derive(Debug, Clone)]
pub struct Violation {
    /// What rule was broken.
    pub kind: ViolationKind,
    /// Human-readable detail.
    pub message: String,
    /// State that hit it.
    pub state_id: u64,
}

/// Everything a checker may look at for one instruction.
pub struct CheckCtx<'a> {
    /// Program IR.
    pub module: &'a Module,
    /// Run configuration.
    pub config: &'a Config,
    /// Solver for may/must queries.
    pub solver: &'a dyn Solver,
    /// The state that just executed `inst`.
    pub state: &'a mut ExecutionState,
    /// The instruction that just executed.
    pub inst: InstId,
    /// Address the engine last resolved for `inst`, when it was a memory
    /// operation.
    pub resolved_addr: Option<u64>,
    /// Violation sink.
    pub violations: &'a mut Vec<Violation>,
}

impl CheckCtx<'_> {
    /// Report a violation against the current state.
    pub fn report(&mut self, kind: ViolationKind, message: impl Into<String>) {
        let message = message.into();
        warn!(state = self.state.id, ?kind, "{message}");
        self.violations.push(Violation {
            kind,
            message,
            state_id: self.state.id,
        });
    }

    /// Name of the function a call instruction targets, if direct.
    pub fn direct_callee_name(&self) -> Option<&str> {
        let f = self.module.direct_callee(self.inst)?;
        Some(self.module.function(f).name.as_str())
    }

    /// Runtime value of an operand: the engine's binding when present,
    /// else the IR constant.
    pub fn operand_value(&self, value: crate::ir::ValueId) -> Option<crate::expr::ExprRef> {
        if let Some(bound) = self.state.value_of(value) {
            return Some(bound.clone());
        }
        if let crate::ir::ValueKind::Const(c) = self.module.value(value).kind {
            return Some(crate::expr::Expr::constant(
                c as u64,
                crate::expr::Width::W64,
            ));
        }
        None
    }
}

/// A per-instruction plugin.
pub trait Checker {
    /// Plugin name, for logs.
    fn name(&self) -> &'static str;

    /// Invoked after every executed instruction.
    fn after_instruction(&mut self, cx: &mut CheckCtx<'_>);

    /// Invoked once at run teardown.
    fn finish(&mut self) {}
}

/// Owns the plugins for the whole run and dispatches in registration
/// order.
#[derive(Default)]
pub struct CheckerHandler {
    checkers: Vec<Box<dyn Checker>>,
}

impl std::fmt::Debug for CheckerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.checkers.iter().map(|c| c.name()).collect();
        f.debug_struct("CheckerHandler").field("checkers", &names).finish()
    }
}

impl CheckerHandler {
    /// Handler with the standard plugin set.
    pub fn standard() -> Self {
        let mut handler = Self::default();
        handler.register(Box::new(CounterChecker::default()));
        handler.register(Box::new(TxAddChecker::default()));
        handler.register(Box::new(TxOnlyChecker::default()));
        handler.register(Box::new(VolatileFilter::default()));
        handler
    }

    /// Handler with no plugins.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a plugin; dispatch follows registration order.
    pub fn register(&mut self, checker: Box<dyn Checker>) {
        self.checkers.push(checker);
    }

    /// Run every plugin against the just-executed instruction.
    pub fn handle(&mut self, cx: &mut CheckCtx<'_>) {
        for checker in &mut self.checkers {
            checker.after_instruction(cx);
        }
    }

    /// Tear down every plugin.
    pub fn finish(&mut self) {
        for checker in &mut self.checkers {
            checker.finish();
        }
    }
}

/// The canonical minimal plugin: counts invocations, reports at teardown.
#[derive(Debug, Default)]
pub struct CounterChecker {
    invocations: u64,
}

impl Checker for CounterChecker {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn after_instruction(&mut self, _cx: &mut CheckCtx<'_>) {
        self.invocations += 1;
    }

    fn finish(&mut self) {
        info!(invocations = self.invocations, "counter checker done");
    }
}
