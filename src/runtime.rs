//! The persistence-checking runtime.
//!
//! [`PmemRuntime`] is the glue the engine calls into: it owns the run-wide
//! root-cause registry, the checker plugins, and the solver, and it applies
//! store/flush/fence semantics to each state's shadow objects and epoch
//! mirror. Tests drive it directly as a miniature engine through
//! [`PmemRuntime::step`].

use std::rc::Rc;

use tracing::{debug, warn};

use crate::checker::{CheckCtx, CheckerHandler, Violation};
use crate::config::Config;
use crate::expr::{Expr, ExprRef, Width};
use crate::ir::{InstId, InstKind, Module};
use crate::pmem::root_cause::{BugKind, RootCauseManager};
use crate::pmem::AddrRange;
use crate::solver::{EnumSolver, Solver};
use crate::state::ExecutionState;

/// Base address of the first runtime-allocated persistent object.
const ALLOC_BASE: u64 = 0x1000_0000;

/// Run-wide checking context.
pub struct PmemRuntime {
    /// Configuration the run was started with.
    pub config: Config,
    /// Program under test.
    pub module: Rc<Module>,
    /// Registry of bug sites, shared by every state.
    pub registry: RootCauseManager,
    /// Checker plugins.
    pub handler: CheckerHandler,
    /// Violations reported by checkers and ordering checks.
    pub violations: Vec<Violation>,
    solver: Rc<dyn Solver>,
    next_alloc_base: u64,
}

impl std::fmt::Debug for PmemRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmemRuntime")
            .field("config", &self.config)
            .field("violations", &self.violations.len())
            .finish()
    }
}

impl PmemRuntime {
    /// Runtime with the standard checker set and the built-in enumeration
    /// solver.
    pub fn new(config: Config, module: Rc<Module>) -> Self {
        let solver: Rc<dyn Solver> = Rc::new(EnumSolver::new(config.solver_budget()));
        Self {
            config,
            module,
            registry: RootCauseManager::new(),
            handler: CheckerHandler::standard(),
            violations: Vec::new(),
            solver,
            next_alloc_base: ALLOC_BASE,
        }
    }

    /// Swap in a different solver (e.g. the engine's real one).
    pub fn with_solver(mut self, solver: Rc<dyn Solver>) -> Self {
        self.solver = solver;
        self
    }

    /// The solver in use.
    pub fn solver(&self) -> &dyn Solver {
        &*self.solver
    }

    /// Reserve an address range for a new persistent object.
    pub(crate) fn reserve_range(&mut self, size: u64) -> u64 {
        let base = self.next_alloc_base;
        // Keep objects cache-line aligned and non-adjacent.
        let step = size
            .div_ceil(self.config.cache_line_size)
            .max(1)
            .saturating_mul(self.config.cache_line_size)
            .saturating_add(self.config.cache_line_size);
        self.next_alloc_base = base.saturating_add(step);
        base
    }

    /// Apply a store of `size` bytes at concrete address `addr`.
    ///
    /// Each covered cache line goes dirty with this instruction as its
    /// root cause; causes previously outstanding on those lines are
    /// recorded as masked by the new write.
    pub fn store(&mut self, state: &mut ExecutionState, inst: InstId, addr: u64, size: u64) {
        let range = AddrRange::sized(addr, size);
        if range.is_empty() {
            return;
        }
        let Some(obj) = state.object_at(addr) else {
            return;
        };
        let obj_base = obj.info().base;
        let obj_name = obj.info().name.clone();
        let cls = self.config.cache_line_size;

        state.epoch_model.store(addr, size);

        let location = state.root_cause_location(
            &self.module,
            Some(&obj_name),
            inst,
            BugKind::Unpersisted,
        );
        let obj = state.object_at_mut(addr).expect("checked above");
        for line_start in range.cache_lines(cls) {
            // The slice of this store landing on this line, as object
            // offsets; writes confined to ignored (volatile-marked) bytes
            // do not dirty anything.
            let touched = AddrRange {
                start: range.start.max(line_start).saturating_sub(obj_base),
                end: range.end.min(line_start + cls).saturating_sub(obj_base),
            };
            if obj.range_ignored(touched) {
                continue;
            }
            let offset = touched.start.min(obj.info().size - 1);
            let masked = obj.take_write_causes(offset);
            let id = self
                .registry
                .get_or_create_id_masking(location.clone(), &masked);
            obj.write8_at(id, offset);
        }
    }

    /// Apply a store whose offset into the object at `obj_base` is
    /// symbolic. The epoch mirror cannot track it; the shadow state
    /// carries the full precision.
    pub fn store_symbolic(
        &mut self,
        state: &mut ExecutionState,
        inst: InstId,
        obj_base: u64,
        offset: &ExprRef,
    ) {
        let Some(obj) = state.object_at(obj_base) else {
            return;
        };
        let obj_name = obj.info().name.clone();
        let location = state.root_cause_location(
            &self.module,
            Some(&obj_name),
            inst,
            BugKind::Unpersisted,
        );
        let id = self.registry.get_or_create_id(location);
        let obj = state.object_at_mut(obj_base).expect("checked above");
        obj.write8(id, offset);
    }

    /// Apply a flush of the cache line containing `addr`.
    ///
    /// A flush of a line that is already persisted in the pending view is
    /// itself a bug: `UnnecessaryFlush` when the line was written this
    /// epoch, `FlushOnUnmodified` otherwise.
    pub fn flush(&mut self, state: &mut ExecutionState, inst: InstId, addr: u64) {
        let Some(obj) = state.object_at(addr) else {
            return;
        };
        let obj_base = obj.info().base;
        let obj_name = obj.info().name.clone();
        let offset = addr - obj_base;
        let line = obj.line_of(offset);

        let clean = {
            let obj = state.object_at(addr).expect("checked above");
            let query = obj.is_line_persisted(line, true);
            self.solver
                .must_be_true(&state.constraints, &query)
                .must_hold()
        };

        state.epoch_model.flush(addr);

        let obj = state.object_at_mut(addr).expect("checked above");
        let masked = obj.take_write_causes(offset);
        let reason = if clean {
            if obj.line_written_this_epoch(offset) {
                BugKind::UnnecessaryFlush
            } else {
                BugKind::FlushOnUnmodified
            }
        } else {
            BugKind::Unpersisted
        };
        let location =
            state.root_cause_location(&self.module, Some(&obj_name), inst, reason);
        let id = self.registry.get_or_create_id_masking(location, &masked);

        let obj = state.object_at_mut(addr).expect("checked above");
        let offset_expr = Expr::constant(offset, Width::W64);
        obj.flush_at(id, &offset_expr);

        if clean {
            warn!(
                state = state.id,
                addr,
                ?reason,
                "flush of a clean cache line"
            );
            self.registry.mark_as_bug(id);
        }
    }

    /// Apply a store barrier: every object's pending persists become
    /// authoritative and the epoch mirror advances.
    pub fn fence(&mut self, state: &mut ExecutionState, inst: InstId) {
        let location =
            state.root_cause_location(&self.module, None, inst, BugKind::Unpersisted);
        let id = self.registry.get_or_create_id(location);
        for obj in state.objects.values_mut() {
            obj.commit_pending(id);
        }
        state.epoch_model.fence();
    }

    /// End-of-path check: anything still unpersisted is a bug at its
    /// recorded root cause.
    pub fn on_exit(&mut self, state: &mut ExecutionState) {
        let bases: Vec<u64> = state.objects.keys().copied().collect();
        for base in bases {
            let (persisted, causes) = {
                let obj = &state.objects[&base];
                let persisted = obj.must_be_persisted(&*self.solver, &state.constraints);
                let causes = if persisted {
                    Default::default()
                } else {
                    obj.get_root_causes(&*self.solver, &state.constraints)
                };
                (persisted, causes)
            };
            if persisted {
                continue;
            }
            warn!(
                state = state.id,
                object = %state.objects[&base].info().name,
                "unpersisted data at path exit"
            );
            for id in causes {
                self.registry.mark_as_bug(id);
            }
        }
        debug!(state = state.id, "path exited");
    }

    /// Run the checker plugins for the just-executed instruction.
    pub fn run_checkers(
        &mut self,
        state: &mut ExecutionState,
        inst: InstId,
        resolved_addr: Option<u64>,
    ) {
        let mut cx = CheckCtx {
            module: &self.module,
            config: &self.config,
            solver: &*self.solver,
            state,
            inst,
            resolved_addr,
            violations: &mut self.violations,
        };
        self.handler.handle(&mut cx);
    }

    /// Miniature engine step: interpret the persistence-relevant effect of
    /// `inst` against `state`, advance the heuristic, and run the
    /// checkers. Real engines call the individual operations instead.
    pub fn step(&mut self, state: &mut ExecutionState, inst: InstId, next_pc: Option<InstId>) {
        if !state.is_live() {
            return;
        }
        state.prev_pc = Some(inst);
        let mut resolved = None;

        let kind = self.module.inst(inst).kind.clone();
        match kind {
            InstKind::Store { ptr, size, .. } => {
                if let Some(addr_expr) = state.value_of(ptr).cloned() {
                    match addr_expr.as_const() {
                        Some(addr) => {
                            resolved = Some(addr);
                            self.store(state, inst, addr, size);
                        }
                        None => {
                            if let Some(base) = self.resolve_symbolic_base(state, &addr_expr) {
                                resolved = Some(base);
                                let offset = offset_from_base(&addr_expr, base);
                                self.store_symbolic(state, inst, base, &offset);
                            }
                        }
                    }
                }
            }
            InstKind::Flush { ptr } => {
                if let Some(addr) = state.value_of(ptr).and_then(|e| e.as_const()) {
                    resolved = Some(addr);
                    self.flush(state, inst, addr);
                }
            }
            InstKind::Fence => self.fence(state, inst),
            InstKind::Call { .. } => {
                self.dispatch_intrinsic(state, inst);
            }
            InstKind::Ret { .. } => {
                state.pop_frame();
            }
            _ => {}
        }

        state.heuristic.step(inst, next_pc);
        self.run_checkers(state, inst, resolved);
    }

    /// Find the single persistent object a symbolic address must fall in,
    /// via the solver's value range.
    fn resolve_symbolic_base(&self, state: &ExecutionState, addr: &ExprRef) -> Option<u64> {
        let (lo, hi) = self.solver.get_range(&state.constraints, addr)?;
        let obj = state.object_at(lo)?;
        if obj.info().range().contains(hi) {
            Some(obj.info().base)
        } else {
            None
        }
    }

    /// Tear down checkers and summarize.
    pub fn finish(&mut self) {
        self.handler.finish();
        debug!(
            bugs = self.registry.unique_bugs(),
            violations = self.violations.len(),
            "run finished"
        );
    }

    /// Process exit status: zero iff no bug and no violation.
    pub fn exit_code(&self) -> i32 {
        if self.registry.has_bugs() || !self.violations.is_empty() {
            1
        } else {
            0
        }
    }
}

/// `addr - base` as an expression, via wrapping addition of the two's
/// complement.
pub(crate) fn offset_from_base(addr: &ExprRef, base: u64) -> ExprRef {
    Expr::add(addr.clone(), Expr::constant(base.wrapping_neg(), Width::W64))
}
