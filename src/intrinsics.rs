//! Program-facing persistent-memory primitives.
//!
//! These five entry points are the contract between a test harness and the
//! checker; each takes effect against the active execution state at call
//! time. [`PmemRuntime::dispatch_intrinsic`] routes direct calls by symbol
//! name so the miniature engine in `runtime::step` handles harness modules
//! without help.

use tracing::warn;

use crate::checker::{Violation, ViolationKind};
use crate::expr::{Expr, Width};
use crate::ir::{intrinsic_names, InstId, InstKind, ValueId, ValueKind};
use crate::pmem::shadow::{ObjectInfo, PersistentState};
use crate::pmem::AddrRange;
use crate::runtime::PmemRuntime;
use crate::state::ExecutionState;

impl PmemRuntime {
    /// Convert the allocation covering `[addr, addr+size)` into a
    /// persistent object: attach shadow state and activate the site for
    /// the heuristic. Precondition failures terminate only this path.
    pub fn mark_persistent(
        &mut self,
        state: &mut ExecutionState,
        addr: u64,
        size: u64,
        name: &str,
    ) -> Option<u64> {
        if size == 0 || addr == 0 {
            state.terminate_with_error("mark_persistent: null pointer or zero size");
            return None;
        }
        let range = AddrRange::sized(addr, size);
        if state
            .objects
            .values()
            .any(|o| o.info().range().intersects(&range))
        {
            state.terminate_with_error("mark_persistent: range overlaps a persistent object");
            return None;
        }
        state.add_object(PersistentState::new(
            ObjectInfo {
                name: name.to_string(),
                base: addr,
                size,
            },
            self.config.cache_line_size,
        ));
        Some(addr)
    }

    /// Allocate a fresh persistent object. The size must be a multiple of
    /// the cache line size.
    pub fn alloc_pmem(
        &mut self,
        state: &mut ExecutionState,
        size: u64,
        name: &str,
    ) -> Option<u64> {
        if size == 0 || size % self.config.cache_line_size != 0 {
            state.terminate_with_error(format!(
                "alloc_pmem: size {size} is not a positive multiple of the cache line size"
            ));
            return None;
        }
        let base = self.reserve_range(size);
        self.mark_persistent(state, base, size, name)
    }

    /// Assert that `[addr, addr+size)` is durable: every cache line that
    /// may be unpersisted registers its root causes as bugs. Returns the
    /// marked ids. Afterwards the covered objects read as fully persisted,
    /// so the same dirt is not re-reported at exit.
    pub fn check_persisted(
        &mut self,
        state: &mut ExecutionState,
        addr: u64,
        size: u64,
    ) -> Vec<u64> {
        let range = AddrRange::sized(addr, size);
        if !state.range_is_pmem(range) {
            state.terminate_with_error("check_persisted: range is not persistent memory");
            return Vec::new();
        }
        let mut marked = Vec::new();
        let bases: Vec<u64> = state
            .objects
            .values()
            .filter(|o| o.info().range().intersects(&range))
            .map(|o| o.info().base)
            .collect();
        for base in bases {
            let ids = {
                let obj = &state.objects[&base];
                let covered = AddrRange {
                    start: range.start.max(obj.info().base),
                    end: range.end.min(obj.info().range().end),
                };
                let first_line = obj.line_of(covered.start - obj.info().base);
                let last_line = obj.line_of(covered.end - 1 - obj.info().base);
                let mut ids = Vec::new();
                for line in first_line..=last_line {
                    if obj.line_ignored(line) {
                        continue;
                    }
                    if obj.may_line_be_unpersisted(self.solver(), &state.constraints, line, false)
                    {
                        ids.extend(obj.line_root_causes(
                            self.solver(),
                            &state.constraints,
                            line,
                        ));
                    }
                }
                ids
            };
            for id in ids {
                if let Some(text) = self.registry.location_text(id) {
                    warn!(state = state.id, "unpersisted range; root cause:\n{text}");
                }
                self.registry.mark_as_bug(id);
                marked.push(id);
            }
            state
                .objects
                .get_mut(&base)
                .expect("base collected above")
                .flush_all();
        }
        marked
    }

    /// Assert that the most recent stores to `A` persisted strictly before
    /// those to `B`, against the concrete epoch mirror.
    pub fn check_ordered_before(
        &mut self,
        state: &mut ExecutionState,
        a_addr: u64,
        a_size: u64,
        b_addr: u64,
        b_size: u64,
    ) -> bool {
        let ordered = state
            .epoch_model
            .is_ordered_before(a_addr, a_size, b_addr, b_size);
        if !ordered {
            let message = format!(
                "writes to [{a_addr:#x},+{a_size}) are not ordered before [{b_addr:#x},+{b_size})"
            );
            warn!(state = state.id, "{message}");
            self.violations.push(Violation {
                kind: ViolationKind::UnorderedWrites,
                message,
                state_id: state.id,
            });
        }
        ordered
    }

    /// Whether every byte of the range is backed by a persistent object.
    pub fn is_pmem(&self, state: &ExecutionState, addr: u64, size: u64) -> bool {
        state.range_is_pmem(AddrRange::sized(addr, size))
    }

    /// Route a direct call to the matching intrinsic. Returns true when
    /// the call was one.
    pub fn dispatch_intrinsic(&mut self, state: &mut ExecutionState, inst: InstId) -> bool {
        let Some(callee) = self.module.direct_callee(inst) else {
            return false;
        };
        let name = self.module.function(callee).name.clone();
        match name.as_str() {
            intrinsic_names::MARK_PERSISTENT => {
                let (Some(addr), Some(size)) = (
                    self.arg_const(state, inst, 0),
                    self.arg_const(state, inst, 1),
                ) else {
                    state.terminate_with_error("mark_persistent: unresolvable arguments");
                    return true;
                };
                let obj_name = format!("pmem_{addr:#x}");
                if let Some(base) = self.mark_persistent(state, addr, size, &obj_name) {
                    self.bind_pointer_result(state, inst, base);
                }
                true
            }
            intrinsic_names::ALLOC_PMEM => {
                let Some(size) = self.arg_const(state, inst, 0) else {
                    state.terminate_with_error("alloc_pmem: unresolvable size");
                    return true;
                };
                let obj_name = format!("pmem_alloc_{size}");
                if let Some(base) = self.alloc_pmem(state, size, &obj_name) {
                    self.bind_pointer_result(state, inst, base);
                }
                true
            }
            intrinsic_names::CHECK_PERSISTED => {
                if let (Some(addr), Some(size)) = (
                    self.arg_const(state, inst, 0),
                    self.arg_const(state, inst, 1),
                ) {
                    self.check_persisted(state, addr, size);
                } else {
                    state.terminate_with_error("check_persisted: unresolvable arguments");
                }
                true
            }
            intrinsic_names::CHECK_ORDERED_BEFORE => {
                let args: Vec<Option<u64>> =
                    (0..4).map(|i| self.arg_const(state, inst, i)).collect();
                if let [Some(a), Some(asz), Some(b), Some(bsz)] = args[..] {
                    self.check_ordered_before(state, a, asz, b, bsz);
                } else {
                    state.terminate_with_error("check_ordered_before: unresolvable arguments");
                }
                true
            }
            intrinsic_names::IS_PMEM => {
                if let (Some(addr), Some(size)) = (
                    self.arg_const(state, inst, 0),
                    self.arg_const(state, inst, 1),
                ) {
                    let result = self.is_pmem(state, addr, size);
                    if let Some(dest) = self.module.inst(inst).result {
                        state.bind(dest, Expr::constant(result as u64, Width::Bool));
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Concrete value of call argument `index`: an IR constant or a
    /// constant runtime binding.
    fn arg_const(&self, state: &ExecutionState, inst: InstId, index: usize) -> Option<u64> {
        let InstKind::Call { args, .. } = &self.module.inst(inst).kind else {
            return None;
        };
        let arg: ValueId = *args.get(index)?;
        if let ValueKind::Const(c) = self.module.value(arg).kind {
            return Some(c as u64);
        }
        state.value_of(arg).and_then(|e| e.as_const())
    }

    /// Bind a pointer-returning intrinsic's result and activate it for the
    /// heuristic.
    fn bind_pointer_result(&self, state: &mut ExecutionState, inst: InstId, base: u64) {
        if let Some(dest) = self.module.inst(inst).result {
            state.bind(dest, Expr::constant(base, Width::W64));
            state.heuristic.update_value(dest, true);
        }
    }
}
