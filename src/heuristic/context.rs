//! Call-context descriptors for the context-sensitive heuristic.
//!
//! A context is a function paired with the value state it was entered with.
//! It owns per-instruction weights (1 for core instructions, the callee's
//! root priority for calls) and priorities (weight plus the best reachable
//! successor priority). Contexts are deduplicated by (function, value
//! state), which both shares work across repeated calls and breaks cycles:
//! a context is inserted into the cache before its callees are built, so a
//! recursive back-edge finds the in-progress entry instead of descending
//! forever.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ir::{Callee, FuncId, InstId, InstKind, Module};

use super::value_desc::ValueDescRef;

/// Shared, interior-mutable context handle. Mutation happens only while a
/// context is being constructed or when a runtime step caches a child.
pub type ContextRef = Rc<RefCell<NvmContextDesc>>;

/// Weights and priorities for one (function, value state) pair.
#[derive(Debug)]
pub struct NvmContextDesc {
    func: FuncId,
    values: ValueDescRef,
    return_has_weight: bool,
    has_core_weight: bool,
    weights: FxHashMap<InstId, u64>,
    priorities: FxHashMap<InstId, u64>,
    children: FxHashMap<InstId, ContextRef>,
}

struct ContextKey {
    func: FuncId,
    values: ValueDescRef,
}

impl PartialEq for ContextKey {
    fn eq(&self, other: &Self) -> bool {
        self.func == other.func && *self.values == *other.values
    }
}

impl Eq for ContextKey {}

impl std::hash::Hash for ContextKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.func.hash(state);
        self.values.fingerprint().hash(state);
    }
}

/// Deduplicating store of built contexts.
#[derive(Default)]
pub struct ContextCache {
    map: FxHashMap<ContextKey, ContextRef>,
}

impl std::fmt::Debug for ContextCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCache")
            .field("contexts", &self.map.len())
            .finish()
    }
}

impl ContextCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct contexts built so far.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing has been built yet.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Fetch or build the context for `func` entered with `values`.
    pub fn get_or_build(
        &mut self,
        module: &Module,
        func: FuncId,
        values: ValueDescRef,
        parent_has_weight: bool,
    ) -> ContextRef {
        let key = ContextKey {
            func,
            values: values.clone(),
        };
        if let Some(hit) = self.map.get(&key) {
            return hit.clone();
        }

        let mut ctx = NvmContextDesc {
            func,
            values,
            return_has_weight: parent_has_weight,
            has_core_weight: false,
            weights: FxHashMap::default(),
            priorities: FxHashMap::default(),
            children: FxHashMap::default(),
        };
        let aux = ctx.set_core_weights(module);
        let shared = Rc::new(RefCell::new(ctx));
        // Insert before descending into callees so recursion terminates.
        self.map.insert(key, shared.clone());

        for inst in aux {
            let weight = self.aux_weight(module, &shared, inst);
            shared.borrow_mut().weights.insert(inst, weight);
        }
        shared.borrow_mut().set_priorities(module);
        shared
    }

    /// Weight of a call or return instruction within `parent`.
    fn aux_weight(&mut self, module: &Module, parent: &ContextRef, inst: InstId) -> u64 {
        match &module.inst(inst).kind {
            InstKind::Ret { .. } => 1,
            InstKind::Call { callee, .. } => match callee {
                Callee::Direct(f) if module.function(*f).has_body() => {
                    let (values, parent_weight) = {
                        let p = parent.borrow();
                        (p.values.do_call(module, inst, *f), p.has_core_weight)
                    };
                    let child = self.get_or_build(module, *f, values, parent_weight);
                    let priority = child.borrow().root_priority(module);
                    parent.borrow_mut().children.insert(inst, child);
                    priority
                }
                // Unresolved targets keep the call interesting enough to
                // step into at run time.
                _ => 1,
            },
            _ => unreachable!("aux weights only exist for calls and returns"),
        }
    }
}

impl NvmContextDesc {
    /// The function this context describes.
    pub fn function(&self) -> FuncId {
        self.func
    }

    /// The value state this context was entered with.
    pub fn values(&self) -> &ValueDescRef {
        &self.values
    }

    /// Whether returning to the caller is worth anything.
    pub fn return_has_weight(&self) -> bool {
        self.return_has_weight
    }

    /// Priority of `inst` in this context.
    pub fn priority(&self, inst: InstId) -> u64 {
        self.priorities.get(&inst).copied().unwrap_or(0)
    }

    /// Weight of `inst` in this context.
    pub fn weight(&self, inst: InstId) -> u64 {
        self.weights.get(&inst).copied().unwrap_or(0)
    }

    /// Priority at the function's first instruction: what a call site
    /// inherits as its weight.
    pub fn root_priority(&self, module: &Module) -> u64 {
        match module.entry_inst(self.func) {
            Some(entry) => {
                let p = self.priority(entry);
                if p > 0 {
                    p
                } else if self.has_core_weight {
                    1
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// Assign weight 1 to every core instruction (NVM store, NVM flush,
    /// fence, persistent allocation site) and collect the auxiliary
    /// instructions whose weight depends on other contexts.
    fn set_core_weights(&mut self, module: &Module) -> Vec<InstId> {
        let mut aux = Vec::new();
        for inst in module.insts_of(self.func) {
            if self.is_core_inst(module, inst) {
                self.weights.insert(inst, 1);
                self.has_core_weight = true;
            } else if Self::is_aux_inst(module, inst) {
                aux.push(inst);
            }
        }
        aux
    }

    fn is_core_inst(&self, module: &Module, inst: InstId) -> bool {
        match &module.inst(inst).kind {
            InstKind::Fence => true,
            InstKind::Flush { ptr } => self.values.is_nvm(*ptr),
            InstKind::Store { ptr, .. } => self.values.is_nvm(*ptr),
            InstKind::Call { .. } => crate::ir::is_nvm_allocation_site(module, inst),
            _ => false,
        }
    }

    fn is_aux_inst(module: &Module, inst: InstId) -> bool {
        match &module.inst(inst).kind {
            InstKind::Ret { .. } => true,
            InstKind::Call { callee, .. } => match callee {
                // Declarations and allocation intrinsics have no body to
                // descend into.
                Callee::Direct(f) => module.function(*f).has_body(),
                Callee::Indirect(_) => true,
            },
            _ => false,
        }
    }

    /// Backward priority propagation over this context's weights.
    fn set_priorities(&mut self, module: &Module) {
        self.priorities.clear();
        super::propagate_priorities(module, self.func, &self.weights, &mut self.priorities);
    }

    /// Context for the instruction after `pc`: descends into the callee's
    /// context when execution moved into a different function, otherwise
    /// stays put. `self_rc` must be the handle this descriptor lives in.
    pub fn try_get_next_context(
        self_rc: &ContextRef,
        cache: &mut ContextCache,
        module: &Module,
        pc: InstId,
        next_pc: InstId,
    ) -> ContextRef {
        let inst = module.inst(pc);
        if !matches!(inst.kind, InstKind::Call { .. }) {
            return self_rc.clone();
        }
        let next_func = module.inst(next_pc).func;
        if next_func == inst.func {
            return self_rc.clone();
        }
        if let Some(child) = self_rc.borrow().children.get(&pc) {
            return child.clone();
        }
        // Indirect call resolved at run time: build the callee's context
        // now that the target is known.
        let (values, has_weight) = {
            let this = self_rc.borrow();
            (
                this.values.do_call(module, pc, next_func),
                this.has_core_weight,
            )
        };
        let child = cache.get_or_build(module, next_func, values, has_weight);
        self_rc.borrow_mut().children.insert(pc, child.clone());
        child
    }

    /// Context after learning the NVM-ness of `value`. If the fact changes
    /// nothing, the original handle comes straight back.
    pub fn try_update_context(
        self_rc: &ContextRef,
        cache: &mut ContextCache,
        module: &Module,
        value: crate::ir::ValueId,
        is_nvm: bool,
    ) -> ContextRef {
        let (func, values, return_has_weight) = {
            let this = self_rc.borrow();
            (this.func, this.values.clone(), this.return_has_weight)
        };
        let updated = values.update(module, value, is_nvm);
        if values.is_nvm(value) == updated.is_nvm(value) {
            return self_rc.clone();
        }
        cache.get_or_build(module, func, updated, return_has_weight)
    }
}
