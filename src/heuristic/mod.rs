//! NVM-directed search heuristics.
//!
//! Four strategies share one interface: `none` (priorities stay zero),
//! `static` (whole-program weights computed once), `insensitive-dynamic`
//! (weights recomputed as the NVM-ness of values resolves) and
//! `context-dynamic` (per-call-context weights built on
//! [`context::NvmContextDesc`]). The searcher consults
//! [`Heuristic::current_priority`] when ordering states.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::analysis::CachedPointsTo;
use crate::config::HeuristicType;
use crate::ir::{BlockId, Callee, FuncId, InstId, InstKind, Module, ValueId};

pub mod context;
pub mod value_desc;

pub use context::{ContextCache, ContextRef, NvmContextDesc};
pub use value_desc::{NvmValueDesc, ValueDescRef};

/// Per-state search guidance.
///
/// A heuristic is cloned on fork and stepped by the engine after every
/// executed instruction.
pub trait Heuristic {
    /// Strategy name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Priority of the state's next instruction.
    fn current_priority(&self) -> u64;

    /// Record the resolved NVM-ness of a value (from an
    /// `update_current_state` hint or an mmap resolution).
    fn update_value(&mut self, value: ValueId, is_nvm: bool);

    /// Advance past `pc`; `next_pc` is the instruction about to execute.
    fn step(&mut self, pc: InstId, next_pc: Option<InstId>);

    /// Clone for a forked state.
    fn box_clone(&self) -> Box<dyn Heuristic>;
}

impl Clone for Box<dyn Heuristic> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Build the heuristic selected by configuration.
pub fn build(
    ty: HeuristicType,
    module: Rc<Module>,
    points_to: Rc<CachedPointsTo>,
    entry: FuncId,
) -> Box<dyn Heuristic> {
    match ty {
        HeuristicType::None => Box::new(NoneHeuristic),
        HeuristicType::Static => Box::new(StaticHeuristic::new(module, points_to, entry)),
        HeuristicType::InsensitiveDynamic => {
            Box::new(InsensitiveDynamicHeuristic::new(module, points_to, entry))
        }
        HeuristicType::ContextDynamic => {
            Box::new(ContextDynamicHeuristic::new(module, points_to, entry))
        }
    }
}

/// Shared weight/priority tables for the whole-module strategies.
#[derive(Debug, Default)]
pub(crate) struct WeightTables {
    pub(crate) weights: FxHashMap<InstId, u64>,
    pub(crate) priorities: FxHashMap<InstId, u64>,
}

/// Backward priority propagation over one function.
///
/// Terminal blocks seed their terminator with its own weight; priorities
/// accumulate towards block heads, and a predecessor's terminator takes the
/// max over its branch targets. A block is re-walked only when it gains
/// priority it did not have, so loop bodies do not amplify themselves.
pub(crate) fn propagate_priorities(
    module: &Module,
    func: FuncId,
    weights: &FxHashMap<InstId, u64>,
    priorities: &mut FxHashMap<InstId, u64>,
) {
    let f = module.function(func);
    let weight = |i: InstId| weights.get(&i).copied().unwrap_or(0);

    let mut queue: VecDeque<BlockId> = VecDeque::new();
    for (bi, block) in f.blocks.iter().enumerate() {
        if block.succs.is_empty() {
            queue.push_back(BlockId(bi as u32));
        }
    }

    let mut traversed: FxHashSet<BlockId> = FxHashSet::default();
    while let Some(bb) = queue.pop_front() {
        traversed.insert(bb);
        let insts = &f.blocks[bb.0 as usize].insts;
        let Some(&term) = insts.last() else { continue };

        if priorities.get(&term).copied().unwrap_or(0) == 0 {
            priorities.insert(term, weight(term));
        }
        for i in (0..insts.len().saturating_sub(1)).rev() {
            let here = insts[i];
            let next = insts[i + 1];
            let p = weight(here) + priorities.get(&next).copied().unwrap_or(0);
            priorities.insert(here, p);
        }

        let head_priority = priorities.get(&insts[0]).copied().unwrap_or(0);
        for &pred in &f.blocks[bb.0 as usize].preds {
            let Some(&pterm) = f.blocks[pred.0 as usize].insts.last() else {
                continue;
            };
            let candidate = weight(pterm) + head_priority;
            let current = priorities.get(&pterm).copied().unwrap_or(0);
            if candidate > current {
                priorities.insert(pterm, candidate);
                if !traversed.contains(&pred) || current == 0 {
                    queue.push_back(pred);
                }
            } else if !traversed.contains(&pred) {
                queue.push_back(pred);
            }
        }
    }
}

/// Base instruction weights for the whole-module strategies: 3 for anything
/// that modifies or allocates NVM, 2 for a fence while NVM exists, 1 for a
/// return.
fn static_inst_weight(
    module: &Module,
    inst: InstId,
    modifies_nvm: &dyn Fn(InstId) -> bool,
    is_alloc_site: &dyn Fn(InstId) -> bool,
    any_nvm: bool,
) -> u64 {
    if modifies_nvm(inst) || is_alloc_site(inst) {
        3
    } else if matches!(module.inst(inst).kind, InstKind::Fence) && any_nvm {
        2
    } else if matches!(module.inst(inst).kind, InstKind::Ret { .. }) {
        1
    } else {
        0
    }
}

/// Compute whole-module tables: base weights, then a fixpoint that gives
/// weight 1 to any call that can reach weighted code, then per-function
/// priorities.
fn compute_module_tables(
    module: &Module,
    modifies_nvm: &dyn Fn(InstId) -> bool,
    is_alloc_site: &dyn Fn(InstId) -> bool,
    any_nvm: bool,
) -> WeightTables {
    let mut tables = WeightTables::default();
    let mut call_insts: Vec<InstId> = Vec::new();

    for inst in module.inst_ids() {
        let w = static_inst_weight(module, inst, modifies_nvm, is_alloc_site, any_nvm);
        if w > 0 {
            tables.weights.insert(inst, w);
        } else if matches!(module.inst(inst).kind, InstKind::Call { .. }) {
            call_insts.push(inst);
        }
    }

    // Calls into weighted code are worth stepping into.
    loop {
        let mut changed = false;
        for &ci in &call_insts {
            if tables.weights.get(&ci).copied().unwrap_or(0) > 0 {
                continue;
            }
            let mut reaches_weight = false;
            for f in call_candidates(module, ci) {
                if module
                    .insts_of(f)
                    .any(|i| tables.weights.get(&i).copied().unwrap_or(0) > 0)
                {
                    reaches_weight = true;
                    break;
                }
            }
            if reaches_weight {
                tables.weights.insert(ci, 1);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for func in module.function_ids() {
        if module.function(func).has_body() {
            propagate_priorities(module, func, &tables.weights, &mut tables.priorities);
        }
    }
    tables
}

/// Possible targets of a call: the direct callee, or every defined function
/// with a matching arity for an indirect call.
fn call_candidates(module: &Module, call: InstId) -> Vec<FuncId> {
    let InstKind::Call { callee, args } = &module.inst(call).kind else {
        return Vec::new();
    };
    match callee {
        Callee::Direct(f) => {
            if module.function(*f).has_body() {
                vec![*f]
            } else {
                Vec::new()
            }
        }
        Callee::Indirect(_) => module
            .function_ids()
            .filter(|&f| {
                let func = module.function(f);
                func.has_body() && (func.params.len() == args.len() || func.is_vararg)
            })
            .collect(),
    }
}

/// The `none` strategy: nothing is ever prioritized.
#[derive(Debug, Clone)]
pub struct NoneHeuristic;

impl Heuristic for NoneHeuristic {
    fn name(&self) -> &'static str {
        "none"
    }

    fn current_priority(&self) -> u64 {
        0
    }

    fn update_value(&mut self, _value: ValueId, _is_nvm: bool) {}

    fn step(&mut self, _pc: InstId, _next_pc: Option<InstId>) {}

    fn box_clone(&self) -> Box<dyn Heuristic> {
        Box::new(self.clone())
    }
}

/// Fixed whole-program weights; never recomputed.
#[derive(Clone)]
pub struct StaticHeuristic {
    tables: Rc<WeightTables>,
    curr: Option<InstId>,
}

impl StaticHeuristic {
    /// Compute the tables once for the module.
    pub fn new(module: Rc<Module>, points_to: Rc<CachedPointsTo>, entry: FuncId) -> Self {
        let values = NvmValueDesc::static_state(&module, points_to);
        let sites = values.nvm_sites().clone();
        let tables = compute_module_tables(
            &module,
            &|i| values.may_modify_nvm(&module, i),
            &|i| {
                crate::ir::is_nvm_allocation_site(&module, i)
            },
            !sites.is_empty(),
        );
        debug!(
            weighted = tables.weights.len(),
            "static heuristic tables ready"
        );
        let curr = module.entry_inst(entry);
        Self {
            tables: Rc::new(tables),
            curr,
        }
    }
}

impl Heuristic for StaticHeuristic {
    fn name(&self) -> &'static str {
        "static"
    }

    fn current_priority(&self) -> u64 {
        self.curr
            .and_then(|i| self.tables.priorities.get(&i).copied())
            .unwrap_or(0)
    }

    fn update_value(&mut self, _value: ValueId, _is_nvm: bool) {}

    fn step(&mut self, _pc: InstId, next_pc: Option<InstId>) {
        self.curr = next_pc;
    }

    fn box_clone(&self) -> Box<dyn Heuristic> {
        Box::new(self.clone())
    }
}

/// Static weighting over a dynamic view of which allocation sites are live
/// and which values are known volatile. Tables are rebuilt whenever that
/// view changes.
#[derive(Clone)]
pub struct InsensitiveDynamicHeuristic {
    module: Rc<Module>,
    points_to: Rc<CachedPointsTo>,
    static_sites: Rc<FxHashSet<ValueId>>,
    active_sites: FxHashSet<ValueId>,
    known_volatiles: FxHashSet<ValueId>,
    tables: Rc<WeightTables>,
    curr: Option<InstId>,
}

impl InsensitiveDynamicHeuristic {
    /// Start with no active sites; allocations activate at run time.
    pub fn new(module: Rc<Module>, points_to: Rc<CachedPointsTo>, entry: FuncId) -> Self {
        let static_sites = Rc::new(crate::analysis::find_nvm_allocation_sites(&module));
        let curr = module.entry_inst(entry);
        let mut this = Self {
            module,
            points_to,
            static_sites,
            active_sites: FxHashSet::default(),
            known_volatiles: FxHashSet::default(),
            tables: Rc::new(WeightTables::default()),
            curr,
        };
        this.recompute();
        this
    }

    fn modifies_nvm(&self, inst: InstId) -> bool {
        let ptr = match &self.module.inst(inst).kind {
            InstKind::Store { ptr, .. } => *ptr,
            InstKind::Flush { ptr } => *ptr,
            _ => return false,
        };
        let reaches_active = self
            .points_to
            .points_to(ptr)
            .iter()
            .any(|site| self.active_sites.contains(site));
        if !reaches_active {
            return false;
        }
        !self
            .known_volatiles
            .iter()
            .any(|&vol| self.points_to.sets_equal(vol, ptr))
    }

    fn recompute(&mut self) {
        let module = self.module.clone();
        let static_sites = self.static_sites.clone();
        let tables = compute_module_tables(
            &module,
            &|i| self.modifies_nvm(i),
            &|i| {
                module
                    .inst(i)
                    .result
                    .is_some_and(|r| static_sites.contains(&r))
            },
            !self.active_sites.is_empty(),
        );
        self.tables = Rc::new(tables);
    }
}

impl Heuristic for InsensitiveDynamicHeuristic {
    fn name(&self) -> &'static str {
        "insensitive-dynamic"
    }

    fn current_priority(&self) -> u64 {
        self.curr
            .and_then(|i| self.tables.priorities.get(&i).copied())
            .unwrap_or(0)
    }

    fn update_value(&mut self, value: ValueId, is_nvm: bool) {
        let mut changed = false;
        if is_nvm {
            for site in self.points_to.points_to(value).iter() {
                if self.static_sites.contains(site) {
                    changed |= self.active_sites.insert(*site);
                }
            }
        } else {
            changed |= self.known_volatiles.insert(value);
        }
        if changed {
            self.recompute();
        }
    }

    fn step(&mut self, _pc: InstId, next_pc: Option<InstId>) {
        self.curr = next_pc;
    }

    fn box_clone(&self) -> Box<dyn Heuristic> {
        Box::new(self.clone())
    }
}

/// Per-call-context weights with a per-state context stack.
#[derive(Clone)]
pub struct ContextDynamicHeuristic {
    module: Rc<Module>,
    cache: Rc<RefCell<ContextCache>>,
    stack: Vec<ContextRef>,
    ctx: ContextRef,
    curr: Option<InstId>,
}

impl ContextDynamicHeuristic {
    /// Build the entry function's context.
    pub fn new(module: Rc<Module>, points_to: Rc<CachedPointsTo>, entry: FuncId) -> Self {
        let values = NvmValueDesc::static_state(&module, points_to);
        let mut cache = ContextCache::new();
        let ctx = cache.get_or_build(&module, entry, values, false);
        let curr = module.entry_inst(entry);
        Self {
            module,
            cache: Rc::new(RefCell::new(cache)),
            stack: Vec::new(),
            ctx,
            curr,
        }
    }
}

impl Heuristic for ContextDynamicHeuristic {
    fn name(&self) -> &'static str {
        "context-dynamic"
    }

    fn current_priority(&self) -> u64 {
        self.curr.map_or(0, |i| self.ctx.borrow().priority(i))
    }

    fn update_value(&mut self, value: ValueId, is_nvm: bool) {
        let mut cache = self.cache.borrow_mut();
        let next = NvmContextDesc::try_update_context(
            &self.ctx,
            &mut cache,
            &self.module,
            value,
            is_nvm,
        );
        self.ctx = next;
    }

    fn step(&mut self, pc: InstId, next_pc: Option<InstId>) {
        let Some(next) = next_pc else {
            self.curr = None;
            return;
        };
        if matches!(self.module.inst(pc).kind, InstKind::Ret { .. }) {
            if let Some(parent) = self.stack.pop() {
                self.ctx = parent;
            }
        } else {
            let mut cache = self.cache.borrow_mut();
            let next_ctx = NvmContextDesc::try_get_next_context(
                &self.ctx,
                &mut cache,
                &self.module,
                pc,
                next,
            );
            if !Rc::ptr_eq(&next_ctx, &self.ctx) {
                self.stack.push(self.ctx.clone());
                self.ctx = next_ctx;
            }
        }
        self.curr = Some(next);
    }

    fn box_clone(&self) -> Box<dyn Heuristic> {
        Box::new(self.clone())
    }
}
