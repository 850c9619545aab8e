//! Whole-program pointer analysis.
//!
//! An inclusion-based (Andersen-style) points-to analysis over the crate IR,
//! a memoizing wrapper that amortizes repeated per-value queries, and the
//! discovery of persistent allocation sites. The heuristic layer consumes
//! all three through the [`PointsToAnalysis`] trait, so an engine with its
//! own analysis can slot in directly.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::ir::{self, Callee, InstKind, Module, ValueId, ValueKind};

/// Abstract points-to provider: maps a value to the allocation sites it may
/// refer to. Sites are themselves values (alloca results, allocator call
/// results, globals).
pub trait PointsToAnalysis {
    /// The set of allocation sites `value` may point to.
    fn points_to_set(&self, value: ValueId) -> Vec<ValueId>;
}

/// Inclusion-based points-to analysis computed to fixpoint at construction.
#[derive(Debug)]
pub struct AndersenAnalysis {
    points_to: FxHashMap<ValueId, FxHashSet<ValueId>>,
}

impl AndersenAnalysis {
    /// Run the analysis over `module`.
    pub fn build(module: &Module) -> Self {
        let mut pts: FxHashMap<ValueId, FxHashSet<ValueId>> = FxHashMap::default();
        // Field-insensitive heap: allocation site -> what its cells point to.
        let mut heap: FxHashMap<ValueId, FxHashSet<ValueId>> = FxHashMap::default();

        let mut copies: Vec<(ValueId, ValueId)> = Vec::new(); // dst ⊇ src
        let mut loads: Vec<(ValueId, ValueId)> = Vec::new(); // result, ptr
        let mut stores: Vec<(ValueId, ValueId)> = Vec::new(); // value, ptr

        // Base facts: globals and allocation instructions point to
        // themselves.
        for id in 0..module.inst_count() as u32 {
            let inst_id = ir::InstId(id);
            let inst = module.inst(inst_id);
            match &inst.kind {
                InstKind::Alloca => {
                    if let Some(r) = inst.result {
                        pts.entry(r).or_default().insert(r);
                    }
                }
                InstKind::Gep { base } => {
                    if let Some(r) = inst.result {
                        copies.push((r, *base));
                    }
                }
                InstKind::Load { ptr } => {
                    if let Some(r) = inst.result {
                        loads.push((r, *ptr));
                    }
                }
                InstKind::Store { value, ptr, .. } => {
                    stores.push((*value, *ptr));
                }
                InstKind::Call { callee, args } => {
                    let Callee::Direct(f) = callee else {
                        // Indirect targets are resolved at run time by the
                        // heuristic layer; no static edges.
                        continue;
                    };
                    let func = module.function(*f);
                    if func.has_body() {
                        for (param, arg) in func.params.iter().zip(args.iter()) {
                            copies.push((*param, *arg));
                        }
                        if let Some(r) = inst.result {
                            for ret in module.insts_of(*f) {
                                if let InstKind::Ret { value: Some(v) } = &module.inst(ret).kind {
                                    copies.push((r, *v));
                                }
                            }
                        }
                    } else if let Some(r) = inst.result {
                        // External allocators hand back fresh storage.
                        let name = func.name.as_str();
                        if name == "mmap"
                            || name == "mmap64"
                            || name == "malloc"
                            || name == ir::intrinsic_names::ALLOC_PMEM
                            || name == ir::intrinsic_names::MARK_PERSISTENT
                        {
                            pts.entry(r).or_default().insert(r);
                        }
                        if name == ir::intrinsic_names::MARK_PERSISTENT {
                            // The marked region aliases the argument.
                            if let Some(arg) = args.first() {
                                copies.push((r, *arg));
                                copies.push((*arg, r));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        for v in module.value_ids() {
            if matches!(module.value(v).kind, ValueKind::Global(_)) {
                pts.entry(v).or_default().insert(v);
            }
        }

        // Propagate to fixpoint.
        loop {
            let mut changed = false;
            for &(dst, src) in &copies {
                changed |= union_into(&mut pts, dst, src);
            }
            for &(result, ptr) in &loads {
                let sites: Vec<ValueId> =
                    pts.get(&ptr).map(|s| s.iter().copied().collect()).unwrap_or_default();
                for site in sites {
                    let cells: Vec<ValueId> = heap
                        .get(&site)
                        .map(|s| s.iter().copied().collect())
                        .unwrap_or_default();
                    let entry = pts.entry(result).or_default();
                    for c in cells {
                        changed |= entry.insert(c);
                    }
                }
            }
            for &(value, ptr) in &stores {
                let sites: Vec<ValueId> =
                    pts.get(&ptr).map(|s| s.iter().copied().collect()).unwrap_or_default();
                let vals: Vec<ValueId> =
                    pts.get(&value).map(|s| s.iter().copied().collect()).unwrap_or_default();
                for site in sites {
                    let entry = heap.entry(site).or_default();
                    for &v in &vals {
                        changed |= entry.insert(v);
                    }
                }
            }
            if !changed {
                break;
            }
        }

        trace!(values = pts.len(), "points-to analysis complete");
        Self { points_to: pts }
    }
}

fn union_into(
    pts: &mut FxHashMap<ValueId, FxHashSet<ValueId>>,
    dst: ValueId,
    src: ValueId,
) -> bool {
    if dst == src {
        return false;
    }
    let from: Vec<ValueId> = pts.get(&src).map(|s| s.iter().copied().collect()).unwrap_or_default();
    if from.is_empty() {
        return false;
    }
    let entry = pts.entry(dst).or_default();
    let mut changed = false;
    for v in from {
        changed |= entry.insert(v);
    }
    changed
}

impl PointsToAnalysis for AndersenAnalysis {
    fn points_to_set(&self, value: ValueId) -> Vec<ValueId> {
        self.points_to
            .get(&value)
            .map(|s| {
                let mut v: Vec<ValueId> = s.iter().copied().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }
}

/// Memoizing wrapper over any [`PointsToAnalysis`].
///
/// Reconstructing a points-to set walks the analysis' internal structures,
/// so per-value results are cached on first use.
pub struct CachedPointsTo {
    inner: Rc<dyn PointsToAnalysis>,
    cache: RefCell<FxHashMap<ValueId, Rc<FxHashSet<ValueId>>>>,
}

impl std::fmt::Debug for CachedPointsTo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPointsTo")
            .field("cached", &self.cache.borrow().len())
            .finish()
    }
}

impl CachedPointsTo {
    /// Wrap an analysis.
    pub fn new(inner: Rc<dyn PointsToAnalysis>) -> Self {
        Self {
            inner,
            cache: RefCell::new(FxHashMap::default()),
        }
    }

    /// Memoized points-to set for `value`.
    pub fn points_to(&self, value: ValueId) -> Rc<FxHashSet<ValueId>> {
        if let Some(hit) = self.cache.borrow().get(&value) {
            return hit.clone();
        }
        let set: Rc<FxHashSet<ValueId>> =
            Rc::new(self.inner.points_to_set(value).into_iter().collect());
        self.cache.borrow_mut().insert(value, set.clone());
        set
    }

    /// May `a` and `b` refer to the same allocation?
    pub fn may_alias(&self, a: ValueId, b: ValueId) -> bool {
        let sa = self.points_to(a);
        let sb = self.points_to(b);
        let (small, large) = if sa.len() <= sb.len() { (&sa, &sb) } else { (&sb, &sa) };
        small.iter().any(|site| large.contains(site))
    }

    /// Do `a` and `b` have exactly the same points-to set?
    pub fn sets_equal(&self, a: ValueId, b: ValueId) -> bool {
        let sa = self.points_to(a);
        let sb = self.points_to(b);
        *sa == *sb
    }
}

/// Every static site whose returned pointer refers to persistent memory.
///
/// A call qualifies if it is one of the persistent-allocation intrinsics, or
/// an `mmap`/`mmap64` whose fd is not the constant −1 (symbolic fds count as
/// file-backed).
pub fn find_nvm_allocation_sites(module: &Module) -> FxHashSet<ValueId> {
    let mut sites = FxHashSet::default();
    for inst_id in module.inst_ids() {
        if ir::is_nvm_allocation_site(module, inst_id) {
            if let Some(result) = module.inst(inst_id).result {
                sites.insert(result);
            }
        }
    }
    sites
}
