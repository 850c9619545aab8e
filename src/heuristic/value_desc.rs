//! Per-path classification of values as persistent or volatile.
//!
//! A descriptor is immutable; every update hands back a fresh shared
//! descriptor so forked states and cached call contexts can share freely.

use std::rc::Rc;

use rustc_hash::FxHashSet;

use crate::analysis::CachedPointsTo;
use crate::ir::{FuncId, InstId, InstKind, Module, ValueId, ValueKind};

/// Shared descriptor handle.
pub type ValueDescRef = Rc<NvmValueDesc>;

/// The NVM/volatile knowledge at one point on one path.
///
/// Three sets drive the classification: the persistent allocation sites
/// (fixed for the whole run), values known not to be NVM anywhere, and
/// values known not to be NVM within the current call frame.
pub struct NvmValueDesc {
    points_to: Rc<CachedPointsTo>,
    nvm_sites: Rc<FxHashSet<ValueId>>,
    not_local_nvm: FxHashSet<ValueId>,
    not_global_nvm: FxHashSet<ValueId>,
}

impl std::fmt::Debug for NvmValueDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmValueDesc")
            .field("nvm_sites", &self.nvm_sites.len())
            .field("not_local_nvm", &self.not_local_nvm.len())
            .field("not_global_nvm", &self.not_global_nvm.len())
            .finish()
    }
}

impl PartialEq for NvmValueDesc {
    fn eq(&self, other: &Self) -> bool {
        *self.nvm_sites == *other.nvm_sites
            && self.not_local_nvm == other.not_local_nvm
            && self.not_global_nvm == other.not_global_nvm
    }
}

impl Eq for NvmValueDesc {}

impl NvmValueDesc {
    /// Descriptor at program start: all discovered allocation sites, no
    /// known volatiles.
    pub fn static_state(
        module: &Module,
        points_to: Rc<CachedPointsTo>,
    ) -> ValueDescRef {
        let sites = crate::analysis::find_nvm_allocation_sites(module);
        Self::with_sites(points_to, Rc::new(sites))
    }

    /// Descriptor over a known allocation-site set.
    pub fn with_sites(
        points_to: Rc<CachedPointsTo>,
        nvm_sites: Rc<FxHashSet<ValueId>>,
    ) -> ValueDescRef {
        Rc::new(Self {
            points_to,
            nvm_sites,
            not_local_nvm: FxHashSet::default(),
            not_global_nvm: FxHashSet::default(),
        })
    }

    /// The run-wide persistent allocation sites.
    pub fn nvm_sites(&self) -> &Rc<FxHashSet<ValueId>> {
        &self.nvm_sites
    }

    /// Cheap order-insensitive fingerprint; pair with structural equality.
    pub fn fingerprint(&self) -> u64 {
        ((self.not_local_nvm.len() as u64) << 16)
            | ((self.not_global_nvm.len() as u64) << 8)
            | self.nvm_sites.len() as u64
    }

    /// Points-to set restricted to persistent allocation sites.
    fn nvm_points_to(&self, value: ValueId) -> Vec<ValueId> {
        self.points_to
            .points_to(value)
            .iter()
            .copied()
            .filter(|site| self.nvm_sites.contains(site))
            .collect()
    }

    fn points_to_eq(&self, a: ValueId, b: ValueId) -> bool {
        self.points_to.sets_equal(a, b)
    }

    /// May `value` point into persistent memory?
    ///
    /// True when the points-to set reaches an allocation site and no known
    /// volatile (local or global) has the same points-to set.
    pub fn is_nvm(&self, value: ValueId) -> bool {
        if self.nvm_points_to(value).is_empty() {
            return false;
        }
        !self
            .not_local_nvm
            .iter()
            .chain(self.not_global_nvm.iter())
            .any(|&vol| self.points_to_eq(vol, value))
    }

    /// Record the resolved NVM-ness of `value`, returning the resulting
    /// descriptor. Only negative facts are stored; positives are already
    /// implied by the points-to sets.
    pub fn update(self: &Rc<Self>, module: &Module, value: ValueId, is_nvm: bool) -> ValueDescRef {
        if is_nvm || !module.value(value).is_pointer {
            return self.clone();
        }
        let mut next = self.duplicate();
        if matches!(module.value(value).kind, ValueKind::Global(_)) {
            next.not_global_nvm.insert(value);
        } else {
            next.not_local_nvm.insert(value);
        }
        Rc::new(next)
    }

    /// Value state for entering `callee` at `call_inst`.
    ///
    /// Frame-local knowledge is dropped; globals persist. Pointer arguments
    /// that cannot point to NVM poison the matching parameter.
    pub fn do_call(self: &Rc<Self>, module: &Module, call_inst: InstId, callee: FuncId) -> ValueDescRef {
        let mut next = Self {
            points_to: self.points_to.clone(),
            nvm_sites: self.nvm_sites.clone(),
            not_local_nvm: FxHashSet::default(),
            not_global_nvm: self.not_global_nvm.clone(),
        };

        let InstKind::Call { args, .. } = &module.inst(call_inst).kind else {
            return Rc::new(next);
        };
        let func = module.function(callee);
        for (i, &arg) in args.iter().enumerate() {
            if !module.value(arg).is_pointer {
                continue;
            }
            if self.is_nvm(arg) {
                continue;
            }
            let Some(&param) = func.params.get(i) else {
                // Extra args land in the vararg area; nothing to poison.
                break;
            };
            if module.value(param).is_pointer {
                next.not_local_nvm.insert(param);
            }
        }

        Rc::new(next)
    }

    /// Value state after returning to the caller: propagate the NVM-ness of
    /// the returned pointer into `dest`.
    pub fn do_return(
        self: &Rc<Self>,
        module: &Module,
        caller: &ValueDescRef,
        ret_inst: InstId,
        dest: Option<ValueId>,
    ) -> ValueDescRef {
        let InstKind::Ret { value: Some(ret_val) } = module.inst(ret_inst).kind else {
            return caller.clone();
        };
        let Some(dest) = dest else {
            return caller.clone();
        };
        if !module.value(ret_val).is_pointer || self.points_to.points_to(ret_val).is_empty() {
            return caller.clone();
        }
        caller.update(module, dest, self.is_nvm(ret_val))
    }

    /// Whether executing `inst` can modify persistent memory: a store
    /// through an NVM pointer or a flush of one.
    pub fn may_modify_nvm(&self, module: &Module, inst: InstId) -> bool {
        match &module.inst(inst).kind {
            InstKind::Store { ptr, .. } => self.is_nvm(*ptr),
            InstKind::Flush { ptr } => self.is_nvm(*ptr),
            _ => false,
        }
    }

    fn duplicate(&self) -> Self {
        Self {
            points_to: self.points_to.clone(),
            nvm_sites: self.nvm_sites.clone(),
            not_local_nvm: self.not_local_nvm.clone(),
            not_global_nvm: self.not_global_nvm.clone(),
        }
    }
}
