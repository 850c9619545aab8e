//! Per-path execution state, as seen by the checker.
//!
//! The engine owns instruction dispatch and the byte-level store; this type
//! carries everything the persistence analysis needs per path: the call
//! stack (for root-cause attribution), the path condition, the persistent
//! objects with their shadow state, the concrete epoch mirror, and the
//! search heuristic. `fork` deep-clones all of it.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::expr::ExprRef;
use crate::heuristic::Heuristic;
use crate::ir::{FuncId, InstId, Module, ValueId};
use crate::pmem::epoch::PersistentMemoryState;
use crate::pmem::root_cause::{BugKind, RootCauseLocation, StackFrameInfo};
use crate::pmem::shadow::PersistentState;
use crate::pmem::AddrRange;

/// Dense per-run state identifier.
pub type StateId = u64;

/// One frame of the modeled call stack.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Function executing in this frame.
    pub func: FuncId,
    /// Call instruction in the caller, `None` for the entry frame.
    pub call_site: Option<InstId>,
}

/// Why a path stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Ran to completion.
    Exited,
    /// The engine killed the path on an error.
    Error(String),
}

/// Checker-visible execution state for one path.
pub struct ExecutionState {
    /// State identity, unique within the run.
    pub id: StateId,
    /// Call stack, outermost frame first.
    pub frames: Vec<StackFrame>,
    /// Path condition.
    pub constraints: Vec<ExprRef>,
    /// Persistent objects keyed by base address.
    pub objects: BTreeMap<u64, PersistentState>,
    /// Runtime values of IR values, maintained by the engine.
    pub bindings: FxHashMap<ValueId, ExprRef>,
    /// Concrete mirror of store/flush/fence history, for ordering queries.
    pub epoch_model: PersistentMemoryState,
    /// Search guidance for this path.
    pub heuristic: Box<dyn Heuristic>,
    /// Most recently executed instruction.
    pub prev_pc: Option<InstId>,
    /// Set when the path has stopped.
    pub termination: Option<Termination>,
}

impl ExecutionState {
    /// Fresh state entering `entry`.
    pub fn new(
        id: StateId,
        entry: FuncId,
        cache_line_size: u64,
        heuristic: Box<dyn Heuristic>,
    ) -> Self {
        Self {
            id,
            frames: vec![StackFrame {
                func: entry,
                call_site: None,
            }],
            constraints: Vec::new(),
            objects: BTreeMap::new(),
            bindings: FxHashMap::default(),
            epoch_model: PersistentMemoryState::new(cache_line_size),
            heuristic,
            prev_pc: None,
            termination: None,
        }
    }

    /// Deep copy for a fork; the clone gets `id`.
    pub fn fork(&self, id: StateId) -> Self {
        Self {
            id,
            frames: self.frames.clone(),
            constraints: self.constraints.clone(),
            objects: self.objects.clone(),
            bindings: self.bindings.clone(),
            epoch_model: self.epoch_model.clone(),
            heuristic: self.heuristic.clone(),
            prev_pc: self.prev_pc,
            termination: self.termination.clone(),
        }
    }

    /// Add `constraint` to the path condition.
    pub fn add_constraint(&mut self, constraint: ExprRef) {
        self.constraints.push(constraint);
    }

    /// Bind the runtime value of an IR value.
    pub fn bind(&mut self, value: ValueId, expr: ExprRef) {
        self.bindings.insert(value, expr);
    }

    /// Runtime value of an IR value, if bound.
    pub fn value_of(&self, value: ValueId) -> Option<&ExprRef> {
        self.bindings.get(&value)
    }

    /// Enter `func` from `call_site`.
    pub fn push_frame(&mut self, func: FuncId, call_site: InstId) {
        self.frames.push(StackFrame {
            func,
            call_site: Some(call_site),
        });
    }

    /// Return to the caller.
    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// The persistent object containing `addr`, if any.
    pub fn object_at(&self, addr: u64) -> Option<&PersistentState> {
        self.objects
            .range(..=addr)
            .next_back()
            .map(|(_, obj)| obj)
            .filter(|obj| obj.info().range().contains(addr))
    }

    /// Mutable access to the persistent object containing `addr`.
    pub fn object_at_mut(&mut self, addr: u64) -> Option<&mut PersistentState> {
        let base = self
            .objects
            .range(..=addr)
            .next_back()
            .map(|(base, _)| *base)?;
        let obj = self.objects.get_mut(&base)?;
        if obj.info().range().contains(addr) {
            Some(obj)
        } else {
            None
        }
    }

    /// Whether every byte of `range` is backed by persistent objects.
    pub fn range_is_pmem(&self, range: AddrRange) -> bool {
        if range.is_empty() {
            return true;
        }
        let mut cursor = range.start;
        while cursor < range.end {
            match self.object_at(cursor) {
                Some(obj) => cursor = obj.info().range().end,
                None => return false,
            }
        }
        true
    }

    /// Attach a persistent object.
    pub fn add_object(&mut self, shadow: PersistentState) {
        self.objects.insert(shadow.info().base, shadow);
    }

    /// Stack snapshot for reports, innermost frame first. Each frame is
    /// annotated with its call site's source position.
    pub fn stack_snapshot(&self, module: &Module) -> Vec<StackFrameInfo> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let loc = frame.call_site.and_then(|cs| module.loc_of(cs).cloned());
                StackFrameInfo {
                    function: module.function(frame.func).name.clone(),
                    file: loc.as_ref().map(|l| l.file.to_string()),
                    line: loc.map(|l| l.line),
                }
            })
            .collect()
    }

    /// Root-cause location for an event at `inst` in this state.
    pub fn root_cause_location(
        &self,
        module: &Module,
        alloc_site: Option<&str>,
        inst: InstId,
        reason: BugKind,
    ) -> RootCauseLocation {
        let loc = module.loc_of(inst);
        RootCauseLocation {
            alloc_site: alloc_site.map(str::to_string),
            instruction: module.describe_inst(inst),
            file: loc.map(|l| l.file.to_string()),
            line: loc.map(|l| l.line),
            stack: self.stack_snapshot(module),
            reason,
        }
    }

    /// Stop the path with an error; later instructions are not executed.
    pub fn terminate_with_error(&mut self, msg: impl Into<String>) {
        self.termination = Some(Termination::Error(msg.into()));
    }

    /// Whether the path is still running.
    pub fn is_live(&self) -> bool {
        self.termination.is_none()
    }
}

impl std::fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionState")
            .field("id", &self.id)
            .field("frames", &self.frames.len())
            .field("objects", &self.objects.len())
            .field("constraints", &self.constraints.len())
            .field("terminated", &self.termination)
            .finish()
    }
}
