//! A lean view of the program under test.
//!
//! The symbolic execution engine owns the real compiled IR; the checker only
//! needs enough structure to classify instructions (stores, cache flushes,
//! fences, calls), walk control flow, and attribute bug reports to source
//! locations. Builders live in [`build`].

use std::fmt;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

pub mod build;

pub use build::ModuleBuilder;

/// Function index within a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Basic-block index, local to its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Instruction index, global across the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

/// Value index, global across the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Named struct type attached to a pointer operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructRef {
    /// Type name as spelled in the source IR, e.g. `volatile_byte`.
    pub name: Rc<str>,
    /// Store size of the struct in bytes.
    pub size: u64,
}

/// What a [`ValueId`] denotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// A module-level variable; the value is its address.
    Global(String),
    /// Formal parameter `index` of `func`.
    Param { func: FuncId, index: usize },
    /// The result of an instruction.
    Inst(InstId),
    /// The address of a function.
    Function(FuncId),
    /// An integer constant (used for flag arguments such as `mmap`'s fd).
    Const(i64),
}

/// Static facts about one value.
#[derive(Debug, Clone)]
pub struct ValueInfo {
    /// What the value denotes.
    pub kind: ValueKind,
    /// Whether the static type is a pointer.
    pub is_pointer: bool,
    /// The struct type this pointer points at, when known.
    pub pointee_struct: Option<StructRef>,
}

/// Call target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// Statically resolved function.
    Direct(FuncId),
    /// Call through a function pointer.
    Indirect(ValueId),
}

/// Instruction payload.
#[derive(Debug, Clone)]
pub enum InstKind {
    /// Stack allocation; the result is a fresh allocation site.
    Alloca,
    /// `*ptr = value`, writing `size` bytes.
    Store {
        /// Value being written.
        value: ValueId,
        /// Destination pointer.
        ptr: ValueId,
        /// Width of the store in bytes.
        size: u64,
    },
    /// Read through `ptr`.
    Load {
        /// Source pointer.
        ptr: ValueId,
    },
    /// Pointer derivation (address computation, cast).
    Gep {
        /// Pointer the result is derived from.
        base: ValueId,
    },
    /// Function call.
    Call {
        /// Target.
        callee: Callee,
        /// Actual arguments.
        args: SmallVec<[ValueId; 4]>,
    },
    /// Return to the caller.
    Ret {
        /// Returned value, if any.
        value: Option<ValueId>,
    },
    /// Branch to one or more successor blocks.
    Br {
        /// Successor blocks.
        targets: SmallVec<[BlockId; 2]>,
    },
    /// Cache-line write-back request (`clwb`/`clflush`-class).
    Flush {
        /// Address whose covering line is flushed.
        ptr: ValueId,
    },
    /// Global store barrier (`sfence`/`mfence`-class).
    Fence,
    /// Anything the checker does not interpret.
    Nop,
}

/// Source position used in reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    /// Source file.
    pub file: Rc<str>,
    /// 1-based line.
    pub line: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// One instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Payload.
    pub kind: InstKind,
    /// Owning function.
    pub func: FuncId,
    /// Owning block.
    pub block: BlockId,
    /// Result value, for value-producing instructions.
    pub result: Option<ValueId>,
    /// Source position, when debug info was available.
    pub loc: Option<SourceLoc>,
}

/// Basic block: an instruction sequence plus CFG edges.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// Instructions in program order.
    pub insts: Vec<InstId>,
    /// Predecessor blocks.
    pub preds: Vec<BlockId>,
    /// Successor blocks.
    pub succs: Vec<BlockId>,
}

/// A function definition or declaration.
#[derive(Debug, Clone)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Formal parameters.
    pub params: Vec<ValueId>,
    /// Body blocks; block 0 is the entry. Empty for declarations.
    pub blocks: Vec<Block>,
    /// True when the body is external to the module.
    pub is_declaration: bool,
    /// True for vararg declarations.
    pub is_vararg: bool,
}

impl Function {
    /// Whether the function has a body to analyze.
    pub fn has_body(&self) -> bool {
        !self.is_declaration && !self.blocks.is_empty()
    }
}

/// Whole-module container. Instructions and values use dense global ids so
/// analysis maps can be flat.
#[derive(Debug, Clone, Default)]
pub struct Module {
    functions: Vec<Function>,
    insts: Vec<Instruction>,
    values: Vec<ValueInfo>,
    by_name: FxHashMap<String, FuncId>,
}

impl Module {
    /// Function lookup by id.
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    /// Function lookup by symbol name.
    pub fn function_named(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    /// All function ids.
    pub fn function_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len() as u32).map(FuncId)
    }

    /// Instruction lookup.
    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.0 as usize]
    }

    /// Value lookup.
    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.0 as usize]
    }

    /// Total instruction count.
    pub fn inst_count(&self) -> usize {
        self.insts.len()
    }

    /// Total value count.
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// All value ids.
    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> {
        (0..self.values.len() as u32).map(ValueId)
    }

    /// All instruction ids, module order.
    pub fn inst_ids(&self) -> impl Iterator<Item = InstId> {
        (0..self.insts.len() as u32).map(InstId)
    }

    /// Instruction ids belonging to `func`, program order.
    pub fn insts_of(&self, func: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.function(func)
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter().copied())
    }

    /// First instruction of the entry block, if the function has a body.
    pub fn entry_inst(&self, func: FuncId) -> Option<InstId> {
        self.function(func)
            .blocks
            .first()
            .and_then(|b| b.insts.first().copied())
    }

    /// The instruction after `id` within the same block.
    pub fn next_in_block(&self, id: InstId) -> Option<InstId> {
        let inst = self.inst(id);
        let block = &self.function(inst.func).blocks[inst.block.0 as usize];
        let pos = block.insts.iter().position(|&i| i == id)?;
        block.insts.get(pos + 1).copied()
    }

    /// The direct callee of a call instruction, if statically known.
    pub fn direct_callee(&self, id: InstId) -> Option<FuncId> {
        match &self.inst(id).kind {
            InstKind::Call {
                callee: Callee::Direct(f),
                ..
            } => Some(*f),
            _ => None,
        }
    }

    /// Whether `id` is a cache-flush instruction.
    pub fn is_flush(&self, id: InstId) -> bool {
        matches!(self.inst(id).kind, InstKind::Flush { .. })
    }

    /// Whether `id` is a store barrier.
    pub fn is_fence(&self, id: InstId) -> bool {
        matches!(self.inst(id).kind, InstKind::Fence)
    }

    /// Short human-readable description, for reports.
    pub fn describe_inst(&self, id: InstId) -> String {
        let inst = self.inst(id);
        let mnemonic = match &inst.kind {
            InstKind::Alloca => "alloca".to_string(),
            InstKind::Store { .. } => "store".to_string(),
            InstKind::Load { .. } => "load".to_string(),
            InstKind::Gep { .. } => "getelementptr".to_string(),
            InstKind::Call {
                callee: Callee::Direct(f),
                ..
            } => format!("call {}", self.function(*f).name),
            InstKind::Call {
                callee: Callee::Indirect(_),
                ..
            } => "call <indirect>".to_string(),
            InstKind::Ret { .. } => "ret".to_string(),
            InstKind::Br { .. } => "br".to_string(),
            InstKind::Flush { .. } => "flush".to_string(),
            InstKind::Fence => "fence".to_string(),
            InstKind::Nop => "nop".to_string(),
        };
        let in_fn = &self.function(inst.func).name;
        match &inst.loc {
            Some(loc) => format!("{mnemonic} in {in_fn}() at {loc}"),
            None => format!("{mnemonic} in {in_fn}()"),
        }
    }

    /// Source location of `id`, if recorded.
    pub fn loc_of(&self, id: InstId) -> Option<&SourceLoc> {
        self.inst(id).loc.as_ref()
    }

    pub(crate) fn functions_mut(&mut self) -> &mut Vec<Function> {
        &mut self.functions
    }

    pub(crate) fn insts_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.insts
    }

    pub(crate) fn values_mut(&mut self) -> &mut Vec<ValueInfo> {
        &mut self.values
    }

    pub(crate) fn by_name_mut(&mut self) -> &mut FxHashMap<String, FuncId> {
        &mut self.by_name
    }
}

/// Names of the program-facing persistent-memory primitives.
pub mod intrinsic_names {
    /// Convert an existing allocation into a persistent object.
    pub const MARK_PERSISTENT: &str = "pmem_mark_persistent";
    /// Allocate a fresh persistent object.
    pub const ALLOC_PMEM: &str = "pmem_alloc";
    /// Assert a range is durable.
    pub const CHECK_PERSISTED: &str = "pmem_check_persisted";
    /// Assert two ranges persisted in order.
    pub const CHECK_ORDERED_BEFORE: &str = "pmem_check_ordered_before";
    /// Query whether a range is backed by persistent memory.
    pub const IS_PMEM: &str = "pmem_is_pmem";
}

/// Position of the file-descriptor argument in `mmap(addr, len, prot, flags,
/// fd, off)`.
const MMAP_FD_ARG: usize = 4;

/// Whether the call at `id` allocates (or adopts) persistent memory.
///
/// Intrinsic allocation calls always qualify. `mmap`/`mmap64` qualify unless
/// the fd argument is the constant −1 (an anonymous, volatile mapping); a
/// symbolic fd is conservatively treated as file-backed.
pub fn is_nvm_allocation_site(module: &Module, id: InstId) -> bool {
    let Some(callee) = module.direct_callee(id) else {
        return false;
    };
    let name = module.function(callee).name.as_str();
    if name == intrinsic_names::MARK_PERSISTENT || name == intrinsic_names::ALLOC_PMEM {
        return true;
    }
    if name == "mmap" || name == "mmap64" {
        let InstKind::Call { args, .. } = &module.inst(id).kind else {
            return false;
        };
        return match args.get(MMAP_FD_ARG) {
            Some(&fd) => !matches!(module.value(fd).kind, ValueKind::Const(-1)),
            None => true,
        };
    }
    false
}
