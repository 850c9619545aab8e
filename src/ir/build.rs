//! Programmatic module construction.
//!
//! Test harnesses and engine front ends assemble a [`Module`] through this
//! builder; it keeps the dense id spaces consistent and wires the CFG edges
//! on `finish()`.

use std::rc::Rc;

use smallvec::SmallVec;

use super::{
    Block, BlockId, Callee, FuncId, Function, InstId, InstKind, Instruction, Module, SourceLoc,
    StructRef, ValueId, ValueInfo, ValueKind,
};

/// Incremental [`Module`] builder.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    module: Module,
    current_func: Option<FuncId>,
    current_block: Option<BlockId>,
    current_loc: Option<SourceLoc>,
}

impl ModuleBuilder {
    /// Fresh empty module.
    pub fn new() -> Self {
        Self::default()
    }

    fn push_value(&mut self, info: ValueInfo) -> ValueId {
        let id = ValueId(self.module.values_mut().len() as u32);
        self.module.values_mut().push(info);
        id
    }

    /// Add an integer constant value.
    pub fn constant(&mut self, value: i64) -> ValueId {
        self.push_value(ValueInfo {
            kind: ValueKind::Const(value),
            is_pointer: false,
            pointee_struct: None,
        })
    }

    /// Add a module-level pointer variable.
    pub fn global(&mut self, name: &str) -> ValueId {
        self.push_value(ValueInfo {
            kind: ValueKind::Global(name.to_string()),
            is_pointer: true,
            pointee_struct: None,
        })
    }

    /// Declare an external function with `nparams` parameters.
    pub fn declare(&mut self, name: &str, nparams: usize) -> FuncId {
        self.add_function(name, &vec![false; nparams], true)
    }

    /// Begin a function definition; subsequent instruction calls append to
    /// it. `param_ptrs[i]` records whether parameter `i` is a pointer.
    pub fn begin_function(&mut self, name: &str, param_ptrs: &[bool]) -> FuncId {
        let id = self.add_function(name, param_ptrs, false);
        self.current_func = Some(id);
        self.current_block = Some(self.fresh_block(id));
        id
    }

    fn add_function(&mut self, name: &str, param_ptrs: &[bool], is_declaration: bool) -> FuncId {
        let id = FuncId(self.module.functions_mut().len() as u32);
        let params = param_ptrs
            .iter()
            .enumerate()
            .map(|(index, &is_pointer)| {
                self.push_value(ValueInfo {
                    kind: ValueKind::Param { func: id, index },
                    is_pointer,
                    pointee_struct: None,
                })
            })
            .collect();
        self.module.functions_mut().push(Function {
            name: name.to_string(),
            params,
            blocks: Vec::new(),
            is_declaration,
            is_vararg: false,
        });
        self.module.by_name_mut().insert(name.to_string(), id);
        id
    }

    /// The value for parameter `index` of `func`.
    pub fn param(&self, func: FuncId, index: usize) -> ValueId {
        self.module.function(func).params[index]
    }

    /// The address-of value for a defined function (for indirect calls).
    pub fn function_addr(&mut self, func: FuncId) -> ValueId {
        self.push_value(ValueInfo {
            kind: ValueKind::Function(func),
            is_pointer: true,
            pointee_struct: None,
        })
    }

    fn fresh_block(&mut self, func: FuncId) -> BlockId {
        let blocks = &mut self.module.functions_mut()[func.0 as usize].blocks;
        let id = BlockId(blocks.len() as u32);
        blocks.push(Block::default());
        id
    }

    /// Append a new basic block to the current function and switch to it.
    pub fn begin_block(&mut self) -> BlockId {
        let func = self.current_func.expect("no function in progress");
        let id = self.fresh_block(func);
        self.current_block = Some(id);
        id
    }

    /// Switch the insertion point to an existing block.
    pub fn set_block(&mut self, block: BlockId) {
        self.current_block = Some(block);
    }

    /// Source location applied to subsequently added instructions.
    pub fn set_loc(&mut self, file: &str, line: u32) {
        self.current_loc = Some(SourceLoc {
            file: Rc::from(file),
            line,
        });
    }

    /// Attach a struct type to a pointer value (for the type-driven
    /// checkers).
    pub fn tag_struct(&mut self, value: ValueId, name: &str, size: u64) {
        self.module.values_mut()[value.0 as usize].pointee_struct = Some(StructRef {
            name: Rc::from(name),
            size,
        });
    }

    /// Mark a value as having pointer type.
    pub fn mark_pointer(&mut self, value: ValueId) {
        self.module.values_mut()[value.0 as usize].is_pointer = true;
    }

    fn push_inst(&mut self, kind: InstKind, produces: Option<bool>) -> (InstId, Option<ValueId>) {
        let func = self.current_func.expect("no function in progress");
        let block = self.current_block.expect("no block in progress");
        let id = InstId(self.module.insts_mut().len() as u32);
        let result = produces.map(|is_pointer| {
            self.push_value(ValueInfo {
                kind: ValueKind::Inst(id),
                is_pointer,
                pointee_struct: None,
            })
        });
        self.module.insts_mut().push(Instruction {
            kind,
            func,
            block,
            result,
            loc: self.current_loc.clone(),
        });
        self.module.functions_mut()[func.0 as usize].blocks[block.0 as usize]
            .insts
            .push(id);
        (id, result)
    }

    /// Stack allocation; the result is a pointer and an allocation site.
    pub fn alloca(&mut self) -> ValueId {
        self.push_inst(InstKind::Alloca, Some(true)).1.unwrap()
    }

    /// Store `size` bytes of `value` through `ptr`.
    pub fn store(&mut self, value: ValueId, ptr: ValueId, size: u64) -> InstId {
        self.push_inst(InstKind::Store { value, ptr, size }, None).0
    }

    /// Load through `ptr`; `is_pointer` records the result's static type.
    pub fn load(&mut self, ptr: ValueId, is_pointer: bool) -> ValueId {
        self.push_inst(InstKind::Load { ptr }, Some(is_pointer))
            .1
            .unwrap()
    }

    /// Derive a pointer from `base`.
    pub fn gep(&mut self, base: ValueId) -> ValueId {
        self.push_inst(InstKind::Gep { base }, Some(true)).1.unwrap()
    }

    /// Direct call. The result value is a pointer when the callee is known
    /// to hand back one (allocators); callers can re-mark with
    /// [`ModuleBuilder::mark_pointer`].
    pub fn call(&mut self, callee: FuncId, args: &[ValueId]) -> (InstId, ValueId) {
        let returns_ptr = {
            let name = self.module.function(callee).name.as_str();
            matches!(
                name,
                "mmap"
                    | "mmap64"
                    | "malloc"
                    | super::intrinsic_names::ALLOC_PMEM
                    | super::intrinsic_names::MARK_PERSISTENT
            )
        };
        let (id, result) = self.push_inst(
            InstKind::Call {
                callee: Callee::Direct(callee),
                args: SmallVec::from_slice(args),
            },
            Some(returns_ptr),
        );
        (id, result.unwrap())
    }

    /// Call through a function pointer.
    pub fn call_indirect(&mut self, target: ValueId, args: &[ValueId]) -> (InstId, ValueId) {
        let (id, result) = self.push_inst(
            InstKind::Call {
                callee: Callee::Indirect(target),
                args: SmallVec::from_slice(args),
            },
            Some(false),
        );
        (id, result.unwrap())
    }

    /// Flush the cache line covering `ptr`.
    pub fn flush(&mut self, ptr: ValueId) -> InstId {
        self.push_inst(InstKind::Flush { ptr }, None).0
    }

    /// Store barrier.
    pub fn fence(&mut self) -> InstId {
        self.push_inst(InstKind::Fence, None).0
    }

    /// Return.
    pub fn ret(&mut self, value: Option<ValueId>) -> InstId {
        self.push_inst(InstKind::Ret { value }, None).0
    }

    /// Branch to `targets` (one unconditional, two conditional).
    pub fn br(&mut self, targets: &[BlockId]) -> InstId {
        self.push_inst(
            InstKind::Br {
                targets: SmallVec::from_slice(targets),
            },
            None,
        )
        .0
    }

    /// Uninterpreted instruction.
    pub fn nop(&mut self) -> InstId {
        self.push_inst(InstKind::Nop, None).0
    }

    /// Finalize: compute CFG edges and hand back the module.
    pub fn finish(mut self) -> Module {
        let func_count = self.module.functions_mut().len();
        for f in 0..func_count {
            // Successors come from block terminators; everything else ends
            // the path (ret, or a fall-off block in a straight-line harness).
            let mut edges: Vec<(BlockId, BlockId)> = Vec::new();
            {
                let module = &self.module;
                let func = module.function(FuncId(f as u32));
                for (bi, block) in func.blocks.iter().enumerate() {
                    if let Some(&last) = block.insts.last() {
                        if let InstKind::Br { targets } = &module.inst(last).kind {
                            for &t in targets {
                                edges.push((BlockId(bi as u32), t));
                            }
                        }
                    }
                }
            }
            let blocks = &mut self.module.functions_mut()[f].blocks;
            for (from, to) in edges {
                blocks[from.0 as usize].succs.push(to);
                blocks[to.0 as usize].preds.push(from);
            }
        }
        self.module
    }
}
