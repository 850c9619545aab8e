//! Filters marker-typed fields out of persistence tracking.
//!
//! Programs sometimes keep scratch data (locks, caches) inside a persistent
//! object on purpose. Fields typed with a configured marker struct
//! (`ignore-struct`, default `volatile_byte`) are registered as ignored
//! offsets on the owning object, and later persistence queries skip them.

use smallvec::SmallVec;

use crate::ir::{InstKind, ValueId};

use super::{CheckCtx, Checker};

/// The volatile-filter plugin.
#[derive(Debug, Default)]
pub struct VolatileFilter;

impl Checker for VolatileFilter {
    fn name(&self) -> &'static str {
        "volatile-filter"
    }

    fn after_instruction(&mut self, cx: &mut CheckCtx<'_>) {
        let inst = cx.module.inst(cx.inst);
        let operands: SmallVec<[ValueId; 4]> = match &inst.kind {
            InstKind::Store { value, ptr, .. } => SmallVec::from_slice(&[*value, *ptr]),
            InstKind::Load { ptr } => SmallVec::from_slice(&[*ptr]),
            InstKind::Gep { base } => SmallVec::from_slice(&[*base]),
            InstKind::Call { args, .. } => args.clone(),
            InstKind::Flush { ptr } => SmallVec::from_slice(&[*ptr]),
            _ => return,
        };

        for op in operands {
            let Some(st) = cx.module.value(op).pointee_struct.clone() else {
                continue;
            };
            if !cx.config.ignore_structs.iter().any(|n| **n == *st.name) {
                continue;
            }
            let Some(addr) = cx.operand_value(op).and_then(|e| e.as_const()) else {
                continue;
            };
            let Some(obj) = cx.state.object_at_mut(addr) else {
                continue;
            };
            let offset = addr - obj.info().base;
            obj.add_ignore_offset(offset, st.size);
        }
    }
}
