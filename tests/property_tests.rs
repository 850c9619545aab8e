//! Property tests: the symbolic shadow model and the concrete epoch model
//! must agree on persistence, and the registry's masking relation must stay
//! a strict partial order, over arbitrary operation sequences.

use std::rc::Rc;

use proptest::prelude::*;

use umbra::config::Config;
use umbra::heuristic::NoneHeuristic;
use umbra::ir::{InstId, ModuleBuilder};
use umbra::pmem::shadow::{ObjectInfo, PersistentState};
use umbra::pmem::AddrRange;
use umbra::runtime::PmemRuntime;
use umbra::solver::EnumSolver;
use umbra::state::ExecutionState;
use umbra::{PersistentMemoryState, EPOCH_INF};

const OBJ_SIZE: u64 = 256;
const CACHE_LINE: u64 = 64;

#[derive(Debug, Clone)]
enum Op {
    Store { offset: u64, len: u64 },
    Flush { offset: u64 },
    Fence,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..OBJ_SIZE, 1..32u64).prop_map(|(offset, len)| {
            let len = len.min(OBJ_SIZE - offset);
            Op::Store { offset, len }
        }),
        (0..OBJ_SIZE).prop_map(|offset| Op::Flush { offset }),
        Just(Op::Fence),
    ]
}

/// Apply one op to both models. Returns whether it was a store.
fn apply(shadow: &mut PersistentState, epoch: &mut PersistentMemoryState, op: &Op) -> bool {
    match *op {
        Op::Store { offset, len } => {
            epoch.store(offset, len);
            for line_start in AddrRange::sized(offset, len).cache_lines(CACHE_LINE) {
                shadow.write8_at(1, line_start.min(OBJ_SIZE - 1));
            }
            true
        }
        Op::Flush { offset } => {
            epoch.flush(offset);
            shadow.flush_at(
                2,
                &umbra::expr::Expr::constant(offset, umbra::expr::Width::W64),
            );
            false
        }
        Op::Fence => {
            epoch.fence();
            shadow.commit_pending(3);
            false
        }
    }
}

fn fresh_shadow() -> PersistentState {
    PersistentState::new(
        ObjectInfo {
            name: "prop".to_string(),
            base: 0,
            size: OBJ_SIZE,
        },
        CACHE_LINE,
    )
}

proptest! {
    /// The solver-backed shadow answer and the concrete epoch answer
    /// coincide on "is everything persisted".
    #[test]
    fn prop_models_agree_on_full_persistence(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut shadow = fresh_shadow();
        let mut epoch = PersistentMemoryState::new(CACHE_LINE);
        let solver = EnumSolver::new(1 << 20);

        let mut any_store = false;
        for op in &ops {
            any_store |= apply(&mut shadow, &mut epoch, op);
        }
        prop_assume!(any_store);

        let shadow_answer = shadow.must_be_persisted(&solver, &[]);
        let epoch_answer = epoch.is_persisted(0, OBJ_SIZE);
        prop_assert_eq!(shadow_answer, epoch_answer);
    }

    /// Flushing every line and fencing persists everything, whatever came
    /// before.
    #[test]
    fn prop_flush_all_then_fence_persists(ops in prop::collection::vec(arb_op(), 0..30)) {
        let mut shadow = fresh_shadow();
        let mut epoch = PersistentMemoryState::new(CACHE_LINE);
        let solver = EnumSolver::new(1 << 20);

        for op in &ops {
            apply(&mut shadow, &mut epoch, op);
        }
        for line in 0..(OBJ_SIZE / CACHE_LINE) {
            apply(&mut shadow, &mut epoch, &Op::Flush { offset: line * CACHE_LINE });
        }
        apply(&mut shadow, &mut epoch, &Op::Fence);

        prop_assert!(shadow.must_be_persisted(&solver, &[]));
        for (_, pi) in epoch.persist_intervals_in(0, OBJ_SIZE) {
            prop_assert!(pi.persist_epoch < epoch.epoch());
        }
    }

    /// mod_epoch never exceeds persist_epoch.
    #[test]
    fn prop_intervals_are_well_formed(ops in prop::collection::vec(arb_op(), 0..40)) {
        let mut shadow = fresh_shadow();
        let mut epoch = PersistentMemoryState::new(CACHE_LINE);
        for op in &ops {
            apply(&mut shadow, &mut epoch, op);
        }
        for (range, pi) in epoch.persist_intervals_in(0, OBJ_SIZE) {
            prop_assert!(pi.mod_epoch <= pi.persist_epoch, "{}: {}", range, pi);
            prop_assert!(pi.mod_epoch == EPOCH_INF || pi.mod_epoch <= epoch.epoch());
        }
    }

    /// Ordering is antisymmetric for non-empty ranges.
    #[test]
    fn prop_ordering_is_antisymmetric(
        ops in prop::collection::vec(arb_op(), 0..40),
        a in 0..OBJ_SIZE,
        b in 0..OBJ_SIZE,
    ) {
        let mut shadow = fresh_shadow();
        let mut epoch = PersistentMemoryState::new(CACHE_LINE);
        for op in &ops {
            apply(&mut shadow, &mut epoch, op);
        }
        let a_len = (OBJ_SIZE - a).min(16).max(1);
        let b_len = (OBJ_SIZE - b).min(16).max(1);
        let fwd = epoch.is_ordered_before(a, a_len, b, b_len);
        let bwd = epoch.is_ordered_before(b, b_len, a, a_len);
        prop_assert!(!(fwd && bwd));
    }

    /// Two fences with nothing in between never change the answer.
    #[test]
    fn prop_fence_is_idempotent_on_answers(ops in prop::collection::vec(arb_op(), 0..30)) {
        let mut shadow = fresh_shadow();
        let mut epoch = PersistentMemoryState::new(CACHE_LINE);
        let solver = EnumSolver::new(1 << 20);
        for op in &ops {
            apply(&mut shadow, &mut epoch, op);
        }
        apply(&mut shadow, &mut epoch, &Op::Fence);
        let shadow_before = shadow.must_be_persisted(&solver, &[]);
        let epoch_before = epoch.is_persisted(0, OBJ_SIZE);
        apply(&mut shadow, &mut epoch, &Op::Fence);
        prop_assert_eq!(shadow.must_be_persisted(&solver, &[]), shadow_before);
        prop_assert_eq!(epoch.is_persisted(0, OBJ_SIZE), epoch_before);
    }

    /// Masking stays a strict partial order and unique counts never exceed
    /// occurrences, across full runtime-driven runs.
    #[test]
    fn prop_registry_masking_is_strict(ops in prop::collection::vec(arb_op(), 1..25)) {
        let mut b = ModuleBuilder::new();
        let main = b.begin_function("main", &[]);
        let slot = b.alloca();
        let one = b.constant(1);
        let store: InstId = b.store(one, slot, 1);
        let flush: InstId = b.flush(slot);
        let fence: InstId = b.fence();
        b.ret(None);
        let module = Rc::new(b.finish());

        let mut rt = PmemRuntime::new(Config::default(), module);
        let mut state = ExecutionState::new(0, main, CACHE_LINE, Box::new(NoneHeuristic));
        let base = rt.alloc_pmem(&mut state, OBJ_SIZE, "prop").unwrap();

        for op in &ops {
            match *op {
                Op::Store { offset, len } => rt.store(&mut state, store, base + offset, len),
                Op::Flush { offset } => rt.flush(&mut state, flush, base + offset),
                Op::Fence => rt.fence(&mut state, fence),
            }
        }
        rt.on_exit(&mut state);

        for id in 1..=64u64 {
            for m in rt.registry.masked_of(id) {
                prop_assert!(m != id);
                prop_assert!(!rt.registry.masked_of(m).contains(&id));
            }
        }
        prop_assert!(rt.registry.unique_bugs() <= rt.registry.total_occurrences());
        let _ = &slot;
    }
}
