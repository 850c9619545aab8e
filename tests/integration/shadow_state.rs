//! End-to-end shadow-state scenarios: store/flush/fence sequences and the
//! bugs they must (or must not) produce.

use std::rc::Rc;

use umbra::config::Config;
use umbra::expr::{Array, Expr, UpdateList, Width};
use umbra::heuristic::NoneHeuristic;
use umbra::ir::{InstId, Module, ModuleBuilder};
use umbra::runtime::PmemRuntime;
use umbra::state::ExecutionState;
use umbra::BugKind;

/// A tiny harness: one store, one flush, one fence, with source positions
/// so reports have something to point at.
struct Harness {
    module: Rc<Module>,
    main: umbra::ir::FuncId,
    store: InstId,
    flush: InstId,
    fence: InstId,
}

fn harness() -> Harness {
    let mut b = ModuleBuilder::new();
    let main = b.begin_function("main", &[]);
    let slot = b.alloca();
    let one = b.constant(1);
    b.set_loc("harness.c", 10);
    let store = b.store(one, slot, 1);
    b.set_loc("harness.c", 11);
    let flush = b.flush(slot);
    b.set_loc("harness.c", 12);
    let fence = b.fence();
    b.ret(None);
    Harness {
        module: Rc::new(b.finish()),
        main,
        store,
        flush,
        fence,
    }
}

fn fresh(h: &Harness) -> (PmemRuntime, ExecutionState, u64) {
    let mut rt = PmemRuntime::new(Config::default(), h.module.clone());
    let mut state = ExecutionState::new(0, h.main, 64, Box::new(NoneHeuristic));
    let base = rt.alloc_pmem(&mut state, 128, "pm").expect("allocation");
    (rt, state, base)
}

#[test]
fn clean_flush_reports_nothing() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    rt.store(&mut state, h.store, base + 10, 10);
    rt.fence(&mut state, h.fence);
    rt.flush(&mut state, h.flush, base);
    rt.fence(&mut state, h.fence);

    assert!(state.epoch_model.is_persisted(base + 10, 10));
    rt.on_exit(&mut state);
    assert_eq!(rt.registry.unique_bugs(), 0);
    assert_eq!(rt.exit_code(), 0);
}

#[test]
fn double_flush_of_one_line_is_one_unnecessary_flush() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    rt.store(&mut state, h.store, base + 10, 1);
    rt.store(&mut state, h.store, base + 11, 1);
    rt.flush(&mut state, h.flush, base + 10);
    rt.flush(&mut state, h.flush, base + 11);
    rt.fence(&mut state, h.fence);

    assert!(state.epoch_model.is_persisted(base + 10, 2));
    rt.on_exit(&mut state);
    assert_eq!(rt.registry.unique_bugs(), 1);
    let id = (1..=10)
        .find(|&i| rt.registry.reason_of(i) == Some(BugKind::UnnecessaryFlush))
        .expect("an unnecessary-flush bug");
    assert!(rt.registry.location_text(id).unwrap().contains("flush"));
}

#[test]
fn flush_of_untouched_line_is_flush_on_unmodified() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    rt.flush(&mut state, h.flush, base);
    rt.fence(&mut state, h.fence);

    rt.on_exit(&mut state);
    assert_eq!(rt.registry.unique_bugs(), 1);
    let id = (1..=10)
        .find(|&i| rt.registry.reason_of(i) == Some(BugKind::FlushOnUnmodified))
        .expect("a flush-on-unmodified bug");
    assert!(rt.registry.location_text(id).is_some());
    assert_eq!(rt.exit_code(), 1);
}

#[test]
fn ordered_writes_answer_directionally() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    rt.store(&mut state, h.store, base, 64);
    rt.flush(&mut state, h.flush, base);
    rt.fence(&mut state, h.fence);
    rt.store(&mut state, h.store, base + 64, 64);
    rt.flush(&mut state, h.flush, base + 64);
    rt.fence(&mut state, h.fence);

    assert!(rt.check_ordered_before(&mut state, base, 64, base + 64, 64));
    assert!(!rt.check_ordered_before(&mut state, base + 64, 64, base, 64));
    // The failed direction left a violation behind.
    assert_eq!(rt.violations.len(), 1);
    assert_eq!(rt.exit_code(), 1);
}

#[test]
fn unpersisted_write_surfaces_at_exit() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    rt.store(&mut state, h.store, base, 1);
    rt.on_exit(&mut state);

    assert_eq!(rt.registry.unique_bugs(), 1);
    let text = rt.registry.location_text(1).unwrap();
    assert!(text.contains("harness.c"));
    assert!(text.contains("Line: 10"));
    assert_eq!(rt.registry.reason_of(1), Some(BugKind::Unpersisted));
    assert_eq!(rt.exit_code(), 1);
}

#[test]
fn flush_without_fence_is_still_unpersisted() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    rt.store(&mut state, h.store, base, 1);
    rt.flush(&mut state, h.flush, base);
    // No fence: the flush may still be sitting in a queue at power loss.
    rt.on_exit(&mut state);

    assert!(rt.registry.has_bugs());
    // Both the flush (the latest touch) and the masked store count.
    assert_eq!(rt.registry.unique_bugs(), 2);
}

#[test]
fn symbolic_offset_leak_blames_the_store() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    // A store to pm[s] with s unconstrained in [0, 128).
    let s_array = Array::symbolic("s", 1, Width::W32, 128);
    let s = Expr::zext(
        Expr::read(UpdateList::new(s_array), Expr::constant(0, Width::W32)),
        Width::W64,
    );
    rt.store_symbolic(&mut state, h.store, base, &s);

    rt.flush(&mut state, h.flush, base); // line 0 only
    rt.fence(&mut state, h.fence);

    let obj = state.object_at(base).unwrap();
    assert!(!obj.must_be_persisted(rt.solver(), &state.constraints));

    rt.on_exit(&mut state);
    assert!(rt.registry.has_bugs());
    let store_id = (1..=10)
        .find(|&i| {
            rt.registry
                .location_text(i)
                .is_some_and(|t| t.contains("Line: 10"))
        })
        .expect("store location registered");
    assert_eq!(rt.registry.reason_of(store_id), Some(BugKind::Unpersisted));
}

#[test]
fn check_persisted_reports_then_quiesces() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    rt.store(&mut state, h.store, base, 1);
    let marked = rt.check_persisted(&mut state, base, 64);
    assert_eq!(marked.len(), 1);
    assert_eq!(rt.registry.unique_bugs(), 1);

    // The check resets the object: exit reports nothing new.
    rt.on_exit(&mut state);
    assert_eq!(rt.registry.unique_bugs(), 1);
    assert_eq!(rt.registry.total_occurrences(), 1);
}

#[test]
fn check_persisted_on_volatile_memory_kills_the_path() {
    let h = harness();
    let (mut rt, mut state, _base) = fresh(&h);

    rt.check_persisted(&mut state, 0x42, 8);
    assert!(!state.is_live());
}

#[test]
fn alloc_size_must_be_line_multiple() {
    let h = harness();
    let mut rt = PmemRuntime::new(Config::default(), h.module.clone());
    let mut state = ExecutionState::new(0, h.main, 64, Box::new(NoneHeuristic));
    assert!(rt.alloc_pmem(&mut state, 100, "odd").is_none());
    assert!(!state.is_live());
}

#[test]
fn forked_states_do_not_share_shadow_dirt() {
    let h = harness();
    let (mut rt, mut state, base) = fresh(&h);

    let mut child = state.fork(1);
    rt.store(&mut child, h.store, base, 1);

    rt.on_exit(&mut state);
    assert_eq!(rt.registry.unique_bugs(), 0);
    rt.on_exit(&mut child);
    assert_eq!(rt.registry.unique_bugs(), 1);
}

#[test]
fn is_pmem_is_byte_accurate() {
    let h = harness();
    let (rt, state, base) = fresh(&h);
    assert!(rt.is_pmem(&state, base, 128));
    assert!(!rt.is_pmem(&state, base, 129));
    assert!(!rt.is_pmem(&state, base - 1, 4));
    assert!(rt.is_pmem(&state, base + 999, 0));
}
