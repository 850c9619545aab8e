//! Checker-plugin behavior: transaction discipline and volatile filtering,
//! driven through the miniature engine step.

use std::rc::Rc;

use umbra::checker::tx::{TX_ADD, TX_BEGIN, TX_END};
use umbra::checker::ViolationKind;
use umbra::config::Config;
use umbra::expr::{Expr, Width};
use umbra::heuristic::NoneHeuristic;
use umbra::ir::{InstId, Module, ModuleBuilder};
use umbra::runtime::PmemRuntime;
use umbra::state::ExecutionState;

fn run_all(rt: &mut PmemRuntime, state: &mut ExecutionState, insts: &[InstId]) {
    for (i, &inst) in insts.iter().enumerate() {
        let next = insts.get(i + 1).copied();
        rt.step(state, inst, next);
    }
}

fn new_state(rt: &mut PmemRuntime, module: &Module) -> (ExecutionState, u64) {
    let main = module.function_named("main").unwrap();
    let mut state = ExecutionState::new(0, main, 64, Box::new(NoneHeuristic));
    let base = rt.alloc_pmem(&mut state, 256, "pool").unwrap();
    (state, base)
}

#[test]
fn overlapping_tx_adds_are_reported() {
    let mut b = ModuleBuilder::new();
    let tx_begin = b.declare(TX_BEGIN, 0);
    let tx_add = b.declare(TX_ADD, 2);
    let tx_end = b.declare(TX_END, 0);
    b.begin_function("main", &[]);
    let (begin, _) = b.call(tx_begin, &[]);
    let p1 = b.alloca();
    let sz = b.constant(32);
    let (add1, _) = b.call(tx_add, &[p1, sz]);
    let p2 = b.alloca();
    let (add2, _) = b.call(tx_add, &[p2, sz]);
    let (end, _) = b.call(tx_end, &[]);
    let ret = b.ret(None);
    let module = Rc::new(b.finish());

    let mut rt = PmemRuntime::new(Config::default(), module.clone());
    let (mut state, base) = new_state(&mut rt, &module);
    // Both adds cover overlapping concrete ranges.
    state.bind(p1, Expr::constant(base, Width::W64));
    state.bind(p2, Expr::constant(base + 16, Width::W64));

    run_all(&mut rt, &mut state, &[begin, add1, add2, end, ret]);

    assert_eq!(rt.violations.len(), 1);
    assert_eq!(rt.violations[0].kind, ViolationKind::TxOverlap);
    assert!(!state.is_live());
    assert_eq!(rt.exit_code(), 1);
}

#[test]
fn disjoint_tx_adds_pass() {
    let mut b = ModuleBuilder::new();
    let tx_begin = b.declare(TX_BEGIN, 0);
    let tx_add = b.declare(TX_ADD, 2);
    let tx_end = b.declare(TX_END, 0);
    b.begin_function("main", &[]);
    let (begin, _) = b.call(tx_begin, &[]);
    let p1 = b.alloca();
    let sz = b.constant(16);
    let (add1, _) = b.call(tx_add, &[p1, sz]);
    let p2 = b.alloca();
    let (add2, _) = b.call(tx_add, &[p2, sz]);
    let (end, _) = b.call(tx_end, &[]);
    let ret = b.ret(None);
    let module = Rc::new(b.finish());

    let mut rt = PmemRuntime::new(Config::default(), module.clone());
    let (mut state, base) = new_state(&mut rt, &module);
    state.bind(p1, Expr::constant(base, Width::W64));
    state.bind(p2, Expr::constant(base + 64, Width::W64));

    run_all(&mut rt, &mut state, &[begin, add1, add2, end, ret]);
    assert!(rt.violations.is_empty());
    assert!(state.is_live());
}

#[test]
fn store_to_protected_struct_outside_tx_warns() {
    let mut b = ModuleBuilder::new();
    b.begin_function("main", &[]);
    let root = b.alloca();
    b.tag_struct(root, "map_root", 64);
    // Touch the protected pointer once so the checker learns its range,
    // then store through it with no transaction open.
    let probe = b.gep(root);
    let one = b.constant(1);
    let store = b.store(one, root, 8);
    let ret = b.ret(None);
    let module = Rc::new(b.finish());

    let mut config = Config::default();
    config.tx_structs = vec!["map_root".to_string()];
    let mut rt = PmemRuntime::new(config, module.clone());
    let (mut state, base) = new_state(&mut rt, &module);
    state.bind(root, Expr::constant(base, Width::W64));

    let probe_inst = module.inst_ids().find(|&i| {
        matches!(module.inst(i).kind, umbra::ir::InstKind::Gep { .. })
    });
    run_all(
        &mut rt,
        &mut state,
        &[probe_inst.unwrap(), store, ret],
    );

    assert_eq!(rt.violations.len(), 1);
    assert_eq!(rt.violations[0].kind, ViolationKind::NonTransactionalUpdate);
    // A warning, not a path killer.
    assert!(state.is_live());
    let _ = probe;
}

#[test]
fn store_inside_tx_with_added_range_passes() {
    let mut b = ModuleBuilder::new();
    let tx_begin = b.declare(TX_BEGIN, 0);
    let tx_add = b.declare(TX_ADD, 2);
    b.begin_function("main", &[]);
    let root = b.alloca();
    b.tag_struct(root, "map_root", 64);
    let probe = b.gep(root);
    let (begin, _) = b.call(tx_begin, &[]);
    let sz = b.constant(64);
    let (add, _) = b.call(tx_add, &[root, sz]);
    let one = b.constant(1);
    let store = b.store(one, root, 8);
    let ret = b.ret(None);
    let module = Rc::new(b.finish());

    let mut config = Config::default();
    config.tx_structs = vec!["map_root".to_string()];
    let mut rt = PmemRuntime::new(config, module.clone());
    let (mut state, base) = new_state(&mut rt, &module);
    state.bind(root, Expr::constant(base, Width::W64));

    let probe_inst = module
        .inst_ids()
        .find(|&i| matches!(module.inst(i).kind, umbra::ir::InstKind::Gep { .. }))
        .unwrap();
    run_all(&mut rt, &mut state, &[probe_inst, begin, add, store, ret]);

    assert!(rt.violations.is_empty());
    let _ = probe;
}

#[test]
fn volatile_marked_field_is_filtered_from_persistence() {
    let mut b = ModuleBuilder::new();
    b.begin_function("main", &[]);
    let field = b.alloca();
    b.tag_struct(field, "volatile_byte", 8);
    let probe = b.gep(field);
    let one = b.constant(1);
    let store = b.store(one, field, 8);
    let ret = b.ret(None);
    let module = Rc::new(b.finish());

    let mut rt = PmemRuntime::new(Config::default(), module.clone());
    let (mut state, base) = new_state(&mut rt, &module);
    // The marker field lives at offset 64 inside the pool.
    state.bind(field, Expr::constant(base + 64, Width::W64));

    let probe_inst = module
        .inst_ids()
        .find(|&i| matches!(module.inst(i).kind, umbra::ir::InstKind::Gep { .. }))
        .unwrap();
    run_all(&mut rt, &mut state, &[probe_inst, store, ret]);

    // The store went to an ignored range: nothing to report at exit.
    rt.on_exit(&mut state);
    assert_eq!(rt.registry.unique_bugs(), 0);
    assert_eq!(rt.exit_code(), 0);
    let _ = probe;
}

#[test]
fn unmarked_store_still_reports() {
    let mut b = ModuleBuilder::new();
    b.begin_function("main", &[]);
    let field = b.alloca();
    let one = b.constant(1);
    let store = b.store(one, field, 8);
    let ret = b.ret(None);
    let module = Rc::new(b.finish());

    let mut rt = PmemRuntime::new(Config::default(), module.clone());
    let (mut state, base) = new_state(&mut rt, &module);
    state.bind(field, Expr::constant(base + 64, Width::W64));

    run_all(&mut rt, &mut state, &[store, ret]);
    rt.on_exit(&mut state);
    assert_eq!(rt.registry.unique_bugs(), 1);
}

#[test]
fn intrinsic_calls_flow_through_step() {
    let mut b = ModuleBuilder::new();
    let alloc = b.declare(umbra::ir::intrinsic_names::ALLOC_PMEM, 2);
    let check = b.declare(umbra::ir::intrinsic_names::CHECK_PERSISTED, 2);
    b.begin_function("main", &[]);
    let size = b.constant(128);
    let zero = b.constant(0);
    let (alloc_call, region) = b.call(alloc, &[size, zero]);
    let one = b.constant(1);
    let store = b.store(one, region, 1);
    let (check_call, _) = b.call(check, &[region, size]);
    let ret = b.ret(None);
    let module = Rc::new(b.finish());

    let mut rt = PmemRuntime::new(Config::default(), module.clone());
    let main = module.function_named("main").unwrap();
    let mut state = ExecutionState::new(0, main, 64, Box::new(NoneHeuristic));

    rt.step(&mut state, alloc_call, Some(store));
    let region_base = state.value_of(region).and_then(|e| e.as_const());
    assert!(region_base.is_some());

    rt.step(&mut state, store, Some(check_call));
    rt.step(&mut state, check_call, Some(ret));
    // check_persisted found the unflushed store.
    assert_eq!(rt.registry.unique_bugs(), 1);

    rt.step(&mut state, ret, None);
    rt.on_exit(&mut state);
    // Quiesced by the check: no double report.
    assert_eq!(rt.registry.unique_bugs(), 1);
    rt.finish();
}
