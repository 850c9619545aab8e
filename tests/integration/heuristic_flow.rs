//! Heuristic stack end to end: points-to discovery, weights, priorities,
//! and searcher-driven state selection.

use std::rc::Rc;

use umbra::analysis::{find_nvm_allocation_sites, AndersenAnalysis, CachedPointsTo};
use umbra::config::{Config, HeuristicType, SearchFallback};
use umbra::heuristic::{self, NvmValueDesc};
use umbra::ir::{FuncId, InstId, InstKind, Module, ModuleBuilder};
use umbra::runtime::PmemRuntime;
use umbra::searcher::PrioritySearcher;
use umbra::state::ExecutionState;

/// mmap-backed persistent region, a helper that persists through it, and a
/// helper that only computes.
fn program() -> (Rc<Module>, FuncId, FuncId, FuncId) {
    let mut b = ModuleBuilder::new();
    let mmap = b.declare("mmap", 6);

    let persist = b.begin_function("persist_field", &[true]);
    let p = b.param(persist, 0);
    let one = b.constant(1);
    b.store(one, p, 8);
    b.flush(p);
    b.fence();
    b.ret(None);

    let compute = b.begin_function("compute", &[true]);
    let q = b.param(compute, 0);
    let v = b.load(q, false);
    b.nop();
    b.ret(Some(v));

    let main = b.begin_function("main", &[]);
    let zero = b.constant(0);
    let fd = b.constant(3);
    let (_, region) = b.call(mmap, &[zero, zero, zero, zero, fd, zero]);
    let scratch = b.alloca();
    b.call(persist, &[region]);
    b.call(compute, &[scratch]);
    b.ret(None);

    (Rc::new(b.finish()), main, persist, compute)
}

fn points_to(module: &Rc<Module>) -> Rc<CachedPointsTo> {
    Rc::new(CachedPointsTo::new(Rc::new(AndersenAnalysis::build(module))))
}

#[test]
fn allocation_sites_found_statically() {
    let (module, main, _, _) = program();
    let sites = find_nvm_allocation_sites(&module);
    assert_eq!(sites.len(), 1);

    let mmap_result = module
        .insts_of(main)
        .find(|&i| module.direct_callee(i).is_some())
        .and_then(|i| module.inst(i).result)
        .unwrap();
    assert!(sites.contains(&mmap_result));
}

#[test]
fn value_descriptor_separates_pmem_from_scratch() {
    let (module, _, persist, compute) = program();
    let desc = NvmValueDesc::static_state(&module, points_to(&module));

    let pm_param = module.function(persist).params[0];
    let scratch_param = module.function(compute).params[0];
    assert!(desc.is_nvm(pm_param));
    assert!(!desc.is_nvm(scratch_param));
}

#[test]
fn static_heuristic_prefers_the_persisting_callee() {
    let (module, main, persist, compute) = program();
    let h = heuristic::build(
        HeuristicType::Static,
        module.clone(),
        points_to(&module),
        main,
    );
    assert_eq!(h.name(), "static");
    // Entry of main sees all the downstream NVM work.
    assert!(h.current_priority() > 0);

    let call_weight = |callee: FuncId| -> u64 {
        // Weight surfaces indirectly: build a fresh heuristic at the
        // callee and read its entry priority.
        let hc = heuristic::build(
            HeuristicType::Static,
            module.clone(),
            points_to(&module),
            callee,
        );
        hc.current_priority()
    };
    assert!(call_weight(persist) > call_weight(compute));
}

#[test]
fn context_heuristic_follows_execution() {
    let (module, main, persist, _) = program();
    let mut h = heuristic::build(
        HeuristicType::ContextDynamic,
        module.clone(),
        points_to(&module),
        main,
    );

    let main_insts: Vec<InstId> = module.insts_of(main).collect();
    let persist_entry = module.entry_inst(persist).unwrap();
    let entry_priority = h.current_priority();
    assert!(entry_priority > 0);

    // mmap call -> alloca -> call persist -> inside persist.
    h.step(main_insts[0], Some(main_insts[1]));
    h.step(main_insts[1], Some(main_insts[2]));
    h.step(main_insts[2], Some(persist_entry));
    // Inside the callee the store/flush/fence are still ahead.
    assert!(h.current_priority() >= 3);
}

#[test]
fn insensitive_heuristic_reacts_to_resolution() {
    let (module, main, persist, _) = program();
    let mut h = heuristic::build(
        HeuristicType::InsensitiveDynamic,
        module.clone(),
        points_to(&module),
        main,
    );

    // Sit on the callee's first instruction: before the mmap resolves,
    // the store/flush/fence ahead carry no weight.
    let persist_entry = module.entry_inst(persist).unwrap();
    h.step(module.entry_inst(main).unwrap(), Some(persist_entry));
    let cold = h.current_priority();

    let region = module
        .insts_of(main)
        .find(|&i| module.direct_callee(i).is_some())
        .and_then(|i| module.inst(i).result)
        .unwrap();
    h.update_value(region, true);
    assert!(h.current_priority() > cold);
}

#[test]
fn searcher_runs_high_priority_state_first() {
    let (module, main, _, _) = program();
    let pts = points_to(&module);

    let make_state = |id: u64, ty: HeuristicType| {
        ExecutionState::new(
            id,
            main,
            64,
            heuristic::build(ty, module.clone(), pts.clone(), main),
        )
    };

    // One guided state, one flat state.
    let guided = make_state(1, HeuristicType::Static);
    let flat = make_state(2, HeuristicType::None);

    let mut searcher = PrioritySearcher::new(SearchFallback::Dfs);
    searcher.add_initial(&flat);
    searcher.add_forked(&flat, &guided);
    assert_eq!(searcher.select(), Some(1));
    searcher.remove(1);
    assert_eq!(searcher.select(), Some(2));
    searcher.remove(2);
    assert!(searcher.is_empty());
}

#[test]
fn runtime_step_updates_context_heuristic() {
    let (module, main, persist, _) = program();
    let mut rt = PmemRuntime::new(Config::default(), module.clone());
    let mut state = ExecutionState::new(
        0,
        main,
        64,
        heuristic::build(
            HeuristicType::ContextDynamic,
            module.clone(),
            points_to(&module),
            main,
        ),
    );

    let main_insts: Vec<InstId> = module.insts_of(main).collect();
    let persist_insts: Vec<InstId> = module.insts_of(persist).collect();

    // Drive main up to the persist call, then into the callee.
    rt.step(&mut state, main_insts[0], Some(main_insts[1]));
    rt.step(&mut state, main_insts[1], Some(main_insts[2]));
    rt.step(&mut state, main_insts[2], Some(persist_insts[0]));
    let inside = state.heuristic.current_priority();
    assert!(inside > 0);

    // Walking the callee body consumes its priority.
    for (i, &inst) in persist_insts.iter().enumerate() {
        let next = persist_insts.get(i + 1).copied();
        if matches!(module.inst(inst).kind, InstKind::Ret { .. }) {
            break;
        }
        rt.step(&mut state, inst, next);
    }
    assert!(state.heuristic.current_priority() < inside);
}
