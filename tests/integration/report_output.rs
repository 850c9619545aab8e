//! Report rendering: the text dump, the CSV dump, and the exit status.

use std::io::Read;
use std::rc::Rc;

use umbra::config::Config;
use umbra::heuristic::NoneHeuristic;
use umbra::ir::{InstId, Module, ModuleBuilder};
use umbra::runtime::PmemRuntime;
use umbra::state::ExecutionState;

struct Scenario {
    rt: PmemRuntime,
}

/// Produce a run with one unpersisted store (in a nested call) and one
/// unnecessary flush.
fn buggy_run() -> Scenario {
    let mut b = ModuleBuilder::new();
    let helper = b.begin_function("write_record", &[true]);
    let p = b.param(helper, 0);
    let one = b.constant(1);
    b.set_loc("records.c", 21);
    let store: InstId = b.store(one, p, 1);
    b.ret(None);

    b.begin_function("main", &[]);
    b.set_loc("main.c", 7);
    let (call, _) = b.call(helper, &[p]);
    b.set_loc("main.c", 9);
    let flush = b.flush(p);
    b.set_loc("main.c", 10);
    let fence = b.fence();
    b.ret(None);
    let module: Rc<Module> = Rc::new(b.finish());

    let main = module.function_named("main").unwrap();
    let mut rt = PmemRuntime::new(Config::default(), module);
    let mut state = ExecutionState::new(0, main, 64, Box::new(NoneHeuristic));
    let base = rt.alloc_pmem(&mut state, 128, "records").unwrap();

    // The store happens inside the helper frame.
    state.push_frame(helper, call);
    rt.store(&mut state, store, base, 1);
    state.pop_frame();

    // A fence without a flush persists nothing; the later flush inherits
    // the store as a masked cause and never gets fenced itself.
    rt.fence(&mut state, fence);
    rt.flush(&mut state, flush, base);

    // And a flush of a line nothing ever wrote.
    rt.flush(&mut state, flush, base + 64);

    rt.on_exit(&mut state);
    rt.finish();
    Scenario { rt }
}

#[test]
fn text_report_names_locations_and_masking() {
    let scenario = buggy_run();
    let mut buf = Vec::new();
    scenario.rt.registry.dump_text(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();

    assert!(text.contains("unique bugs"));
    assert!(text.contains("flush (never modified)"));
    assert!(text.contains("main.c"));
    assert!(text.contains("write_record"));
}

#[test]
fn csv_report_has_one_row_per_bug_and_frame_groups() {
    let scenario = buggy_run();
    let mut buf = Vec::new();
    scenario.rt.registry.dump_csv(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();

    let lines: Vec<&str> = text.lines().collect();
    let header = lines[0];
    assert!(header.starts_with("ID,Type,Occurrences"));
    assert!(header.contains("StackFrame0_Function"));
    // Deepest stack had two frames.
    assert!(header.contains("StackFrame1_Function"));

    let width = header.split(',').count();
    assert_eq!(lines.len() as u64, 1 + scenario.rt.registry.unique_bugs());
    for row in &lines[1..] {
        assert_eq!(row.split(',').count(), width, "row: {row}");
    }
    assert!(text.contains("write_record"));
}

#[test]
fn csv_report_writes_to_files() {
    let scenario = buggy_run();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    scenario.rt.registry.dump_csv(file.as_file_mut()).unwrap();

    let mut contents = String::new();
    file.reopen().unwrap().read_to_string(&mut contents).unwrap();
    assert!(contents.starts_with("ID,Type,Occurrences"));
}

#[test]
fn exit_code_reflects_bugs() {
    let scenario = buggy_run();
    assert!(scenario.rt.registry.has_bugs());
    assert_eq!(scenario.rt.exit_code(), 1);

    // A clean run exits zero.
    let mut b = ModuleBuilder::new();
    let main = b.begin_function("main", &[]);
    let one = b.constant(1);
    let slot = b.alloca();
    let store = b.store(one, slot, 1);
    let flush = b.flush(slot);
    let fence = b.fence();
    b.ret(None);
    let module = Rc::new(b.finish());

    let mut rt = PmemRuntime::new(Config::default(), module);
    let mut state = ExecutionState::new(0, main, 64, Box::new(NoneHeuristic));
    let base = rt.alloc_pmem(&mut state, 64, "clean").unwrap();
    rt.store(&mut state, store, base, 1);
    rt.flush(&mut state, flush, base);
    rt.fence(&mut state, fence);
    rt.on_exit(&mut state);
    assert_eq!(rt.exit_code(), 0);
}
