//! Reference-model semantics: epochs, persist intervals, ordering.

use umbra::{PersistInterval, PersistentMemoryState, EPOCH_INF};

fn store(state: &mut PersistentMemoryState, begin: u64, end: u64) {
    state.store(begin, end - begin);
}

#[test]
fn default_cache_line_is_64_bytes() {
    let state = PersistentMemoryState::default();
    assert_eq!(state.cache_line_size(), 64);
    assert_eq!(state.align_to_cache(130), 128);
}

#[test]
fn cache_line_size_is_configurable() {
    let state = PersistentMemoryState::new(10);
    assert_eq!(state.cache_line_size(), 10);
    assert_eq!(state.align_to_cache(25), 20);
}

#[test]
fn never_stored_range_is_not_persisted() {
    let state = PersistentMemoryState::default();
    assert!(!state.is_persisted(10, 20));
    assert_eq!(state.persist_interval_of(10, 20), PersistInterval::UNKNOWN);
}

#[test]
fn full_persistence_lifecycle() {
    let mut state = PersistentMemoryState::default();

    store(&mut state, 10, 30);
    assert!(!state.is_persisted(10, 20));
    assert_eq!(
        state.persist_interval_of(10, 20),
        PersistInterval {
            mod_epoch: 0,
            persist_epoch: EPOCH_INF
        }
    );

    // A fence alone does not persist.
    state.fence();
    assert!(!state.is_persisted(10, 20));

    // Flush of the covering line, then fence.
    state.flush(0);
    assert!(!state.is_persisted(10, 20));
    state.fence();
    assert!(state.is_persisted(10, 20));
    assert!(state.is_persisted(15, 2));
    assert_eq!(state.persist_interval_of(10, 20), PersistInterval::new(0, 1));

    // Ranges hanging over the stored region aggregate what exists.
    assert!(state.is_persisted(0, 20));
    assert!(state.is_persisted(10, 30));
}

#[test]
fn fence_with_no_pending_flushes_still_advances() {
    let mut state = PersistentMemoryState::default();
    assert_eq!(state.epoch(), 0);
    state.fence();
    state.fence();
    assert_eq!(state.epoch(), 2);
}

#[test]
fn back_to_back_fences_do_not_change_answers() {
    let mut state = PersistentMemoryState::default();
    store(&mut state, 0, 16);
    state.flush(0);
    state.fence();
    let after_one = state.is_persisted(0, 16);
    let interval = state.persist_interval_of(0, 16);
    state.fence();
    assert_eq!(state.is_persisted(0, 16), after_one);
    assert_eq!(state.persist_interval_of(0, 16), interval);
}

#[test]
fn ordered_writes_scenario() {
    let mut state = PersistentMemoryState::default();
    // Store A, flush its line, fence; then B the same.
    store(&mut state, 0, 64);
    state.flush(0);
    state.fence();
    store(&mut state, 64, 128);
    state.flush(64);
    state.fence();

    assert!(state.is_ordered_before(0, 64, 64, 64));
    assert!(!state.is_ordered_before(64, 64, 0, 64));
}

#[test]
fn same_epoch_writes_are_unordered_both_ways() {
    let mut state = PersistentMemoryState::default();
    store(&mut state, 0, 64);
    store(&mut state, 64, 64);
    state.flush(0);
    state.flush(64);
    state.fence();

    assert!(!state.is_ordered_before(0, 64, 64, 64));
    assert!(!state.is_ordered_before(64, 64, 0, 64));
}

#[test]
fn partially_flushed_first_range_blocks_ordering() {
    let mut state = PersistentMemoryState::default();
    // A spans two lines; only one gets flushed before the fence.
    store(&mut state, 0, 100);
    state.flush(0);
    state.fence();
    store(&mut state, 100, 50);
    state.flush(64);
    state.flush(128);
    state.fence();
    assert!(!state.is_ordered_before(0, 100, 100, 50));
}

#[test]
fn zero_size_ranges_are_persisted_and_ordered() {
    let mut state = PersistentMemoryState::default();
    store(&mut state, 0, 64);
    assert!(state.is_persisted(12, 0));
    assert!(state.is_ordered_before(12, 0, 0, 64));
    assert!(state.is_ordered_before(0, 64, 12, 0));
}

#[test]
fn straddling_range_requires_every_line_flushed() {
    let mut state = PersistentMemoryState::default();
    store(&mut state, 60, 10);
    state.flush(60);
    state.fence();
    assert!(!state.is_persisted(60, 10));
    state.flush(64);
    state.fence();
    assert!(state.is_persisted(60, 10));
}

#[test]
fn persist_intervals_enumerate_subranges() {
    let mut state = PersistentMemoryState::new(10);
    store(&mut state, 10, 20);
    state.flush(10);
    state.fence();
    store(&mut state, 20, 30);
    state.flush(20);
    state.fence();

    let intervals = state.persist_intervals_in(10, 20);
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[0].0.start, 10);
    assert_eq!(intervals[0].1, PersistInterval::new(0, 0));
    assert_eq!(intervals[1].0.start, 20);
    assert_eq!(intervals[1].1, PersistInterval::new(1, 1));
}

#[test]
fn overlapping_rewrite_reopens_interval() {
    let mut state = PersistentMemoryState::default();
    store(&mut state, 0, 32);
    state.flush(0);
    state.fence();
    assert!(state.is_persisted(0, 32));

    // Rewriting part of the range reopens its window.
    store(&mut state, 16, 8);
    assert!(!state.is_persisted(0, 32));
    assert!(state.is_persisted(0, 16));
}
