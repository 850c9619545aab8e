//! Priority-directed state selection.
//!
//! States are ordered by (generation, priority): a forked state whose
//! priority equals its sibling's lands in a later generation, because two
//! equal-priority successors of one branch almost always rejoin at a common
//! post-dominator and exploring both immediately is redundant. A later
//! generation is not touched until the current one drains. With no positive
//! priorities anywhere the searcher degrades to a plain depth-first or
//! random selector, per configuration.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::config::SearchFallback;
use crate::state::{ExecutionState, StateId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    generation: u64,
    priority: u64,
    seq: u64,
    state: StateId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: earlier generation wins, then higher priority, then
        // most recently pushed (depth-first among ties).
        other
            .generation
            .cmp(&self.generation)
            .then(self.priority.cmp(&other.priority))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue over ready execution states.
#[derive(Debug)]
pub struct PrioritySearcher {
    heap: BinaryHeap<QueueEntry>,
    /// Valid sequence number per live state; stale heap entries are
    /// skipped on pop.
    latest: FxHashMap<StateId, u64>,
    priorities: FxHashMap<StateId, u64>,
    generations: FxHashMap<StateId, u64>,
    current_generation: u64,
    next_seq: u64,
    positive: usize,
    fallback: SearchFallback,
    rng: StdRng,
}

impl PrioritySearcher {
    /// Empty searcher with the configured zero-priority fallback.
    pub fn new(fallback: SearchFallback) -> Self {
        Self {
            heap: BinaryHeap::new(),
            latest: FxHashMap::default(),
            priorities: FxHashMap::default(),
            generations: FxHashMap::default(),
            current_generation: 0,
            next_seq: 0,
            positive: 0,
            fallback,
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }

    /// Number of live states.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    /// Whether no state is ready.
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    fn push(&mut self, state: StateId, priority: u64, generation: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        match self.priorities.insert(state, priority) {
            Some(old) if old > 0 => {
                if priority == 0 {
                    self.positive -= 1;
                }
            }
            Some(_) | None => {
                if priority > 0 {
                    self.positive += 1;
                }
            }
        }
        self.latest.insert(state, seq);
        self.generations.insert(state, generation);
        self.heap.push(QueueEntry {
            generation,
            priority,
            seq,
            state,
        });
    }

    /// Register the run's initial state.
    pub fn add_initial(&mut self, state: &ExecutionState) {
        self.push(state.id, state.heuristic.current_priority(), 0);
    }

    /// Register a state forked off `parent`. Equal priorities put the
    /// child one generation behind.
    pub fn add_forked(&mut self, parent: &ExecutionState, child: &ExecutionState) {
        let parent_gen = self
            .generations
            .get(&parent.id)
            .copied()
            .unwrap_or(self.current_generation);
        let parent_priority = parent.heuristic.current_priority();
        let child_priority = child.heuristic.current_priority();
        let generation = if child_priority == parent_priority {
            parent_gen + 1
        } else {
            parent_gen
        };
        trace!(parent = parent.id, child = child.id, generation, "fork");
        self.push(child.id, child_priority, generation);
    }

    /// Refresh the current state's priority after it stepped.
    pub fn update_current(&mut self, state: &ExecutionState) {
        let generation = self
            .generations
            .get(&state.id)
            .copied()
            .unwrap_or(self.current_generation);
        self.push(state.id, state.heuristic.current_priority(), generation);
    }

    /// Drop a terminated state.
    pub fn remove(&mut self, state: StateId) {
        if self.latest.remove(&state).is_some() {
            if self.priorities.remove(&state).unwrap_or(0) > 0 {
                self.positive -= 1;
            }
            self.generations.remove(&state);
        }
    }

    /// Choose the next state to run. The state stays queued; the driver
    /// calls [`PrioritySearcher::update_current`] or
    /// [`PrioritySearcher::remove`] afterwards.
    pub fn select(&mut self) -> Option<StateId> {
        if self.positive == 0 && self.fallback == SearchFallback::Random && !self.latest.is_empty()
        {
            let candidates: Vec<StateId> = self.latest.keys().copied().collect();
            let pick = candidates[self.rng.gen_range(0..candidates.len())];
            return Some(pick);
        }

        loop {
            let entry = *self.heap.peek()?;
            let valid = self.latest.get(&entry.state) == Some(&entry.seq);
            if !valid {
                self.heap.pop();
                continue;
            }
            if entry.generation > self.current_generation {
                // Current generation drained; open the next one.
                self.current_generation = entry.generation;
            }
            return Some(entry.state);
        }
    }
}
