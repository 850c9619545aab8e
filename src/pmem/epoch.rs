//! Concrete epoch-based reference model of persistence.
//!
//! Execution is cut into epochs by fences. A store opens a persist interval
//! `(mod_epoch, INF)`; once every cache line it spans has been flushed in an
//! epoch no earlier than the modification, the next fence closes the
//! interval at the current epoch. Ordering between two ranges reduces to
//! comparing closed intervals.
//!
//! The symbolic shadow state answers the same questions through the solver;
//! this model answers them exactly and cheaply for concrete addresses, which
//! makes it the oracle for `check_ordered_before` and for the property
//! suite.

use std::fmt;

use tracing::trace;

use super::interval::IntervalMap;
use super::{AddrRange, align_down};
use crate::config::DEFAULT_CACHE_LINE_SIZE;

/// An epoch "infinitely" far in the future.
pub const EPOCH_INF: u32 = u32::MAX;

/// The window during which a write may become durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistInterval {
    /// Epoch of the most recent modification.
    pub mod_epoch: u32,
    /// Epoch by which the write is known durable; `EPOCH_INF` while
    /// unresolved.
    pub persist_epoch: u32,
}

impl PersistInterval {
    /// The unknown interval.
    pub const UNKNOWN: PersistInterval = PersistInterval {
        mod_epoch: EPOCH_INF,
        persist_epoch: EPOCH_INF,
    };

    /// Interval with both ends known.
    pub fn new(mod_epoch: u32, persist_epoch: u32) -> Self {
        debug_assert!(mod_epoch <= persist_epoch);
        Self {
            mod_epoch,
            persist_epoch,
        }
    }

    /// Whether the two windows can coincide in time.
    pub fn overlaps(&self, other: &PersistInterval) -> bool {
        self.mod_epoch <= other.persist_epoch && other.mod_epoch <= self.persist_epoch
    }
}

impl fmt::Display for PersistInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |e: u32| -> String {
            if e == EPOCH_INF {
                "INF".to_string()
            } else {
                e.to_string()
            }
        };
        write!(f, "[{},{}]", part(self.mod_epoch), part(self.persist_epoch))
    }
}

/// Concrete persistence model for one address space.
#[derive(Debug, Clone)]
pub struct PersistentMemoryState {
    curr_epoch: u32,
    cache_line_size: u64,
    /// Persist interval per modified byte range.
    persist_intervals: IntervalMap<PersistInterval>,
    /// Cache lines flushed during the current epoch. Lines fall back out
    /// when re-written before the fence.
    flushed_this_epoch: IntervalMap<()>,
    /// Most recent fenced flush epoch per cache line.
    last_flushed_epoch: IntervalMap<u32>,
    /// Ranges still waiting for a resolving fence, keyed to their
    /// modification epoch.
    dirty_ranges: IntervalMap<u32>,
}

impl Default for PersistentMemoryState {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_LINE_SIZE)
    }
}

impl PersistentMemoryState {
    /// Model with the given cache line size.
    pub fn new(cache_line_size: u64) -> Self {
        assert!(cache_line_size > 0, "cache line size must be positive");
        Self {
            curr_epoch: 0,
            cache_line_size,
            persist_intervals: IntervalMap::new(),
            flushed_this_epoch: IntervalMap::new(),
            last_flushed_epoch: IntervalMap::new(),
            dirty_ranges: IntervalMap::new(),
        }
    }

    /// Current epoch number.
    pub fn epoch(&self) -> u32 {
        self.curr_epoch
    }

    /// Configured cache line size.
    pub fn cache_line_size(&self) -> u64 {
        self.cache_line_size
    }

    /// Floor an address to its cache line.
    pub fn align_to_cache(&self, addr: u64) -> u64 {
        align_down(addr, self.cache_line_size)
    }

    /// Record a store to `[base, base+size)`.
    pub fn store(&mut self, base: u64, size: u64) {
        let range = AddrRange::sized(base, size);
        if range.is_empty() {
            return;
        }
        trace!(%range, epoch = self.curr_epoch, "store");

        // A fresh persist interval opens; resolution waits for a fence.
        self.persist_intervals.set(
            range,
            PersistInterval {
                mod_epoch: self.curr_epoch,
                persist_epoch: EPOCH_INF,
            },
        );
        self.dirty_ranges.set(range, self.curr_epoch);

        // Pending flushes of the touched lines no longer cover this write.
        self.flushed_this_epoch
            .erase(range.cache_aligned(self.cache_line_size));
    }

    /// Record a flush of the cache line containing `addr`.
    pub fn flush(&mut self, addr: u64) {
        let line = AddrRange::sized(addr, 1).cache_aligned(self.cache_line_size);
        trace!(%line, epoch = self.curr_epoch, "flush");
        self.flushed_this_epoch.set(line, ());
    }

    /// Record a store barrier: pending flushes land, resolvable dirty
    /// ranges close their intervals, and a new epoch begins.
    pub fn fence(&mut self) {
        let flushed: Vec<AddrRange> = self
            .flushed_this_epoch
            .iter()
            .map(|(range, _)| range)
            .collect();
        for line in flushed {
            self.last_flushed_epoch.set(line, self.curr_epoch);
        }
        self.flushed_this_epoch.clear();

        let dirty: Vec<(AddrRange, u32)> = self
            .dirty_ranges
            .iter()
            .map(|(range, &mod_epoch)| (range, mod_epoch))
            .collect();
        for (range, mod_epoch) in dirty {
            if self.is_fully_flushed(range, mod_epoch) {
                self.dirty_ranges.erase(range);
                let closed = PersistInterval {
                    mod_epoch,
                    persist_epoch: self.curr_epoch,
                };
                self.persist_intervals.set(range, closed);
            }
        }

        self.curr_epoch += 1;
        trace!(epoch = self.curr_epoch, "fence");
    }

    /// Every cache line the range spans has a fenced flush no older than
    /// the modification.
    fn is_fully_flushed(&self, range: AddrRange, mod_epoch: u32) -> bool {
        range.cache_lines(self.cache_line_size).all(|line| {
            self.last_flushed_epoch
                .get(line)
                .is_some_and(|&flushed| flushed >= mod_epoch)
        })
    }

    /// Aggregate persist interval for `[base, base+size)`: min mod epoch,
    /// max persist epoch over the overlapped entries. `UNKNOWN` when no
    /// byte of the range was ever stored.
    pub fn persist_interval_of(&self, base: u64, size: u64) -> PersistInterval {
        let range = AddrRange::sized(base, size);
        let mut result: Option<PersistInterval> = None;
        for (_, pi) in self.persist_intervals.overlapping(range) {
            result = Some(match result {
                None => *pi,
                Some(acc) => PersistInterval {
                    mod_epoch: acc.mod_epoch.min(pi.mod_epoch),
                    persist_epoch: acc.persist_epoch.max(pi.persist_epoch),
                },
            });
        }
        result.unwrap_or(PersistInterval::UNKNOWN)
    }

    /// All persist intervals inside `[base, base+size)`, address-ordered.
    pub fn persist_intervals_in(&self, base: u64, size: u64) -> Vec<(AddrRange, PersistInterval)> {
        self.persist_intervals
            .overlapping(AddrRange::sized(base, size))
            .map(|(range, pi)| (range, *pi))
            .collect()
    }

    /// Whether the most recent stores to the range are guaranteed durable.
    /// A zero-size range is trivially persisted.
    pub fn is_persisted(&self, base: u64, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        self.persist_interval_of(base, size).persist_epoch < self.curr_epoch
    }

    /// Whether the most recent stores to `A` are guaranteed durable before
    /// any of the most recent stores to `B`: the persist windows must not
    /// overlap, with `A`'s entirely earlier. Zero-size ranges order before
    /// everything.
    pub fn is_ordered_before(
        &self,
        base_a: u64,
        size_a: u64,
        base_b: u64,
        size_b: u64,
    ) -> bool {
        if size_a == 0 || size_b == 0 {
            return true;
        }
        let a = self.persist_interval_of(base_a, size_a);
        let b = self.persist_interval_of(base_b, size_b);
        !a.overlaps(&b) && a.persist_epoch < b.mod_epoch
    }
}
