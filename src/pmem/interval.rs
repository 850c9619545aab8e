//! Ordered map from byte ranges to values.
//!
//! Backed by a `BTreeMap` keyed on range start. Inserting splits any
//! overlapped entries so the map always holds disjoint half-open ranges.
//! Two write flavors mirror the two ways the epoch model mutates state:
//! `set` overwrites, `merge` combines with what is already there.

use std::collections::BTreeMap;

use super::AddrRange;

/// Disjoint-interval map.
#[derive(Debug, Clone, Default)]
pub struct IntervalMap<V> {
    map: BTreeMap<u64, (u64, V)>,
}

impl<V: Clone> IntervalMap<V> {
    /// Empty map.
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Whether no range is mapped.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove every mapping.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Map `range` to `value`, overwriting whatever overlapped.
    pub fn set(&mut self, range: AddrRange, value: V) {
        if range.is_empty() {
            return;
        }
        self.carve(range);
        self.map.insert(range.start, (range.end, value));
    }

    /// Combine `value` into `range`: overlapped pieces are passed through
    /// `combine`, uncovered gaps get `value` as-is.
    pub fn merge(&mut self, range: AddrRange, value: V, combine: impl Fn(&V, &V) -> V) {
        if range.is_empty() {
            return;
        }
        let pieces: Vec<(AddrRange, V)> = self
            .overlapping(range)
            .map(|(r, v)| (r, v.clone()))
            .collect();
        self.carve(range);

        let mut cursor = range.start;
        for (piece, old) in pieces {
            let begin = piece.start.max(range.start);
            let end = piece.end.min(range.end);
            if cursor < begin {
                self.map.insert(cursor, (begin, value.clone()));
            }
            self.map.insert(begin, (end, combine(&old, &value)));
            cursor = end;
        }
        if cursor < range.end {
            self.map.insert(cursor, (range.end, value));
        }
    }

    /// Unmap `range`, splitting partial overlaps.
    pub fn erase(&mut self, range: AddrRange) {
        if !range.is_empty() {
            self.carve(range);
        }
    }

    /// Remove every entry overlapping `range`, reinserting the parts that
    /// stick out on either side.
    fn carve(&mut self, range: AddrRange) {
        let starts: Vec<u64> = self
            .map
            .range(..range.end)
            .rev()
            .take_while(|(_, (end, _))| *end > range.start)
            .map(|(start, _)| *start)
            .collect();
        // take_while over a reverse scan stops at the first non-overlap,
        // which is correct because entries are disjoint and sorted.
        for start in starts {
            let (end, value) = self.map.remove(&start).expect("key just seen");
            if start < range.start {
                self.map.insert(start, (range.start, value.clone()));
            }
            if end > range.end {
                self.map.insert(range.end, (end, value));
            }
        }
    }

    /// Value mapped at a single address.
    pub fn get(&self, addr: u64) -> Option<&V> {
        self.map
            .range(..=addr)
            .next_back()
            .filter(|(_, (end, _))| *end > addr)
            .map(|(_, (_, v))| v)
    }

    /// Entries overlapping `range`, in address order.
    pub fn overlapping(&self, range: AddrRange) -> impl Iterator<Item = (AddrRange, &V)> {
        self.map
            .range(..range.end)
            .filter(move |(start, (end, _))| **start < range.end && *end > range.start)
            .map(|(start, (end, v))| {
                (
                    AddrRange {
                        start: *start,
                        end: *end,
                    },
                    v,
                )
            })
    }

    /// All entries, in address order.
    pub fn iter(&self) -> impl Iterator<Item = (AddrRange, &V)> {
        self.map.iter().map(|(start, (end, v))| {
            (
                AddrRange {
                    start: *start,
                    end: *end,
                },
                v,
            )
        })
    }
}
