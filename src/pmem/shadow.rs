//! Symbolic shadow state for one persistent memory object.
//!
//! Cache-line status lives in a symbolic byte array (1 = persisted, 0 =
//! dirty) addressed by line number. Two update lists share that array: the
//! authoritative list sees only the writes of the current epoch, the
//! pending list sees writes *and* flushes. Mid-epoch persistence queries
//! read the authoritative list, so an unfenced flush never looks durable; a
//! fence promotes pending to authoritative with a single assignment.
//!
//! A parallel symbolic array of root-cause ids remembers which registered
//! location last touched each line, so a failing query can name the store
//! or flush responsible even when the offset was symbolic.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::collections::BTreeSet;
use tracing::trace;

use crate::expr::{Array, Expr, ExprRef, UpdateList, Width};
use crate::solver::Solver;

use super::AddrRange;

/// Cache-line state constants in the shadow array.
const PERSISTED: u64 = 1;
const DIRTY: u64 = 0;
/// Root-cause array value meaning "no registered location".
const NO_CAUSE: u64 = 0;

/// Identity of a persistent memory object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Harness-supplied name.
    pub name: String,
    /// Concrete base address.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
}

impl ObjectInfo {
    /// The byte range this object covers.
    pub fn range(&self) -> AddrRange {
        AddrRange::sized(self.base, self.size)
    }
}

/// Shadow state for one persistent object.
#[derive(Debug, Clone)]
pub struct PersistentState {
    info: ObjectInfo,
    cache_line_size: u64,
    /// Writes of the current epoch only.
    cache_lines: UpdateList,
    /// Writes plus not-yet-fenced flushes.
    pending_cache_lines: UpdateList,
    /// Registered location responsible for each line's current status.
    root_causes: UpdateList,
    /// Unconstrained 32-bit offset used to phrase "exists an offset such
    /// that..." queries.
    any_offset: ExprRef,
    /// Byte ranges (object offsets) excluded from persistence queries.
    ignored: Vec<AddrRange>,
    /// Concrete mirror of outstanding write causes per line, powering the
    /// masking bookkeeping without solver calls.
    line_write_causes: FxHashMap<u64, SmallVec<[u64; 2]>>,
    /// Write causes recorded under a symbolic offset; they may apply to
    /// any line.
    symbolic_write_causes: SmallVec<[u64; 2]>,
    /// Lines written since the last fence.
    written_this_epoch: FxHashSet<u64>,
    /// A symbolic-offset write happened since the last fence.
    symbolic_write_this_epoch: bool,
    /// Cause id of the most recent fence, the fallback attribution when a
    /// line's causes cannot be narrowed.
    last_commit_cause: Option<u64>,
}

impl PersistentState {
    /// Shadow state for `info`, all lines initially persisted.
    pub fn new(info: ObjectInfo, cache_line_size: u64) -> Self {
        let lines = info.size.div_ceil(cache_line_size);
        let lines_u32 = u32::try_from(lines).expect("object too large for shadow state");

        let cache_array = Array::constant(
            format!("{}_cache_lines", info.name),
            lines_u32,
            Width::W8,
            PERSISTED,
        );
        let cause_array = Array::constant(
            format!("{}_root_causes", info.name),
            lines_u32,
            Width::W64,
            NO_CAUSE,
        );
        let idx_array = Array::symbolic(
            format!("{}_any_offset", info.name),
            1,
            Width::W32,
            info.size.max(1),
        );
        let any_offset = Expr::read(
            UpdateList::new(idx_array),
            Expr::constant(0, Width::W32),
        );

        let cache_lines = UpdateList::new(cache_array);
        let root_causes = UpdateList::new(cause_array);
        Self {
            info,
            cache_line_size,
            pending_cache_lines: cache_lines.clone(),
            cache_lines,
            root_causes,
            any_offset,
            ignored: Vec::new(),
            line_write_causes: FxHashMap::default(),
            symbolic_write_causes: SmallVec::new(),
            written_this_epoch: FxHashSet::default(),
            symbolic_write_this_epoch: false,
            last_commit_cause: None,
        }
    }

    /// Object identity.
    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    /// Number of cache lines covered.
    pub fn num_cache_lines(&self) -> u64 {
        self.info.size.div_ceil(self.cache_line_size)
    }

    /// Configured cache line size.
    pub fn cache_line_size(&self) -> u64 {
        self.cache_line_size
    }

    /// Line number covering a concrete object offset.
    pub fn line_of(&self, offset: u64) -> u64 {
        offset / self.cache_line_size
    }

    /// Line-number expression covering a symbolic offset.
    fn line_expr(&self, offset: &ExprRef) -> ExprRef {
        let cls = Expr::constant(self.cache_line_size, offset.width());
        Expr::zext(Expr::udiv(offset.clone(), cls), Width::W32)
    }

    /// The unconstrained offset symbol, widened for address arithmetic.
    pub fn any_offset_expr(&self) -> ExprRef {
        Expr::zext(self.any_offset.clone(), Width::W64)
    }

    /// Constraints restricting the any-offset symbol to tracked bytes:
    /// in bounds and outside every ignored range.
    pub fn any_offset_constraints(&self) -> Vec<ExprRef> {
        let off = self.any_offset_expr();
        let mut out = vec![Expr::ult(
            off.clone(),
            Expr::constant(self.info.size, Width::W64),
        )];
        for ignore in &self.ignored {
            let lower = Expr::ule(Expr::constant(ignore.start, Width::W64), off.clone());
            let upper = Expr::ult(off.clone(), Expr::constant(ignore.end, Width::W64));
            out.push(Expr::not(Expr::and(lower, upper)));
        }
        out
    }

    /// Record a byte write at `offset`. The byte contents themselves live
    /// in the engine's state; here the covering line goes dirty in both
    /// lists and `cause_id` becomes the line's root cause.
    pub fn write8(&mut self, cause_id: u64, offset: &ExprRef) {
        let line = self.line_expr(offset);
        let dirty = Expr::constant(DIRTY, Width::W8);
        self.cache_lines.extend(line.clone(), dirty.clone());
        self.pending_cache_lines.extend(line.clone(), dirty);
        self.root_causes
            .extend(line, Expr::constant(cause_id, Width::W64));

        match offset.as_const() {
            Some(off) => {
                let line_no = self.line_of(off);
                self.written_this_epoch.insert(line_no);
                let causes = self.line_write_causes.entry(line_no).or_default();
                if !causes.contains(&cause_id) {
                    causes.push(cause_id);
                }
            }
            None => {
                self.symbolic_write_this_epoch = true;
                if !self.symbolic_write_causes.contains(&cause_id) {
                    self.symbolic_write_causes.push(cause_id);
                }
            }
        }
        trace!(object = %self.info.name, cause_id, "write8");
    }

    /// Concrete-offset convenience for [`PersistentState::write8`].
    pub fn write8_at(&mut self, cause_id: u64, offset: u64) {
        self.write8(cause_id, &Expr::constant(offset, Width::W64));
    }

    /// Record a flush of the line covering `offset`: only the pending list
    /// learns about it, so the durability is not claimed before a fence.
    pub fn flush_at(&mut self, cause_id: u64, offset: &ExprRef) {
        let line = self.line_expr(offset);
        self.pending_cache_lines
            .extend(line.clone(), Expr::constant(PERSISTED, Width::W8));
        self.root_causes
            .extend(line, Expr::constant(cause_id, Width::W64));
        trace!(object = %self.info.name, cause_id, "flush");
    }

    /// Drain the outstanding write causes a flush of `offset` supersedes:
    /// the concrete causes of the covered line plus a copy of any
    /// symbolic-offset write causes.
    pub fn take_write_causes(&mut self, offset: u64) -> Vec<u64> {
        let mut out: Vec<u64> = self
            .line_write_causes
            .remove(&self.line_of(offset))
            .map(|v| v.into_vec())
            .unwrap_or_default();
        for &c in &self.symbolic_write_causes {
            if !out.contains(&c) {
                out.push(c);
            }
        }
        out
    }

    /// Whether the line covering `offset` was written since the last fence
    /// (including through a symbolic offset).
    pub fn line_written_this_epoch(&self, offset: u64) -> bool {
        self.symbolic_write_this_epoch || self.written_this_epoch.contains(&self.line_of(offset))
    }

    /// Promote pending to authoritative. Called at each fence; ends the
    /// object's current epoch.
    pub fn commit_pending(&mut self, fence_cause_id: u64) {
        self.cache_lines = self.pending_cache_lines.clone();
        self.written_this_epoch.clear();
        self.symbolic_write_this_epoch = false;
        self.last_commit_cause = Some(fence_cause_id);
        trace!(object = %self.info.name, "commit pending persists");
    }

    /// Expression: is the line covering `offset` persisted, in the chosen
    /// list?
    pub fn is_offset_persisted(&self, offset: &ExprRef, pending: bool) -> ExprRef {
        self.is_line_persisted_expr(self.line_expr(offset), pending)
    }

    /// Expression: is line `line` persisted, in the chosen list?
    pub fn is_line_persisted(&self, line: u64, pending: bool) -> ExprRef {
        self.is_line_persisted_expr(Expr::constant(line, Width::W32), pending)
    }

    fn is_line_persisted_expr(&self, line: ExprRef, pending: bool) -> ExprRef {
        let list = if pending {
            &self.pending_cache_lines
        } else {
            &self.cache_lines
        };
        Expr::eq(
            Expr::read(list.clone(), line),
            Expr::constant(PERSISTED, Width::W8),
        )
    }

    /// Must every tracked offset be persisted under the authoritative
    /// view? Solver failures count as "no".
    pub fn must_be_persisted(
        &self,
        solver: &dyn Solver,
        path_constraints: &[ExprRef],
    ) -> bool {
        let mut constraints = path_constraints.to_vec();
        constraints.extend(self.any_offset_constraints());
        let query = self.is_offset_persisted(&self.any_offset_expr(), false);
        solver.must_be_true(&constraints, &query).must_hold()
    }

    /// May the line covering `offset` be unpersisted, in the chosen list?
    pub fn may_line_be_unpersisted(
        &self,
        solver: &dyn Solver,
        path_constraints: &[ExprRef],
        line: u64,
        pending: bool,
    ) -> bool {
        let query = Expr::not(self.is_line_persisted(line, pending));
        solver.may_be_true(path_constraints, &query).may_hold()
    }

    /// Whether a concrete line lies entirely inside ignored ranges.
    pub fn line_ignored(&self, line: u64) -> bool {
        let start = line * self.cache_line_size;
        let end = (start + self.cache_line_size).min(self.info.size);
        let line_range = AddrRange { start, end };
        self.ignored.iter().any(|r| r.contains_range(&line_range))
    }

    /// Possible root-cause ids for line `line`: read the cause array, take
    /// the solver's value range, and keep each candidate id the solver
    /// cannot rule out. Falls back to the last fence's cause when nothing
    /// else remains.
    pub fn line_root_causes(
        &self,
        solver: &dyn Solver,
        path_constraints: &[ExprRef],
        line: u64,
    ) -> Vec<u64> {
        let read = Expr::read(
            self.root_causes.clone(),
            Expr::constant(line, Width::W32),
        );
        let mut possible = Vec::new();
        let Some((lo, hi)) = solver.get_range(path_constraints, &read) else {
            // Undecidable: fall back to everything we ever attached here.
            if let Some(commit) = self.last_commit_cause {
                possible.push(commit);
            }
            return possible;
        };
        if lo == 0 && hi == 0 {
            return possible;
        }
        let lo = lo.max(1);
        for id in lo..=hi {
            if lo == hi {
                possible.push(id);
                continue;
            }
            let eq = Expr::eq(read.clone(), Expr::constant(id, Width::W64));
            if solver.may_be_true(path_constraints, &eq).may_hold() {
                possible.push(id);
            }
        }
        possible
    }

    /// Possible root causes over every tracked line that may hold a
    /// registered cause.
    pub fn get_root_causes(
        &self,
        solver: &dyn Solver,
        path_constraints: &[ExprRef],
    ) -> BTreeSet<u64> {
        let mut out = BTreeSet::new();
        for line in 0..self.num_cache_lines() {
            if self.line_ignored(line) {
                continue;
            }
            out.extend(self.line_root_causes(solver, path_constraints, line));
        }
        if out.is_empty() {
            if let Some(commit) = self.last_commit_cause {
                out.insert(commit);
            }
        }
        out
    }

    /// Mark every line persisted in both views. Used after a harness check
    /// has reported, so the same dirt is not re-reported at exit.
    pub fn flush_all(&mut self) {
        for line in 0..self.num_cache_lines() {
            let line_expr = Expr::constant(line, Width::W32);
            let persisted = Expr::constant(PERSISTED, Width::W8);
            self.cache_lines.extend(line_expr.clone(), persisted.clone());
            self.pending_cache_lines.extend(line_expr.clone(), persisted);
            self.root_causes
                .extend(line_expr, Expr::constant(NO_CAUSE, Width::W64));
        }
        self.line_write_causes.clear();
        self.symbolic_write_causes.clear();
        self.written_this_epoch.clear();
        self.symbolic_write_this_epoch = false;
    }

    /// Exclude `[offset, offset+size)` from persistence tracking.
    pub fn add_ignore_offset(&mut self, offset: u64, size: u64) {
        let range = AddrRange::sized(offset, size);
        if !range.is_empty() {
            self.ignored.push(range);
        }
    }

    /// Whether an offset range lies fully inside ignored bytes.
    pub fn range_ignored(&self, range: AddrRange) -> bool {
        !range.is_empty() && self.ignored.iter().any(|r| r.contains_range(&range))
    }

    /// Authoritative-list depth never exceeds pending-list depth; they
    /// share the array.
    pub fn lists_consistent(&self) -> bool {
        self.cache_lines.is_prefix_of(&self.pending_cache_lines)
            || self.pending_cache_lines.depth() >= self.cache_lines.depth()
    }
}
