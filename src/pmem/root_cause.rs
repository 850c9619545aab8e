//! Run-wide registry of distinct bug sites.
//!
//! Every write or flush that might later surface as a bug registers its
//! location here and gets a dense id; the shadow state stores those ids in
//! its symbolic root-cause array. When a later event hides an earlier
//! potential bug (a flush covering a write that was about to be flagged),
//! the later location records the earlier ids as *masked*; marking the
//! masking event as a bug also marks everything it masked, so no root cause
//! is lost to overwriting.

use std::collections::BTreeSet;
use std::io::Write;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::Result;

/// Category of a registered location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BugKind {
    /// A write whose cache line was never flushed and fenced. Correctness.
    Unpersisted,
    /// A flush of a line that was already persisted. Performance.
    UnnecessaryFlush,
    /// A flush of a line never written this epoch. Performance.
    FlushOnUnmodified,
}

impl BugKind {
    /// Report spelling.
    pub fn description(self) -> &'static str {
        match self {
            BugKind::Unpersisted => "write (unpersisted)",
            BugKind::UnnecessaryFlush => "flush (unnecessary)",
            BugKind::FlushOnUnmodified => "flush (never modified)",
        }
    }

    /// Whether this category loses data, as opposed to wasting time.
    pub fn is_correctness(self) -> bool {
        matches!(self, BugKind::Unpersisted)
    }
}

/// One stack frame of a recorded location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackFrameInfo {
    /// Function executing in this frame.
    pub function: String,
    /// Source file of the call site, when known.
    pub file: Option<String>,
    /// Source line of the call site, when known.
    pub line: Option<u32>,
}

impl StackFrameInfo {
    /// The combined description used in the report's convenience column.
    pub fn describe(&self) -> String {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => format!("{} at {}:{}", self.function, file, line),
            _ => self.function.clone(),
        }
    }
}

/// A bug site: where a potentially-buggy event happened and why it matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootCauseLocation {
    /// Description of the owning allocation, when resolved.
    pub alloc_site: Option<String>,
    /// Description of the triggering instruction.
    pub instruction: String,
    /// Source position of the instruction.
    pub file: Option<String>,
    /// Source line of the instruction.
    pub line: Option<u32>,
    /// Call stack at the event, innermost frame first.
    pub stack: Vec<StackFrameInfo>,
    /// Category.
    pub reason: BugKind,
}

impl RootCauseLocation {
    /// Multi-line location text used by reports and
    /// `get_root_causes`-style queries.
    pub fn text(&self) -> String {
        let mut out = String::new();
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            out.push_str(&format!("File: {file}\nLine: {line}\n"));
        }
        out.push_str(&format!("Instruction: {}\n", self.instruction));
        match &self.alloc_site {
            Some(site) => out.push_str(&format!("Allocated at: {site}\n")),
            None => out.push_str("(no allocation info)\n"),
        }
        out.push_str("Stack:\n");
        for (depth, frame) in self.stack.iter().enumerate() {
            out.push_str(&format!("\t#{depth} {}\n", frame.describe()));
        }
        out
    }
}

#[derive(Debug)]
struct RootCauseInfo {
    location: RootCauseLocation,
    occurrences: u64,
    masked: BTreeSet<u64>,
    masked_by: BTreeSet<u64>,
}

/// Deduplicating, append-only store of bug sites.
///
/// Shared by every execution state in a run; ids are stable for the whole
/// process lifetime.
#[derive(Debug, Default)]
pub struct RootCauseManager {
    next_id: u64,
    by_location: FxHashMap<RootCauseLocation, u64>,
    infos: FxHashMap<u64, RootCauseInfo>,
    buggy: BTreeSet<u64>,
    largest_stack: usize,
    total_occurrences: u64,
    unique_correctness: u64,
    unique_performance: u64,
}

impl RootCauseManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Register `location` (or find its existing id).
    pub fn get_or_create_id(&mut self, location: RootCauseLocation) -> u64 {
        self.get_or_create_id_masking(location, &[])
    }

    /// Register `location`, additionally recording that it masks every id
    /// in `masked` and, transitively, everything those already masked.
    pub fn get_or_create_id_masking(
        &mut self,
        location: RootCauseLocation,
        masked: &[u64],
    ) -> u64 {
        let id = match self.by_location.get(&location) {
            Some(&existing) => existing,
            None => {
                let id = self.next_id;
                self.next_id = self.next_id.checked_add(1).expect("root cause id overflow");
                self.by_location.insert(location.clone(), id);
                self.infos.insert(
                    id,
                    RootCauseInfo {
                        location,
                        occurrences: 0,
                        masked: BTreeSet::new(),
                        masked_by: BTreeSet::new(),
                    },
                );
                id
            }
        };

        // Flatten transitively: every id already flattened its own masked
        // set, so one level of expansion suffices.
        let mut all: BTreeSet<u64> = BTreeSet::new();
        for &m in masked {
            if m == id {
                continue;
            }
            debug_assert!(self.infos.contains_key(&m), "masking unknown id {m}");
            all.insert(m);
            if let Some(info) = self.infos.get(&m) {
                all.extend(info.masked.iter().copied().filter(|&s| s != id));
            }
        }
        for &m in &all {
            if let Some(info) = self.infos.get_mut(&m) {
                info.masked_by.insert(id);
            }
        }
        if let Some(info) = self.infos.get_mut(&id) {
            info.masked.extend(all);
        }
        id
    }

    /// Count the bug at `id` (and everything it masked: those are real
    /// bugs whose manifestation was hidden by later code). Unique-bug
    /// counting is idempotent; occurrence counting is cumulative.
    pub fn mark_as_bug(&mut self, id: u64) {
        let Some(info) = self.infos.get(&id) else {
            debug!(id, "mark_as_bug on unregistered id");
            return;
        };
        let mut all: BTreeSet<u64> = info.masked.clone();
        all.insert(id);

        for i in all {
            let info = self.infos.get_mut(&i).expect("masked ids are registered");
            if info.occurrences == 0 {
                if info.location.reason.is_correctness() {
                    self.unique_correctness += 1;
                } else {
                    self.unique_performance += 1;
                }
            }
            info.occurrences += 1;
            self.total_occurrences += 1;
            self.buggy.insert(i);
            self.largest_stack = self.largest_stack.max(info.location.stack.len());
        }
    }

    /// Location text for a registered id.
    pub fn location_text(&self, id: u64) -> Option<String> {
        self.infos.get(&id).map(|info| info.location.text())
    }

    /// Category of a registered id.
    pub fn reason_of(&self, id: u64) -> Option<BugKind> {
        self.infos.get(&id).map(|info| info.location.reason)
    }

    /// Ids `id` may have masked.
    pub fn masked_of(&self, id: u64) -> Vec<u64> {
        self.infos
            .get(&id)
            .map(|info| info.masked.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of distinct bugs marked so far.
    pub fn unique_bugs(&self) -> u64 {
        self.buggy.len() as u64
    }

    /// Total occurrence count across all bugs.
    pub fn total_occurrences(&self) -> u64 {
        self.total_occurrences
    }

    /// Whether any bug was recorded.
    pub fn has_bugs(&self) -> bool {
        !self.buggy.is_empty()
    }

    /// Summary block shared by the text report and the log.
    pub fn summary(&self) -> String {
        format!(
            "Persistent-memory bug summary:\n\
             \t{} unique bugs ({} correctness, {} performance)\n\
             \t{} total occurrences\n",
            self.buggy.len(),
            self.unique_correctness,
            self.unique_performance,
            self.total_occurrences,
        )
    }

    /// Human-readable report: summary, then one block per unique bug.
    pub fn dump_text(&self, out: &mut dyn Write) -> Result<()> {
        write!(out, "{}", self.summary())?;

        for (bug_no, &id) in self.buggy.iter().enumerate() {
            let info = &self.infos[&id];
            writeln!(
                out,
                "\n({}) ID #{} with {} occurrences:",
                bug_no + 1,
                id,
                info.occurrences
            )?;
            writeln!(out, "Type of modification: {}", info.location.reason.description())?;
            write!(out, "{}", info.location.text())?;

            if info.masked.is_empty() {
                writeln!(out, "<not masking anything>")?;
            } else {
                writeln!(out, "May be masking:")?;
                for &m in &info.masked {
                    writeln!(out, "\tID #{m}")?;
                    if let Some(text) = self.location_text(m) {
                        for line in text.lines() {
                            writeln!(out, "\t\t{line}")?;
                        }
                    }
                }
            }
            if info.masked_by.is_empty() {
                writeln!(out, "<not masked by anything>")?;
            } else {
                writeln!(out, "May be masked by:")?;
                for &m in &info.masked_by {
                    writeln!(out, "\tID #{m}")?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    /// CSV report: one row per unique bug, one column group per stack
    /// frame, padded to the deepest recorded stack.
    pub fn dump_csv(&self, out: &mut dyn Write) -> Result<()> {
        let mut writer = csv::Writer::from_writer(out);

        let mut header = vec![
            "ID".to_string(),
            "Type".to_string(),
            "Occurrences".to_string(),
        ];
        for frame in 0..self.largest_stack {
            header.push(format!("StackFrame{frame}"));
            header.push(format!("StackFrame{frame}_Function"));
            header.push(format!("StackFrame{frame}_File"));
            header.push(format!("StackFrame{frame}_Line"));
        }
        writer.write_record(&header)?;

        for &id in &self.buggy {
            let info = &self.infos[&id];
            let mut record = vec![
                id.to_string(),
                info.location.reason.description().to_string(),
                info.occurrences.to_string(),
            ];
            for frame in 0..self.largest_stack {
                match info.location.stack.get(frame) {
                    Some(sf) => {
                        record.push(sf.describe());
                        record.push(sf.function.clone());
                        record.push(sf.file.clone().unwrap_or_default());
                        record.push(sf.line.map(|l| l.to_string()).unwrap_or_default());
                    }
                    None => record.extend(std::iter::repeat(String::new()).take(4)),
                }
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
