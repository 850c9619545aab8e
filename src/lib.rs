//! # Umbra - Persistent-Memory Correctness Checking
//!
//! Umbra extends a symbolic execution engine with a persistent-memory
//! correctness checker: for every explored path it verifies that data
//! written to byte-addressable persistent memory was flushed and fenced so
//! that a power failure at any instant leaves a recoverable state.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::rc::Rc;
//! use umbra::config::Config;
//! use umbra::heuristic::NoneHeuristic;
//! use umbra::ir::ModuleBuilder;
//! use umbra::runtime::PmemRuntime;
//! use umbra::state::ExecutionState;
//!
//! // A harness that writes one byte and exits without flushing.
//! let mut b = ModuleBuilder::new();
//! let main = b.begin_function("main", &[]);
//! let slot = b.alloca();
//! let one = b.constant(1);
//! let store = b.store(one, slot, 1);
//! b.ret(None);
//! let module = Rc::new(b.finish());
//!
//! let mut rt = PmemRuntime::new(Config::default(), module);
//! let mut state = ExecutionState::new(0, main, 64, Box::new(NoneHeuristic));
//! let base = rt.alloc_pmem(&mut state, 64, "region").unwrap();
//! rt.store(&mut state, store, base, 1);
//! rt.on_exit(&mut state);
//! assert_eq!(rt.exit_code(), 1); // one unpersisted write
//! ```
//!
//! ## Architecture
//!
//! Umbra layers three subsystems over the engine:
//! - **Shadow state**: per-object symbolic cache-line tracking
//!   ([`pmem::shadow`]), with the concrete epoch model ([`pmem::epoch`]) as
//!   its reference twin and the deduplicating root-cause registry
//!   ([`pmem::root_cause`]) naming every bug site.
//! - **Checker plugins** ([`checker`]): per-instruction policy checks for
//!   transactions and volatile-marked fields.
//! - **Search heuristics** ([`heuristic`], [`searcher`]): a whole-program
//!   points-to analysis ([`analysis`]) steering path selection toward
//!   instructions likely to touch persistent memory.

pub mod analysis;
pub mod checker;
pub mod config;
pub mod error;
pub mod expr;
pub mod heuristic;
pub mod intrinsics;
pub mod ir;
pub mod logging;
pub mod pmem;
pub mod runtime;
pub mod searcher;
pub mod solver;
pub mod state;

// Re-export the main public API
pub use crate::config::{Config, HeuristicType, SearchFallback};
pub use crate::error::{Result, UmbraError};
pub use crate::pmem::{
    AddrRange, BugKind, PersistInterval, PersistentMemoryState, PersistentState,
    RootCauseManager, EPOCH_INF,
};
pub use crate::runtime::PmemRuntime;
pub use crate::searcher::PrioritySearcher;
pub use crate::state::ExecutionState;
