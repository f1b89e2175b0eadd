//! # pymem
//!
//! Post-mortem memory analyzer for CPython process snapshots.
//!
//! This library provides functionality to:
//! - Open a snapshot of a paused interpreter's address space (directory of
//!   region files or a single framed file) and read it through a sparse,
//!   region-based view
//! - Bootstrap a type catalog by scanning for the self-typed `type` object
//!   and every other live type object
//! - Decode interpreter objects (dict, set, tuple, list, str, bytes, int,
//!   code, frame, module, task, future, generator, ...) from raw bytes with
//!   strict validity checking
//! - Run parallel whole-address-space scans with shard-local accumulators
//! - Pretty-print reconstructed object graphs with cycle detection
//! - Answer high-level queries: object censuses, reference searches, stack
//!   tracebacks, async await graphs, string histograms
//!
//! ## Module structure
//!
//! - `addr` - typed addresses in the snapshot's address space
//! - `snapshot` - mmap-backed region store with bounds-checked reads
//! - `scan` - parallel address-space scanner
//! - `catalog` - persistent type catalog (the analysis environment)
//! - `objects` - per-type decoders: validity, referents, repr
//! - `traverse` - cycle-aware, depth-limited repr walker
//! - `queries` - shell-facing query operations and command dispatch

pub mod addr;
pub mod args;
pub mod catalog;
pub mod error;
pub mod objects;
pub mod queries;
pub mod scan;
pub mod snapshot;
pub mod traverse;

pub use addr::MappedAddr;
pub use catalog::Environment;
pub use error::{Error, Result};
pub use queries::{dispatch, registry, Session};
pub use snapshot::SnapshotStore;
pub use traverse::{ReprOptions, Traversal};

/// Rewrites the current terminal line: carriage return plus clear-to-end.
pub const CLEAR_LINE: &str = "\r\x1b[K";

#[cfg(test)]
pub(crate) mod testutil;
