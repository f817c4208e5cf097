//! Execution and feedback core for agent-driven, cost-guided fuzzing.
//!
//! Runs an instrumented target under a persistent forkserver, collects the
//! shared coverage bitmap and per-edge hit counters the target writes, and
//! distills them into the signals a driving agent cares about: execution
//! cost, hottest edge, new coverage, new per-edge maximum.

pub mod classify;
pub mod feedback;
pub mod forkserver;
pub mod shmem;
pub mod signals;
pub mod target;
pub mod testcase;

pub use classify::classify_counts;
pub use feedback::{hotspot, summed_cost, total_cost, FeedbackEngine, NewCoverage};
pub use forkserver::{Fault, ForkServer};
pub use shmem::SharedTelemetry;
pub use target::TargetSpec;
pub use testcase::TestcaseIo;

/// Size of the coverage bitmap, one byte per edge. Must match the value the
/// target's instrumentation was built with.
pub const MAP_SIZE: usize = 1 << 16;

/// Number of 32-bit performance counters. Slot 0 aggregates the total cost;
/// slots 1.. are per-edge hit counts.
pub const PERF_SIZE: usize = 1 << 16;

/// Environment variable carrying the shared-memory id to the target.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
