//! Concurrent compilation scheduler.
//!
//! - [`CompilerPool`]: admission under a concurrency cap, non-blocking
//!   harvesting, and a timeout-bounded drain with guaranteed teardown.
//! - [`CompileCommand`] / [`Job`]: what gets launched for one source file.
//! - [`JobReport`] / [`ReportSink`]: the per-job output and where it goes.

pub mod compiler_pool;
pub mod job;
pub mod report;


pub use compiler_pool::{CompilerPool, DEFAULT_POLL_INTERVAL, PoolError, PoolPhase};
pub use job::{Collected, CompileCommand, Job};
pub use report::{JobReport, JobStatus, MemorySink, ReportSink, StdoutSink};
