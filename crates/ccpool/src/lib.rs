//! ccpool
//!
//! Drives a bounded pool of external compiler invocations: admits or queues
//! work under a concurrency cap, harvests finished compilers without
//! blocking, reports their combined output, and drains the pool under a
//! timeout with guaranteed teardown of anything still running.

pub mod plan;
pub mod pool;
