//! `ccpool` Core Library
//!
//! Shared functionality for the `ccpool` scheduler and binary:
//! - Configuration resolution and hierarchy
//! - Logging initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, IgnoredOverride, LogConfig, PoolConfig};
pub use error::{Error, Result};
