//! # weft-core
//!
//! Shared building blocks for the weft crawler core:
//!
//! - **Errors**: one [`Error`] taxonomy for lock manager and connector pool
//! - **Thread context**: [`ThreadContext`], the interruptible identity of a worker thread
//! - **Configuration**: [`Config`], loaded from YAML with environment expansion
//! - **Metrics**: `metrics` facade helpers for locks and pools

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;

pub use config::{Config, CoordinationConfig, PoolSettings};
pub use context::ThreadContext;
pub use error::{Error, ErrorCategory, Result};
