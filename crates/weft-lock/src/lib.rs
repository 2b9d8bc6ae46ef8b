//! # weft-lock
//!
//! Reentrant multi-granularity locking for crawler worker threads.
//!
//! ## Tiers
//!
//! | tier              | shares with              | excludes                  |
//! |-------------------|--------------------------|---------------------------|
//! | read              | read                     | both write tiers          |
//! | non-exclusive write | non-exclusive write    | read, exclusive write     |
//! | exclusive write   | nothing                  | everything                |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use weft_lock::{LockSet, LockSystem};
//! use weft_core::ThreadContext;
//!
//! let system = LockSystem::in_process();
//! let mut locks = system.manager(ThreadContext::current());
//!
//! let set = LockSet::new().read("seeds").write("job:17");
//! locks.enter_locks(&set)?;
//! // ...
//! locks.leave_locks(&set)?;
//! ```
//!
//! Bulk acquisition always proceeds in ascending key order, so two threads locking
//! overlapping sets cannot deadlock on each other.
//!
//! With a configured sync directory, locks are additionally coordinated across
//! processes through [`FileCoordination`]; critical sections never leave the process.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod coordination;
pub mod manager;
pub mod registry;
pub mod service;
pub mod system;
pub mod types;

pub use coordination::{CoordinationBackend, FileCoordination, InProcessCoordination};
pub use manager::{LockCounts, LockManager};
pub use registry::{LockObject, LockRegistry};
pub use service::{FileServiceRegistry, InMemoryServiceRegistry, ServiceHandle, ServiceRegistry};
pub use system::LockSystem;
pub use types::{LockDescription, LockSet, LockType};
