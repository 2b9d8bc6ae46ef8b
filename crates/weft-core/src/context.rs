//! Execution context for worker threads
//!
//! A [`ThreadContext`] identifies the worker on whose behalf a blocking call runs and
//! carries its interrupt flag. Clones share the flag, so a supervisor holding a clone can
//! interrupt a worker blocked in a pool or lock wait; the wait then returns
//! [`Error::Interrupted`].
//!
//! ```rust,ignore
//! let ctx = ThreadContext::new("worker-3");
//! let supervisor = ctx.clone();
//! std::thread::spawn(move || run_worker(ctx));
//! // ... later, on shutdown
//! supervisor.interrupt();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Interruptible execution context of one worker thread
#[derive(Clone)]
pub struct ThreadContext {
    name: Arc<str>,
    interrupted: Arc<AtomicBool>,
}

impl ThreadContext {
    /// Create a context with the given worker name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a context named after the current OS thread
    pub fn current() -> Self {
        let thread = std::thread::current();
        let name = match thread.name() {
            Some(name) => name.to_string(),
            None => format!("{:?}", thread.id()),
        };
        Self::new(name)
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request interruption of any current or future blocking wait
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Whether an interrupt is pending
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Clear a pending interrupt, returning whether one was set
    pub fn clear_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Fail with [`Error::Interrupted`] if an interrupt is pending
    pub fn check_interrupted(&self, what: &str) -> Result<()> {
        if self.is_interrupted() {
            Err(Error::interrupted(format!("{} while {}", self.name, what)))
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking every `slice` to honor interrupts
    pub fn sleep(&self, duration: Duration, slice: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_interrupted("sleeping")?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(slice.min(deadline - now));
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("name", &self.name)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}
