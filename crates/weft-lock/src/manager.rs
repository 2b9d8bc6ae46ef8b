//! Per-thread lock manager
//!
//! A [`LockManager`] folds every lock a thread takes on a key into a single hold on the
//! global primitive. Nested requests at an equal or weaker tier only bump a local
//! counter; the primitive is given back once every counter for the key reaches zero.
//!
//! Critical sections use the same folding against a separate, always process-local
//! registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use weft_core::metrics::LockMetrics;
use weft_core::{Error, Result, ThreadContext};

use crate::registry::{LockObject, LockRegistry, ObjectError};
use crate::types::{LockSet, LockType};

/// Local hold counts for one key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCounts {
    /// Outstanding read enters
    pub read: u32,
    /// Outstanding non-exclusive write enters
    pub non_ex_write: u32,
    /// Outstanding exclusive write enters
    pub write: u32,
}

impl LockCounts {
    /// Count for one tier
    pub fn get(&self, lock_type: LockType) -> u32 {
        match lock_type {
            LockType::Read => self.read,
            LockType::WriteNonEx => self.non_ex_write,
            LockType::Write => self.write,
        }
    }

    fn get_mut(&mut self, lock_type: LockType) -> &mut u32 {
        match lock_type {
            LockType::Read => &mut self.read,
            LockType::WriteNonEx => &mut self.non_ex_write,
            LockType::Write => &mut self.write,
        }
    }

    /// Sum over all tiers
    pub fn total(&self) -> u32 {
        self.read + self.non_ex_write + self.write
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Whether a new request at `lock_type` may nest over what is held
    fn permits(&self, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Read => true,
            LockType::WriteNonEx => self.non_ex_write > 0 || self.write > 0,
            LockType::Write => self.write > 0,
        }
    }
}

#[derive(Debug)]
struct LocalLock {
    counts: LockCounts,
    acquired: LockType,
    object: Arc<LockObject>,
}

/// Folded holds of one thread against one registry
#[derive(Debug)]
struct HeldLocks {
    kind: &'static str,
    registry: Arc<LockRegistry>,
    entries: HashMap<String, LocalLock>,
}

impl HeldLocks {
    fn new(kind: &'static str, registry: Arc<LockRegistry>) -> Self {
        Self {
            kind,
            registry,
            entries: HashMap::new(),
        }
    }

    fn enter(&mut self, ctx: &ThreadContext, key: &str, lock_type: LockType, wait: bool) -> Result<()> {
        debug!(thread = ctx.name(), kind = self.kind, key, tier = %lock_type, wait, "Entering");

        if let Some(entry) = self.entries.get_mut(key) {
            if !entry.counts.permits(lock_type) {
                return Err(Error::illegal_sequence(format!(
                    "{} cannot enter {} {} '{}' while holding {:?}",
                    ctx.name(),
                    lock_type,
                    self.kind,
                    key,
                    entry.counts
                )));
            }
            *entry.counts.get_mut(lock_type) += 1;
            return Ok(());
        }

        let object = loop {
            let object = self.registry.object(key);
            match self.registry.enter(&object, lock_type, ctx, wait) {
                Ok(()) => break object,
                Err(ObjectError::Expired) => {
                    LockMetrics::increment_expired_retries();
                }
                Err(ObjectError::Unavailable) => {
                    LockMetrics::increment_unavailable();
                    return Err(Error::lock_unavailable(key));
                }
                Err(ObjectError::Failed(e)) => return Err(e),
            }
        };

        let mut counts = LockCounts::default();
        *counts.get_mut(lock_type) = 1;
        self.entries.insert(
            key.to_string(),
            LocalLock {
                counts,
                acquired: lock_type,
                object,
            },
        );
        Ok(())
    }

    fn leave(&mut self, ctx: &ThreadContext, key: &str, lock_type: LockType) -> Result<()> {
        debug!(thread = ctx.name(), kind = self.kind, key, tier = %lock_type, "Leaving");

        let entry = match self.entries.get_mut(key) {
            Some(entry) if entry.counts.get(lock_type) > 0 => entry,
            _ => {
                return Err(Error::illegal_sequence(format!(
                    "{} cannot leave {} {} '{}' it does not hold",
                    ctx.name(),
                    lock_type,
                    self.kind,
                    key
                )))
            }
        };

        if entry.counts.total() > 1 {
            *entry.counts.get_mut(lock_type) -= 1;
            return Ok(());
        }

        self.registry.leave(&entry.object, entry.acquired)?;
        self.entries.remove(key);
        Ok(())
    }

    fn enter_all(&mut self, ctx: &ThreadContext, set: &LockSet, wait: bool) -> Result<()> {
        let descriptions = set.descriptions();
        for (index, description) in descriptions.iter().enumerate() {
            let Err(e) = self.enter(ctx, &description.key, description.lock_type, wait) else {
                continue;
            };

            LockMetrics::increment_bulk_unwinds();
            for done in descriptions[..index].iter().rev() {
                if let Err(unwind) = self.leave(ctx, &done.key, done.lock_type) {
                    warn!(
                        thread = ctx.name(),
                        kind = self.kind,
                        key = %done.key,
                        error = %unwind,
                        "Failed to unwind bulk acquisition"
                    );
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn leave_all(&mut self, ctx: &ThreadContext, set: &LockSet) -> Result<()> {
        let mut first_error = None;
        for description in set.descriptions().iter().rev() {
            if let Err(e) = self.leave(ctx, &description.key, description.lock_type) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Give back every hold regardless of nesting depth
    fn clear(&mut self, ctx: &ThreadContext) -> Result<()> {
        let mut first_error = None;
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            match self.registry.leave(&entry.object, entry.acquired) {
                Ok(()) => {
                    debug!(thread = ctx.name(), kind = self.kind, key = %key, "Cleared");
                    self.entries.remove(&key);
                }
                Err(e) => {
                    warn!(thread = ctx.name(), kind = self.kind, key = %key, error = %e, "Failed to clear");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn held(&self, key: &str) -> Option<LockType> {
        self.entries.get(key).map(|entry| entry.acquired)
    }

    fn counts(&self, key: &str) -> LockCounts {
        self.entries
            .get(key)
            .map(|entry| entry.counts)
            .unwrap_or_default()
    }
}

/// Lock manager owned by a single worker thread.
///
/// Obtained from [`crate::LockSystem::manager`]. All holds still outstanding when the
/// manager is dropped are released.
///
/// ```rust,ignore
/// let mut locks = system.manager(ThreadContext::current());
/// locks.enter_write_lock("job:17")?;
/// locks.enter_read_lock("job:17")?; // nested, no global round trip
/// locks.leave_read_lock("job:17")?;
/// locks.leave_write_lock("job:17")?;
/// ```
#[derive(Debug)]
pub struct LockManager {
    ctx: ThreadContext,
    wait_poll_interval: Duration,
    locks: HeldLocks,
    sections: HeldLocks,
}

impl LockManager {
    pub(crate) fn new(
        ctx: ThreadContext,
        locks: Arc<LockRegistry>,
        sections: Arc<LockRegistry>,
        wait_poll_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            wait_poll_interval,
            locks: HeldLocks::new("lock", locks),
            sections: HeldLocks::new("critical section", sections),
        }
    }

    /// Context of the owning thread
    pub fn context(&self) -> &ThreadContext {
        &self.ctx
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Take a read lock, waiting on contention
    pub fn enter_read_lock(&mut self, key: &str) -> Result<()> {
        self.locks.enter(&self.ctx, key, LockType::Read, true)
    }

    /// Take a read lock or fail with [`Error::LockUnavailable`]
    pub fn enter_read_lock_no_wait(&mut self, key: &str) -> Result<()> {
        self.locks.enter(&self.ctx, key, LockType::Read, false)
    }

    /// Release one read lock
    pub fn leave_read_lock(&mut self, key: &str) -> Result<()> {
        self.locks.leave(&self.ctx, key, LockType::Read)
    }

    /// Take a non-exclusive write lock, waiting on contention
    pub fn enter_non_ex_write_lock(&mut self, key: &str) -> Result<()> {
        self.locks.enter(&self.ctx, key, LockType::WriteNonEx, true)
    }

    /// Take a non-exclusive write lock or fail with [`Error::LockUnavailable`]
    pub fn enter_non_ex_write_lock_no_wait(&mut self, key: &str) -> Result<()> {
        self.locks.enter(&self.ctx, key, LockType::WriteNonEx, false)
    }

    /// Release one non-exclusive write lock
    pub fn leave_non_ex_write_lock(&mut self, key: &str) -> Result<()> {
        self.locks.leave(&self.ctx, key, LockType::WriteNonEx)
    }

    /// Take an exclusive write lock, waiting on contention
    pub fn enter_write_lock(&mut self, key: &str) -> Result<()> {
        self.locks.enter(&self.ctx, key, LockType::Write, true)
    }

    /// Take an exclusive write lock or fail with [`Error::LockUnavailable`]
    pub fn enter_write_lock_no_wait(&mut self, key: &str) -> Result<()> {
        self.locks.enter(&self.ctx, key, LockType::Write, false)
    }

    /// Release one exclusive write lock
    pub fn leave_write_lock(&mut self, key: &str) -> Result<()> {
        self.locks.leave(&self.ctx, key, LockType::Write)
    }

    /// Take every lock in `set` in ascending key order.
    ///
    /// On failure the locks taken so far are released in reverse order and the
    /// triggering error is returned.
    pub fn enter_locks(&mut self, set: &LockSet) -> Result<()> {
        self.locks.enter_all(&self.ctx, set, true)
    }

    /// Like [`enter_locks`](Self::enter_locks) but never waits
    pub fn enter_locks_no_wait(&mut self, set: &LockSet) -> Result<()> {
        self.locks.enter_all(&self.ctx, set, false)
    }

    /// Release every lock in `set` in descending key order, reporting the first failure
    pub fn leave_locks(&mut self, set: &LockSet) -> Result<()> {
        self.locks.leave_all(&self.ctx, set)
    }

    /// Release all locks this thread holds, whatever the nesting depth
    pub fn clear_locks(&mut self) -> Result<()> {
        self.locks.clear(&self.ctx)
    }

    // ------------------------------------------------------------------
    // Critical sections
    // ------------------------------------------------------------------

    /// Enter a read critical section
    pub fn enter_read_critical_section(&mut self, key: &str) -> Result<()> {
        self.sections.enter(&self.ctx, key, LockType::Read, true)
    }

    /// Leave a read critical section
    pub fn leave_read_critical_section(&mut self, key: &str) -> Result<()> {
        self.sections.leave(&self.ctx, key, LockType::Read)
    }

    /// Enter a non-exclusive write critical section
    pub fn enter_non_ex_write_critical_section(&mut self, key: &str) -> Result<()> {
        self.sections.enter(&self.ctx, key, LockType::WriteNonEx, true)
    }

    /// Leave a non-exclusive write critical section
    pub fn leave_non_ex_write_critical_section(&mut self, key: &str) -> Result<()> {
        self.sections.leave(&self.ctx, key, LockType::WriteNonEx)
    }

    /// Enter an exclusive write critical section
    pub fn enter_write_critical_section(&mut self, key: &str) -> Result<()> {
        self.sections.enter(&self.ctx, key, LockType::Write, true)
    }

    /// Leave an exclusive write critical section
    pub fn leave_write_critical_section(&mut self, key: &str) -> Result<()> {
        self.sections.leave(&self.ctx, key, LockType::Write)
    }

    /// Enter every critical section in `set` in ascending key order
    pub fn enter_critical_sections(&mut self, set: &LockSet) -> Result<()> {
        self.sections.enter_all(&self.ctx, set, true)
    }

    /// Leave every critical section in `set`
    pub fn leave_critical_sections(&mut self, set: &LockSet) -> Result<()> {
        self.sections.leave_all(&self.ctx, set)
    }

    /// Leave all critical sections this thread is in
    pub fn clear_critical_sections(&mut self) -> Result<()> {
        self.sections.clear(&self.ctx)
    }

    // ------------------------------------------------------------------
    // Misc
    // ------------------------------------------------------------------

    /// Sleep for `duration`, failing early with [`Error::Interrupted`]
    pub fn timed_wait(&self, duration: Duration) -> Result<()> {
        self.ctx.sleep(duration, self.wait_poll_interval)
    }

    /// Tier held on the global primitive for `key`, if any
    pub fn holds_lock(&self, key: &str) -> Option<LockType> {
        self.locks.held(key)
    }

    /// Local nesting counts for `key`
    pub fn lock_counts(&self, key: &str) -> LockCounts {
        self.locks.counts(key)
    }

    /// Number of distinct keys locked by this thread
    pub fn held_lock_count(&self) -> usize {
        self.locks.entries.len()
    }

    /// Tier held for critical section `key`, if any
    pub fn holds_critical_section(&self, key: &str) -> Option<LockType> {
        self.sections.held(key)
    }

    /// Local nesting counts for critical section `key`
    pub fn critical_section_counts(&self, key: &str) -> LockCounts {
        self.sections.counts(key)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        let outstanding = self.locks.entries.len() + self.sections.entries.len();
        if outstanding == 0 {
            return;
        }
        warn!(
            thread = self.ctx.name(),
            locks = self.locks.entries.len(),
            sections = self.sections.entries.len(),
            "Lock manager dropped with outstanding holds, releasing"
        );
        let _ = self.locks.clear(&self.ctx);
        let _ = self.sections.clear(&self.ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InProcessCoordination;

    fn manager() -> LockManager {
        let registry = |name: &'static str| {
            Arc::new(LockRegistry::new(
                name,
                Arc::new(InProcessCoordination),
                Duration::from_millis(5),
            ))
        };
        LockManager::new(
            ThreadContext::new("test"),
            registry("locks"),
            registry("sections"),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn test_counts_permit_nesting() {
        let held_read = LockCounts {
            read: 1,
            ..Default::default()
        };
        assert!(held_read.permits(LockType::Read));
        assert!(!held_read.permits(LockType::WriteNonEx));
        assert!(!held_read.permits(LockType::Write));

        let held_non_ex = LockCounts {
            non_ex_write: 1,
            ..Default::default()
        };
        assert!(held_non_ex.permits(LockType::Read));
        assert!(held_non_ex.permits(LockType::WriteNonEx));
        assert!(!held_non_ex.permits(LockType::Write));

        let held_write = LockCounts {
            write: 1,
            ..Default::default()
        };
        assert!(held_write.permits(LockType::WriteNonEx));
        assert!(held_write.permits(LockType::Write));
    }

    #[test]
    fn test_nested_enter_folds_into_one_hold() {
        let mut m = manager();
        m.enter_write_lock("k").unwrap();
        m.enter_read_lock("k").unwrap();
        m.enter_non_ex_write_lock("k").unwrap();
        assert_eq!(m.holds_lock("k"), Some(LockType::Write));
        assert_eq!(
            m.lock_counts("k"),
            LockCounts {
                read: 1,
                non_ex_write: 1,
                write: 1
            }
        );
        assert_eq!(m.locks.registry.live_objects(), 1);

        m.leave_write_lock("k").unwrap();
        m.leave_read_lock("k").unwrap();
        // Still held at the acquired tier
        assert_eq!(m.holds_lock("k"), Some(LockType::Write));
        m.leave_non_ex_write_lock("k").unwrap();
        assert_eq!(m.holds_lock("k"), None);
        assert_eq!(m.locks.registry.live_objects(), 0);
    }

    #[test]
    fn test_upgrade_is_illegal_and_leaves_state() {
        let mut m = manager();
        m.enter_read_lock("k").unwrap();

        let err = m.enter_write_lock("k").unwrap_err();
        assert!(matches!(err, Error::IllegalLockSequence { .. }));
        let err = m.enter_non_ex_write_lock("k").unwrap_err();
        assert!(matches!(err, Error::IllegalLockSequence { .. }));
        assert_eq!(m.lock_counts("k").total(), 1);

        m.leave_read_lock("k").unwrap();
        assert_eq!(m.held_lock_count(), 0);
    }

    #[test]
    fn test_leave_unheld_tier_is_illegal() {
        let mut m = manager();
        assert!(matches!(
            m.leave_read_lock("nothing"),
            Err(Error::IllegalLockSequence { .. })
        ));

        m.enter_write_lock("k").unwrap();
        assert!(matches!(
            m.leave_read_lock("k"),
            Err(Error::IllegalLockSequence { .. })
        ));
        assert_eq!(m.lock_counts("k").write, 1);
        m.leave_write_lock("k").unwrap();
    }

    #[test]
    fn test_sections_are_separate_from_locks() {
        let mut m = manager();
        m.enter_write_lock("k").unwrap();
        m.enter_write_critical_section("k").unwrap();
        assert_eq!(m.holds_critical_section("k"), Some(LockType::Write));
        assert_eq!(m.critical_section_counts("k").write, 1);

        m.leave_write_critical_section("k").unwrap();
        assert_eq!(m.holds_lock("k"), Some(LockType::Write));
        assert_eq!(m.holds_critical_section("k"), None);
        m.leave_write_lock("k").unwrap();
    }

    #[test]
    fn test_clear_releases_all_depths() {
        let mut m = manager();
        m.enter_read_lock("a").unwrap();
        m.enter_read_lock("a").unwrap();
        m.enter_write_lock("b").unwrap();
        m.enter_read_critical_section("c").unwrap();

        m.clear_locks().unwrap();
        assert_eq!(m.held_lock_count(), 0);
        assert_eq!(m.locks.registry.live_objects(), 0);
        assert_eq!(m.holds_critical_section("c"), Some(LockType::Read));

        m.clear_critical_sections().unwrap();
        assert_eq!(m.sections.registry.live_objects(), 0);
    }

    #[test]
    fn test_timed_wait_interrupted() {
        let m = manager();
        m.context().interrupt();
        let err = m.timed_wait(Duration::from_secs(5)).unwrap_err();
        assert!(err.is_interrupted());
    }

    #[test]
    fn test_drop_releases_holds() {
        let registry = Arc::new(LockRegistry::new(
            "locks",
            Arc::new(InProcessCoordination),
            Duration::from_millis(5),
        ));
        let sections = Arc::new(LockRegistry::new(
            "sections",
            Arc::new(InProcessCoordination),
            Duration::from_millis(5),
        ));
        {
            let mut m = LockManager::new(
                ThreadContext::new("dropped"),
                Arc::clone(&registry),
                Arc::clone(&sections),
                Duration::from_millis(5),
            );
            m.enter_write_lock("k").unwrap();
            m.enter_read_critical_section("s").unwrap();
        }
        assert_eq!(registry.live_objects(), 0);
        assert_eq!(sections.live_objects(), 0);
    }
}
