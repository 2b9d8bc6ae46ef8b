//! Global lock primitive registry
//!
//! A [`LockRegistry`] hands out one [`LockObject`] per key. An object counts its
//! holders and waiters; once neither remain it is marked expired and dropped from the
//! registry so the key space does not grow without bound. A caller that fetched an
//! object just before it expired gets [`ObjectError::Expired`] and must fetch again.
//!
//! Lock order is registry map, then object state. Entering only touches the object;
//! expiry takes both.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use weft_core::metrics::LockMetrics;
use weft_core::{Error, ThreadContext};

use crate::coordination::CoordinationBackend;
use crate::types::LockType;

/// Why a primitive operation did not complete
#[derive(Debug)]
pub(crate) enum ObjectError {
    /// The object was retired; fetch a fresh one and retry
    Expired,
    /// Contention in no-wait mode
    Unavailable,
    /// Interruption or backend failure
    Failed(Error),
}

impl From<Error> for ObjectError {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

#[derive(Debug, Default)]
struct ObjectState {
    readers: u32,
    non_ex_writers: u32,
    writer: bool,
    waiters: u32,
    expired: bool,
}

impl ObjectState {
    fn admits(&self, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Read => !self.writer && self.non_ex_writers == 0,
            LockType::WriteNonEx => !self.writer && self.readers == 0,
            LockType::Write => !self.writer && self.readers == 0 && self.non_ex_writers == 0,
        }
    }

    fn grant(&mut self, lock_type: LockType) {
        match lock_type {
            LockType::Read => self.readers += 1,
            LockType::WriteNonEx => self.non_ex_writers += 1,
            LockType::Write => self.writer = true,
        }
    }

    fn revoke(&mut self, lock_type: LockType) {
        match lock_type {
            LockType::Read => {
                debug_assert!(self.readers > 0);
                self.readers = self.readers.saturating_sub(1);
            }
            LockType::WriteNonEx => {
                debug_assert!(self.non_ex_writers > 0);
                self.non_ex_writers = self.non_ex_writers.saturating_sub(1);
            }
            LockType::Write => {
                debug_assert!(self.writer);
                self.writer = false;
            }
        }
    }

    fn is_unreferenced(&self) -> bool {
        self.readers == 0 && self.non_ex_writers == 0 && !self.writer && self.waiters == 0
    }
}

/// Mutex-like object backing one lock key
#[derive(Debug)]
pub struct LockObject {
    key: String,
    state: Mutex<ObjectState>,
    changed: Condvar,
}

impl LockObject {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: Mutex::new(ObjectState::default()),
            changed: Condvar::new(),
        }
    }

    /// Key this object guards
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the object has been retired from its registry
    pub fn is_expired(&self) -> bool {
        self.state.lock().expired
    }
}

/// Keyed store of lock objects sharing one coordination backend
#[derive(Debug)]
pub struct LockRegistry {
    namespace: &'static str,
    objects: Mutex<HashMap<String, Arc<LockObject>>>,
    backend: Arc<dyn CoordinationBackend>,
    wait_poll_interval: Duration,
}

impl LockRegistry {
    /// Create a registry.
    ///
    /// `namespace` labels logs and metrics; `wait_poll_interval` bounds how long a
    /// blocked waiter goes without checking its interrupt flag.
    pub fn new(
        namespace: &'static str,
        backend: Arc<dyn CoordinationBackend>,
        wait_poll_interval: Duration,
    ) -> Self {
        Self {
            namespace,
            objects: Mutex::new(HashMap::new()),
            backend,
            wait_poll_interval,
        }
    }

    /// Registry namespace
    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// Whether holds extend beyond this process
    pub fn is_cross_process(&self) -> bool {
        self.backend.is_cross_process()
    }

    /// Number of live (non-expired) lock objects
    pub fn live_objects(&self) -> usize {
        self.objects.lock().len()
    }

    /// Fetch or create the object for `key`
    pub(crate) fn object(&self, key: &str) -> Arc<LockObject> {
        let mut objects = self.objects.lock();
        if let Some(object) = objects.get(key) {
            return Arc::clone(object);
        }
        let object = Arc::new(LockObject::new(key));
        objects.insert(key.to_string(), Arc::clone(&object));
        LockMetrics::set_live_objects(self.namespace, objects.len());
        object
    }

    /// Take `lock_type` on `object`, blocking on contention unless `wait` is false
    pub(crate) fn enter(
        &self,
        object: &Arc<LockObject>,
        lock_type: LockType,
        ctx: &ThreadContext,
        wait: bool,
    ) -> Result<(), ObjectError> {
        {
            let mut state = object.state.lock();
            if state.expired {
                return Err(ObjectError::Expired);
            }
            if !state.admits(lock_type) {
                if !wait {
                    return Err(ObjectError::Unavailable);
                }
                let started = Instant::now();
                state.waiters += 1;
                while !state.admits(lock_type) {
                    if ctx.is_interrupted() {
                        state.waiters -= 1;
                        let unreferenced = state.is_unreferenced();
                        drop(state);
                        if unreferenced {
                            self.expire_if_unreferenced(object);
                        }
                        return Err(ObjectError::Failed(Error::interrupted(format!(
                            "{} waiting for {} lock '{}'",
                            ctx.name(),
                            lock_type,
                            object.key
                        ))));
                    }
                    object
                        .changed
                        .wait_for(&mut state, self.wait_poll_interval);
                }
                state.waiters -= 1;
                LockMetrics::record_wait(started.elapsed());
            }
            state.grant(lock_type);
        }

        if let Err(e) = self.enter_backend(object, lock_type, ctx, wait) {
            self.release_local(object, lock_type);
            return Err(e);
        }
        LockMetrics::increment_acquired(lock_type.as_str());
        Ok(())
    }

    fn enter_backend(
        &self,
        object: &LockObject,
        lock_type: LockType,
        ctx: &ThreadContext,
        wait: bool,
    ) -> Result<(), ObjectError> {
        loop {
            if self.backend.try_enter(&object.key, lock_type)? {
                return Ok(());
            }
            if !wait {
                return Err(ObjectError::Unavailable);
            }
            ctx.check_interrupted(&format!(
                "waiting for cross-process {} lock '{}'",
                lock_type, object.key
            ))?;
            std::thread::sleep(self.backend.retry_interval());
        }
    }

    /// Give back `lock_type` on `object`.
    ///
    /// On a backend failure the local hold is kept so the caller can retry.
    pub(crate) fn leave(&self, object: &Arc<LockObject>, lock_type: LockType) -> weft_core::Result<()> {
        self.backend.leave(&object.key, lock_type)?;
        self.release_local(object, lock_type);
        Ok(())
    }

    fn release_local(&self, object: &Arc<LockObject>, lock_type: LockType) {
        let unreferenced = {
            let mut state = object.state.lock();
            state.revoke(lock_type);
            object.changed.notify_all();
            state.is_unreferenced()
        };
        if unreferenced {
            self.expire_if_unreferenced(object);
        }
    }

    fn expire_if_unreferenced(&self, object: &Arc<LockObject>) {
        let mut objects = self.objects.lock();
        let mut state = object.state.lock();
        if state.expired || !state.is_unreferenced() {
            return;
        }
        let registered = objects
            .get(&object.key)
            .is_some_and(|current| Arc::ptr_eq(current, object));
        if registered {
            state.expired = true;
            objects.remove(&object.key);
            trace!(namespace = self.namespace, key = %object.key, "Expired lock object");
            LockMetrics::set_live_objects(self.namespace, objects.len());
        }
    }
}
