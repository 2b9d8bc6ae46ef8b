//! Coordination backends
//!
//! A backend extends a lock beyond the current process. The lock registry first
//! settles contention between threads of this process, then asks the backend for the
//! same tier; only when both agree is the lock held.
//!
//! - [`InProcessCoordination`]: grants everything, so scope stays one process
//! - [`FileCoordination`]: per-key state files in a shared directory, guarded by a
//!   mutex file created with exclusive-create semantics
//!
//! ```text
//! <sync_directory>/locks/<sha256(key)>.state   "readers non_ex_writers writers"
//! <sync_directory>/locks/<sha256(key)>.lock    present while a process edits .state
//! ```

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use weft_core::config::CoordinationConfig;
use weft_core::{Error, Result};

use crate::types::LockType;

/// Cross-process extension of the lock primitive
pub trait CoordinationBackend: Send + Sync + fmt::Debug {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Whether locks taken through this backend are visible to other processes
    fn is_cross_process(&self) -> bool;

    /// How long a blocked acquirer waits before asking again
    fn retry_interval(&self) -> Duration {
        Duration::from_millis(25)
    }

    /// Try to take `lock_type` on `key`; `Ok(false)` means another holder conflicts
    fn try_enter(&self, key: &str, lock_type: LockType) -> Result<bool>;

    /// Give back a tier previously granted by [`try_enter`](Self::try_enter)
    fn leave(&self, key: &str, lock_type: LockType) -> Result<()>;
}

/// Process-local backend; every request is granted
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessCoordination;

impl CoordinationBackend for InProcessCoordination {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn is_cross_process(&self) -> bool {
        false
    }

    fn try_enter(&self, _key: &str, _lock_type: LockType) -> Result<bool> {
        Ok(true)
    }

    fn leave(&self, _key: &str, _lock_type: LockType) -> Result<()> {
        Ok(())
    }
}

/// Holder counts persisted in a key's state file
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FileLockState {
    readers: u32,
    non_ex_writers: u32,
    writers: u32,
}

impl FileLockState {
    fn parse(content: &str) -> Option<Self> {
        let mut parts = content.split_whitespace().map(str::parse::<u32>);
        let state = Self {
            readers: parts.next()?.ok()?,
            non_ex_writers: parts.next()?.ok()?,
            writers: parts.next()?.ok()?,
        };
        parts.next().is_none().then_some(state)
    }

    fn is_empty(&self) -> bool {
        self.readers == 0 && self.non_ex_writers == 0 && self.writers == 0
    }

    fn try_grant(&mut self, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Read if self.writers == 0 && self.non_ex_writers == 0 => {
                self.readers += 1;
                true
            }
            LockType::WriteNonEx if self.writers == 0 && self.readers == 0 => {
                self.non_ex_writers += 1;
                true
            }
            LockType::Write if self.is_empty() => {
                self.writers = 1;
                true
            }
            _ => false,
        }
    }

    fn revoke(&mut self, lock_type: LockType) -> bool {
        let count = match lock_type {
            LockType::Read => &mut self.readers,
            LockType::WriteNonEx => &mut self.non_ex_writers,
            LockType::Write => &mut self.writers,
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

/// Removes the mutex file when dropped
struct MutexFile<'a> {
    path: &'a Path,
}

impl Drop for MutexFile<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove lock mutex file");
        }
    }
}

/// Shared-directory backend for multi-process deployments
#[derive(Debug, Clone)]
pub struct FileCoordination {
    dir: PathBuf,
    poll_interval: Duration,
    stale_timeout: Duration,
}

impl FileCoordination {
    /// Create a backend rooted at `sync_directory`, creating `locks/` below it
    pub fn new(
        sync_directory: impl AsRef<Path>,
        poll_interval: Duration,
        stale_timeout: Duration,
    ) -> Result<Self> {
        let dir = sync_directory.as_ref().join("locks");
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::coordination_io(format!("cannot create {}", dir.display()), e)
        })?;
        Ok(Self {
            dir,
            poll_interval,
            stale_timeout,
        })
    }

    /// Build from configuration; `None` when no sync directory is configured
    pub fn from_config(config: &CoordinationConfig) -> Result<Option<Self>> {
        match &config.sync_directory {
            Some(dir) => Self::new(
                dir,
                config.file_poll_interval(),
                config.stale_mutex_timeout(),
            )
            .map(Some),
            None => Ok(None),
        }
    }

    /// Directory holding the state and mutex files
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        (
            self.dir.join(format!("{digest}.state")),
            self.dir.join(format!("{digest}.lock")),
        )
    }

    /// Try to create the key's mutex file without waiting; `None` while another
    /// holder has it. An abandoned file is broken and the create retried once.
    fn try_mutex<'a>(&self, key: &str, mutex_path: &'a Path) -> Result<Option<MutexFile<'a>>> {
        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(mutex_path)
            {
                Ok(_) => return Ok(Some(MutexFile { path: mutex_path })),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !self.break_if_stale(mutex_path) {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    return Err(Error::coordination_io(
                        format!("cannot create mutex file for '{key}'"),
                        e,
                    ))
                }
            }
        }
        Ok(None)
    }

    /// Remove `mutex_path` if abandoned; returns whether it was removed
    fn break_if_stale(&self, mutex_path: &Path) -> bool {
        if !self.is_stale(mutex_path) {
            return false;
        }
        // Move the file aside first so a mutex another process just created in its
        // place is never deleted by path.
        let claimed = mutex_path.with_extension(format!("lock.{}.stale", uuid::Uuid::new_v4()));
        if let Err(e) = std::fs::rename(mutex_path, &claimed) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %mutex_path.display(), error = %e, "Failed to claim abandoned lock mutex file");
            }
            return false;
        }
        self.discard_or_restore(mutex_path, &claimed)
    }

    /// Delete a claimed mutex file, or put it back if it turned out to be live.
    /// Returns whether the claimed file was abandoned.
    fn discard_or_restore(&self, mutex_path: &Path, claimed: &Path) -> bool {
        let abandoned = self.is_stale(claimed);
        if abandoned {
            warn!(path = %mutex_path.display(), "Removed abandoned lock mutex file");
        } else {
            match std::fs::hard_link(claimed, mutex_path) {
                Ok(()) => debug!(path = %mutex_path.display(), "Restored live lock mutex file"),
                Err(e) => warn!(
                    path = %mutex_path.display(),
                    error = %e,
                    "Failed to restore live lock mutex file"
                ),
            }
        }
        if let Err(e) = std::fs::remove_file(claimed) {
            warn!(path = %claimed.display(), error = %e, "Failed to remove claimed lock mutex file");
        }
        abandoned
    }

    fn is_stale(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.stale_timeout)
    }

    fn read_state(path: &Path) -> Result<FileLockState> {
        match std::fs::read_to_string(path) {
            Ok(content) => FileLockState::parse(&content).ok_or_else(|| {
                Error::coordination(format!("corrupt lock state file {}", path.display()))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(FileLockState::default()),
            Err(e) => Err(Error::coordination_io(
                format!("cannot read {}", path.display()),
                e,
            )),
        }
    }

    fn write_state(path: &Path, state: FileLockState) -> Result<()> {
        let io_err =
            |e: std::io::Error| Error::coordination_io(format!("cannot write {}", path.display()), e);

        if state.is_empty() {
            return match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err(e)),
            };
        }

        let tmp = path.with_extension("state.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
        writeln!(
            file,
            "{} {} {}",
            state.readers, state.non_ex_writers, state.writers
        )
        .map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }
}

impl CoordinationBackend for FileCoordination {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_cross_process(&self) -> bool {
        true
    }

    fn retry_interval(&self) -> Duration {
        self.poll_interval
    }

    fn try_enter(&self, key: &str, lock_type: LockType) -> Result<bool> {
        let (state_path, mutex_path) = self.paths(key);
        let Some(_mutex) = self.try_mutex(key, &mutex_path)? else {
            debug!(key, tier = %lock_type, "Cross-process lock state busy");
            return Ok(false);
        };
        let mut state = Self::read_state(&state_path)?;
        if !state.try_grant(lock_type) {
            debug!(key, tier = %lock_type, ?state, "Cross-process lock contended");
            return Ok(false);
        }
        Self::write_state(&state_path, state)?;
        Ok(true)
    }

    fn leave(&self, key: &str, lock_type: LockType) -> Result<()> {
        let (state_path, mutex_path) = self.paths(key);
        let _mutex = loop {
            match self.try_mutex(key, &mutex_path)? {
                Some(mutex) => break mutex,
                None => std::thread::sleep(self.poll_interval),
            }
        };
        let mut state = Self::read_state(&state_path)?;
        if !state.revoke(lock_type) {
            warn!(key, tier = %lock_type, "Cross-process lock state had no such holder");
            return Ok(());
        }
        Self::write_state(&state_path, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &Path) -> FileCoordination {
        FileCoordination::new(dir, Duration::from_millis(1), Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_in_process_always_grants() {
        let backend = InProcessCoordination;
        assert!(!backend.is_cross_process());
        assert!(backend.try_enter("k", LockType::Write).unwrap());
        assert!(backend.try_enter("k", LockType::Write).unwrap());
        backend.leave("k", LockType::Write).unwrap();
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(
            FileLockState::parse("1 0 0\n"),
            Some(FileLockState {
                readers: 1,
                non_ex_writers: 0,
                writers: 0
            })
        );
        assert_eq!(FileLockState::parse("1 0"), None);
        assert_eq!(FileLockState::parse("1 0 0 4"), None);
        assert_eq!(FileLockState::parse("a b c"), None);
    }

    #[test]
    fn test_readers_share_writers_exclude() {
        let dir = tempfile::tempdir().unwrap();
        let a = backend(dir.path());
        let b = backend(dir.path());

        assert!(a.try_enter("doc", LockType::Read).unwrap());
        assert!(b.try_enter("doc", LockType::Read).unwrap());
        assert!(!b.try_enter("doc", LockType::Write).unwrap());
        assert!(!b.try_enter("doc", LockType::WriteNonEx).unwrap());

        a.leave("doc", LockType::Read).unwrap();
        b.leave("doc", LockType::Read).unwrap();
        assert!(b.try_enter("doc", LockType::Write).unwrap());
        assert!(!a.try_enter("doc", LockType::Read).unwrap());
        b.leave("doc", LockType::Write).unwrap();
    }

    #[test]
    fn test_non_ex_writers_share() {
        let dir = tempfile::tempdir().unwrap();
        let a = backend(dir.path());
        assert!(a.try_enter("q", LockType::WriteNonEx).unwrap());
        assert!(a.try_enter("q", LockType::WriteNonEx).unwrap());
        assert!(!a.try_enter("q", LockType::Read).unwrap());
        a.leave("q", LockType::WriteNonEx).unwrap();
        a.leave("q", LockType::WriteNonEx).unwrap();
        assert!(a.try_enter("q", LockType::Read).unwrap());
    }

    #[test]
    fn test_state_file_removed_when_free() {
        let dir = tempfile::tempdir().unwrap();
        let a = backend(dir.path());
        let (state_path, mutex_path) = a.paths("job:1");

        assert!(a.try_enter("job:1", LockType::Write).unwrap());
        assert!(state_path.exists());
        assert!(!mutex_path.exists());

        a.leave("job:1", LockType::Write).unwrap();
        assert!(!state_path.exists());
    }

    #[test]
    fn test_stale_mutex_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileCoordination::new(dir.path(), Duration::from_millis(5), Duration::from_millis(20))
            .unwrap();
        let (_, mutex_path) = a.paths("orphan");
        std::fs::write(&mutex_path, b"").unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert!(a.try_enter("orphan", LockType::Read).unwrap());
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let a = backend(dir.path());
        let (state_path, _) = a.paths("bad");
        std::fs::write(&state_path, b"garbage").unwrap();

        let err = a.try_enter("bad", LockType::Read).unwrap_err();
        assert_eq!(err.category(), weft_core::ErrorCategory::Coordination);
    }

    #[test]
    fn test_from_config() {
        assert!(FileCoordination::from_config(&CoordinationConfig::default())
            .unwrap()
            .is_none());

        let dir = tempfile::tempdir().unwrap();
        let config = CoordinationConfig::default().with_sync_directory(dir.path());
        let backend = FileCoordination::from_config(&config).unwrap().unwrap();
        assert!(backend.directory().ends_with("locks"));
        assert!(backend.is_cross_process());
    }

    #[test]
    fn test_busy_mutex_refuses_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let a = backend(dir.path());
        let (state_path, mutex_path) = a.paths("doc");
        std::fs::write(&mutex_path, b"").unwrap();

        let started = std::time::Instant::now();
        assert!(!a.try_enter("doc", LockType::Write).unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(mutex_path.exists());
        assert!(!state_path.exists());

        std::fs::remove_file(&mutex_path).unwrap();
        assert!(a.try_enter("doc", LockType::Write).unwrap());
    }

    #[test]
    fn test_live_mutex_claimed_by_mistake_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let a = backend(dir.path());
        let (_, mutex_path) = a.paths("doc");

        // Another process recreated the mutex between our age check and our rename
        std::fs::write(&mutex_path, b"").unwrap();
        let claimed = mutex_path.with_extension("lock.test.stale");
        std::fs::rename(&mutex_path, &claimed).unwrap();

        assert!(!a.discard_or_restore(&mutex_path, &claimed));
        assert!(mutex_path.exists());
        assert!(!claimed.exists());
        assert!(!a.try_enter("doc", LockType::Read).unwrap());
    }

    #[test]
    fn test_stale_mutex_leaves_no_claimed_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileCoordination::new(dir.path(), Duration::from_millis(5), Duration::from_millis(20))
            .unwrap();
        let (_, mutex_path) = a.paths("orphan");
        std::fs::write(&mutex_path, b"").unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert!(a.break_if_stale(&mutex_path));
        assert!(!mutex_path.exists());
        assert_eq!(std::fs::read_dir(a.directory()).unwrap().count(), 0);
    }
}
