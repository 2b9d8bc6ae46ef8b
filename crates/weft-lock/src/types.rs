//! Lock tiers and bulk lock requests

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lock tier, ordered by strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    /// Shared; excludes writers of both kinds
    Read,
    /// Shared among non-exclusive writers; excludes readers and exclusive writers
    WriteNonEx,
    /// Exclusive
    Write,
}

impl LockType {
    /// Stable lowercase name, used in logs and metric labels
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::WriteNonEx => "write_non_ex",
            Self::Write => "write",
        }
    }

    /// Whether a holder of `self` may coexist with a holder of `other`
    pub const fn is_compatible_with(self, other: LockType) -> bool {
        matches!(
            (self, other),
            (Self::Read, Self::Read) | (Self::WriteNonEx, Self::WriteNonEx)
        )
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key together with the strongest tier requested for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDescription {
    /// Lock key
    pub key: String,
    /// Strongest requested tier
    pub lock_type: LockType,
}

/// A batch of lock requests for bulk enter/leave.
///
/// The same key may be requested several times at different tiers; the batch folds
/// them to the strongest tier and orders keys ascending, which is the acquisition
/// order every caller shares.
///
/// ```rust,ignore
/// let set = LockSet::new()
///     .read("job:17")
///     .write_non_ex("queue")
///     .write("doc:abc");
/// manager.enter_locks(&set)?;
/// // ...
/// manager.leave_locks(&set)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct LockSet {
    requests: Vec<(String, LockType)>,
}

impl LockSet {
    /// Create an empty lock set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from separate read, non-exclusive-write and write key lists
    pub fn from_keys<R, N, W>(read: R, non_ex_write: N, write: W) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        let mut set = Self::new();
        for key in read {
            set.push(key, LockType::Read);
        }
        for key in non_ex_write {
            set.push(key, LockType::WriteNonEx);
        }
        for key in write {
            set.push(key, LockType::Write);
        }
        set
    }

    /// Request a read lock
    pub fn read(mut self, key: impl Into<String>) -> Self {
        self.push(key, LockType::Read);
        self
    }

    /// Request a non-exclusive write lock
    pub fn write_non_ex(mut self, key: impl Into<String>) -> Self {
        self.push(key, LockType::WriteNonEx);
        self
    }

    /// Request an exclusive write lock
    pub fn write(mut self, key: impl Into<String>) -> Self {
        self.push(key, LockType::Write);
        self
    }

    /// Add a request
    pub fn push(&mut self, key: impl Into<String>, lock_type: LockType) {
        self.requests.push((key.into(), lock_type));
    }

    /// Number of raw requests (before folding)
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no locks are requested
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Fold to the strongest tier per key, sorted by key ascending
    pub fn descriptions(&self) -> Vec<LockDescription> {
        let mut merged: BTreeMap<&str, LockType> = BTreeMap::new();
        for (key, lock_type) in &self.requests {
            merged
                .entry(key.as_str())
                .and_modify(|t| *t = (*t).max(*lock_type))
                .or_insert(*lock_type);
        }
        merged
            .into_iter()
            .map(|(key, lock_type)| LockDescription {
                key: key.to_string(),
                lock_type,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_type_ordering() {
        assert!(LockType::Read < LockType::WriteNonEx);
        assert!(LockType::WriteNonEx < LockType::Write);
        assert_eq!(LockType::Read.max(LockType::Write), LockType::Write);
    }

    #[test]
    fn test_compatibility() {
        assert!(LockType::Read.is_compatible_with(LockType::Read));
        assert!(LockType::WriteNonEx.is_compatible_with(LockType::WriteNonEx));
        assert!(!LockType::Read.is_compatible_with(LockType::WriteNonEx));
        assert!(!LockType::WriteNonEx.is_compatible_with(LockType::Read));
        assert!(!LockType::Write.is_compatible_with(LockType::Write));
        assert!(!LockType::Read.is_compatible_with(LockType::Write));
    }

    #[test]
    fn test_descriptions_fold_and_sort() {
        let set = LockSet::new()
            .read("b")
            .write("a")
            .read("c")
            .write_non_ex("b")
            .read("a");

        let descs = set.descriptions();
        let keys: Vec<&str> = descs.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(descs[0].lock_type, LockType::Write);
        assert_eq!(descs[1].lock_type, LockType::WriteNonEx);
        assert_eq!(descs[2].lock_type, LockType::Read);
    }

    #[test]
    fn test_from_keys() {
        let set = LockSet::from_keys(["x", "y"], Vec::<String>::new(), ["y"]);
        assert_eq!(set.len(), 3);
        let descs = set.descriptions();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[1].key, "y");
        assert_eq!(descs[1].lock_type, LockType::Write);
    }

    #[test]
    fn test_empty_set() {
        let set = LockSet::new();
        assert!(set.is_empty());
        assert!(set.descriptions().is_empty());
    }
}
