//! The storage contract a `DataManager` is generic over (spec.md
//! §4.2). Concrete backends live in the `epochstore-backends` crate so
//! that this crate never pulls in a KV engine directly.

use std::fmt;
use thiserror::Error;

/// The three keyspaces a backend partitions its data into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// gid -> RecordType name, one entry per known record.
    Index,
    /// (gid || field name) -> encoded field value.
    Trait,
    /// advisory lock key -> secret.
    Lock,
}

#[derive(Error, Debug)]
pub enum KvError {
    #[error("backend I/O error: {0}")]
    Io(String),
    #[error("value too large for a single entry ({size} bytes)")]
    TooLarge { size: usize },
    #[error("backend is read-only")]
    ReadOnly,
}

/// What actually happened when releasing an advisory lock, so callers
/// can tell a clean release from the two failure modes spec.md §4.3
/// names rather than have them silently swallowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlockOutcome {
    Released,
    AlreadyFree,
    Mismatch,
}

/// One key/value write, scoped to a namespace.
pub struct Put {
    pub namespace: Namespace,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Put {
    pub fn new(namespace: Namespace, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Put {
            namespace,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The KV contract spec.md §4.2 names. Implementations own their own
/// growth/retry policy internally; none of that is visible here.
pub trait Backend: Send + Sync {
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Apply a batch of writes atomically.
    fn put_many(&self, puts: Vec<Put>) -> Result<(), KvError>;

    /// Remove a record's entire on-disk footprint in one transaction:
    /// every `Trait` entry keyed by `prefix || fieldname`, plus the
    /// `Index` entry keyed by `prefix` itself (spec.md §4.2's
    /// `delete_prefix`, which spans both namespaces by design since
    /// unbinding a record must be all-or-nothing).
    fn delete_prefix(&self, prefix: &[u8]) -> Result<(), KvError>;

    /// Iterate a namespace in key order.
    fn iter(&self, namespace: Namespace) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, KvError>;

    /// Attempt to take the advisory lock at `key`, storing `secret` if
    /// acquired (or if `secret` already owns it — reentrant). Returns
    /// whether the lock is now held by `secret`.
    fn lock_try(&self, key: &[u8], secret: &[u8]) -> Result<bool, KvError>;

    /// Release the advisory lock at `key`. Distinguishes an actual
    /// release from finding the key already free or held by a
    /// different secret (spec.md §4.3) instead of treating both as a
    /// no-op success.
    fn unlock(&self, key: &[u8], secret: &[u8]) -> Result<UnlockOutcome, KvError>;
}

impl fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<dyn Backend>")
    }
}
