//! Advisory locks (spec.md §4.3): backend-agnostic, reentrant within
//! the same secret, mutually exclusive across secrets.

use crate::backend::{Backend, UnlockOutcome};
use std::{sync::Arc, thread, time::Duration};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum LockError {
    #[error(transparent)]
    Backend(#[from] crate::backend::KvError),
    #[error("lock is held by another owner")]
    Contended,
    #[error("lock is not currently held")]
    UnlockFree,
    #[error("lock is held by a different owner")]
    UnlockMismatch,
}

/// A single advisory lock, identified by an opaque key. `DataLock`
/// (key = gid) and `TraitLock` (key = gid || field name) from spec.md
/// §4.3 are both just different key shapes, built by the two
/// constructors below.
pub struct Lock {
    backend: Arc<dyn Backend>,
    key: Vec<u8>,
    secret: [u8; 16],
}

impl Lock {
    /// `DataLock`-shaped: keyed on the record's gid alone.
    pub fn for_record(backend: Arc<dyn Backend>, gid: crate::id::Gid) -> Self {
        Lock::new(backend, gid.as_ref().to_vec())
    }

    /// `TraitLock`-shaped: keyed on gid + field name.
    pub fn for_field(backend: Arc<dyn Backend>, gid: crate::id::Gid, field: &str) -> Self {
        let mut key = gid.as_ref().to_vec();
        key.extend_from_slice(field.as_bytes());
        Lock::new(backend, key)
    }

    fn new(backend: Arc<dyn Backend>, key: Vec<u8>) -> Self {
        let mut secret = [0u8; 16];
        getrandom::getrandom(&mut secret).expect("system RNG unavailable");
        Lock {
            backend,
            key,
            secret,
        }
    }

    /// Try to take the lock once, without blocking.
    pub fn try_acquire(&self) -> Result<bool, LockError> {
        Ok(self.backend.lock_try(&self.key, &self.secret)?)
    }

    /// Block until the lock is acquired, polling every 10ms.
    pub fn acquire(&self) -> Result<(), LockError> {
        loop {
            if self.try_acquire()? {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn release(&self) -> Result<(), LockError> {
        match self.backend.unlock(&self.key, &self.secret)? {
            UnlockOutcome::Released => Ok(()),
            UnlockOutcome::AlreadyFree => Err(LockError::UnlockFree),
            UnlockOutcome::Mismatch => Err(LockError::UnlockMismatch),
        }
    }

    /// Block until acquired, then wrap in a guard that releases on
    /// drop.
    pub fn acquire_guard(self) -> LockGuard {
        // Acquisition failure here (backend error) can only surface
        // as a stuck guard; callers that need a fallible acquire
        // should use `acquire()` directly and build the guard
        // themselves. In practice this is only called from
        // `Record::with_lock`, which already knows the backend is up.
        self.acquire().expect("lock backend unavailable");
        LockGuard { lock: Some(self) }
    }
}

/// RAII handle releasing its `Lock` on drop.
pub struct LockGuard {
    lock: Option<Lock>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let _ = lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvError, Namespace as Ns, Put};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeLockBackend {
        locks: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    }

    impl Backend for FakeLockBackend {
        fn get(&self, _ns: Ns, _key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
            Ok(None)
        }
        fn put_many(&self, _puts: Vec<Put>) -> Result<(), KvError> {
            Ok(())
        }
        fn delete_prefix(&self, _prefix: &[u8]) -> Result<(), KvError> {
            Ok(())
        }
        fn iter(
            &self,
            _ns: Ns,
        ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, KvError> {
            Ok(Box::new(std::iter::empty()))
        }
        fn lock_try(&self, key: &[u8], secret: &[u8]) -> Result<bool, KvError> {
            let mut locks = self.locks.lock();
            match locks.get(key) {
                Some(held_by) if held_by != secret => Ok(false),
                _ => {
                    locks.insert(key.to_vec(), secret.to_vec());
                    Ok(true)
                }
            }
        }
        fn unlock(&self, key: &[u8], secret: &[u8]) -> Result<UnlockOutcome, KvError> {
            let mut locks = self.locks.lock();
            match locks.get(key) {
                None => Ok(UnlockOutcome::AlreadyFree),
                Some(held_by) if held_by.as_slice() != secret => Ok(UnlockOutcome::Mismatch),
                Some(_) => {
                    locks.remove(key);
                    Ok(UnlockOutcome::Released)
                }
            }
        }
    }

    #[test]
    fn same_key_different_secret_is_contended() {
        let backend: Arc<dyn Backend> = Arc::new(FakeLockBackend::default());
        let gid = crate::id::Gid::new();
        let a = Lock::for_record(backend.clone(), gid);
        let b = Lock::for_record(backend.clone(), gid);
        assert!(a.try_acquire().unwrap());
        assert!(!b.try_acquire().unwrap());
        a.release().unwrap();
        assert!(b.try_acquire().unwrap());
    }

    #[test]
    fn reacquiring_with_same_lock_instance_is_reentrant() {
        let backend: Arc<dyn Backend> = Arc::new(FakeLockBackend::default());
        let gid = crate::id::Gid::new();
        let a = Lock::for_record(backend, gid);
        assert!(a.try_acquire().unwrap());
        assert!(a.try_acquire().unwrap());
    }

    #[test]
    fn releasing_a_lock_never_held_fails_unlock_free() {
        let backend: Arc<dyn Backend> = Arc::new(FakeLockBackend::default());
        let gid = crate::id::Gid::new();
        let a = Lock::for_record(backend, gid);
        assert!(matches!(a.release(), Err(LockError::UnlockFree)));
    }

    #[test]
    fn releasing_someone_elses_lock_fails_unlock_mismatch() {
        let backend: Arc<dyn Backend> = Arc::new(FakeLockBackend::default());
        let gid = crate::id::Gid::new();
        let a = Lock::for_record(backend.clone(), gid);
        let b = Lock::for_record(backend, gid);
        assert!(a.try_acquire().unwrap());
        assert!(matches!(b.release(), Err(LockError::UnlockMismatch)));
    }

    #[test]
    fn guard_releases_on_drop() {
        let backend: Arc<dyn Backend> = Arc::new(FakeLockBackend::default());
        let gid = crate::id::Gid::new();
        let a = Lock::for_record(backend.clone(), gid);
        {
            let _guard = a.acquire_guard();
            let b = Lock::for_record(backend.clone(), gid);
            assert!(!b.try_acquire().unwrap());
        }
        let b = Lock::for_record(backend, gid);
        assert!(b.try_acquire().unwrap());
    }
}
