//! An in-memory `Backend`, for tests that don't need a filesystem.

use epochstore::backend::{Backend, KvError, Namespace, Put, UnlockOutcome};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
struct Namespaces {
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    r#trait: BTreeMap<Vec<u8>, Vec<u8>>,
    lock: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// Single-process, single-host backend backed by ordinary `BTreeMap`s.
/// No growth policy, no persistence across restarts — a stand-in for
/// `HeedBackend` in unit tests.
#[derive(Default)]
pub struct MemoryBackend(Mutex<Namespaces>);

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let ns = self.0.lock();
        let map = match namespace {
            Namespace::Index => &ns.index,
            Namespace::Trait => &ns.r#trait,
            Namespace::Lock => &ns.lock,
        };
        Ok(map.get(key).cloned())
    }

    fn put_many(&self, puts: Vec<Put>) -> Result<(), KvError> {
        let mut ns = self.0.lock();
        for put in puts {
            let map = match put.namespace {
                Namespace::Index => &mut ns.index,
                Namespace::Trait => &mut ns.r#trait,
                Namespace::Lock => &mut ns.lock,
            };
            map.insert(put.key, put.value);
        }
        Ok(())
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<(), KvError> {
        let mut ns = self.0.lock();
        ns.r#trait.retain(|k, _| !k.starts_with(prefix));
        ns.index.remove(prefix);
        Ok(())
    }

    fn iter(
        &self,
        namespace: Namespace,
    ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, KvError> {
        let ns = self.0.lock();
        let map = match namespace {
            Namespace::Index => &ns.index,
            Namespace::Trait => &ns.r#trait,
            Namespace::Lock => &ns.lock,
        };
        let entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(Box::new(entries.into_iter()))
    }

    fn lock_try(&self, key: &[u8], secret: &[u8]) -> Result<bool, KvError> {
        let mut ns = self.0.lock();
        match ns.lock.get(key) {
            Some(held_by) if held_by != secret => Ok(false),
            _ => {
                ns.lock.insert(key.to_vec(), secret.to_vec());
                Ok(true)
            }
        }
    }

    fn unlock(&self, key: &[u8], secret: &[u8]) -> Result<UnlockOutcome, KvError> {
        let mut ns = self.0.lock();
        match ns.lock.get(key) {
            None => Ok(UnlockOutcome::AlreadyFree),
            Some(held_by) if held_by.as_slice() != secret => Ok(UnlockOutcome::Mismatch),
            Some(_) => {
                ns.lock.remove(key);
                Ok(UnlockOutcome::Released)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let backend = MemoryBackend::new();
        backend
            .put_many(vec![Put::new(Namespace::Trait, b"k".to_vec(), b"v".to_vec())])
            .unwrap();
        assert_eq!(
            backend.get(Namespace::Trait, b"k").unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn delete_prefix_clears_index_and_trait_entries() {
        let backend = MemoryBackend::new();
        backend
            .put_many(vec![
                Put::new(Namespace::Index, b"gid1".to_vec(), b"kind".to_vec()),
                Put::new(Namespace::Trait, b"gid1name".to_vec(), b"val".to_vec()),
                Put::new(Namespace::Index, b"gid2".to_vec(), b"kind".to_vec()),
            ])
            .unwrap();
        backend.delete_prefix(b"gid1").unwrap();
        assert_eq!(backend.get(Namespace::Index, b"gid1").unwrap(), None);
        assert_eq!(backend.get(Namespace::Trait, b"gid1name").unwrap(), None);
        assert!(backend.get(Namespace::Index, b"gid2").unwrap().is_some());
    }

    #[test]
    fn lock_try_is_mutually_exclusive_and_reentrant() {
        let backend = MemoryBackend::new();
        assert!(backend.lock_try(b"k", b"secret-a").unwrap());
        assert!(backend.lock_try(b"k", b"secret-a").unwrap());
        assert!(!backend.lock_try(b"k", b"secret-b").unwrap());
        assert_eq!(
            backend.unlock(b"k", b"secret-a").unwrap(),
            UnlockOutcome::Released
        );
        assert!(backend.lock_try(b"k", b"secret-b").unwrap());
    }

    #[test]
    fn unlock_reports_free_and_mismatched_keys() {
        let backend = MemoryBackend::new();
        assert_eq!(
            backend.unlock(b"k", b"secret-a").unwrap(),
            UnlockOutcome::AlreadyFree
        );
        backend.lock_try(b"k", b"secret-a").unwrap();
        assert_eq!(
            backend.unlock(b"k", b"secret-b").unwrap(),
            UnlockOutcome::Mismatch
        );
    }
}
