//! The production `Backend`: three LMDB environments under a database
//! root directory, with the map-size growth and stale-view reopen
//! retry loops spec.md §4.2 requires (grounded on
//! `original_source/zjb/dos/lmdb_data_manager.py`'s `__put`/`__begin`).

use epochstore::backend::{Backend, KvError, Namespace, Put, UnlockOutcome};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const META_MAP_SIZE: usize = 1024 * 1024;
const LOCK_MAP_SIZE: usize = 1024 * 1024;
/// `0x100000` read big-endian, matching the original's 3-byte literal
/// (`int.from_bytes` defaults to big-endian): exactly 1 MiB.
const DEFAULT_DATA_MAP_SIZE: usize = 0x100000;
const MAX_DATA_MAP_SIZE_INCREASE: usize = 1024 * 1024 * 1024;
const DATA_MAP_SIZE_KEY: &str = "data_map_size";

#[derive(Error, Debug)]
pub enum HeedError {
    #[error("failed to create database directory: {0}")]
    CreateDir(std::io::Error),
    #[error("lmdb error: {0}")]
    Lmdb(#[from] heed::Error),
}

/// Doubles the map size, unless it already exceeds 1 GiB, in which
/// case it grows by a flat 1 GiB (spec.md's `GROWTH_POLICY`).
fn grown_size(current: usize) -> usize {
    if current > MAX_DATA_MAP_SIZE_INCREASE {
        current + MAX_DATA_MAP_SIZE_INCREASE
    } else {
        current * 2
    }
}

fn is_map_full(err: &heed::Error) -> bool {
    matches!(
        err,
        heed::Error::Mdb(heed::MdbError::MapFull)
    )
}

fn is_stale_view(err: &heed::Error) -> bool {
    matches!(
        err,
        heed::Error::Mdb(heed::MdbError::BadTxn) | heed::Error::Mdb(heed::MdbError::BadRslot)
    )
}

struct Envs {
    meta_env: Env,
    data_env: Env,
    lock_env: Env,
    index_db: Database<Bytes, Bytes>,
    trait_db: Database<Bytes, Bytes>,
    lock_db: Database<Bytes, Bytes>,
}

impl Envs {
    fn open(root: &Path) -> Result<Self, HeedError> {
        std::fs::create_dir_all(root.join("meta.mdb")).map_err(HeedError::CreateDir)?;
        std::fs::create_dir_all(root.join("data.mdb")).map_err(HeedError::CreateDir)?;
        std::fs::create_dir_all(root.join("lock.mdb")).map_err(HeedError::CreateDir)?;

        let meta_env = unsafe {
            EnvOpenOptions::new()
                .map_size(META_MAP_SIZE)
                .open(root.join("meta.mdb"))?
        };

        let data_map_size = {
            let rtxn = meta_env.read_txn()?;
            let db: Option<Database<Bytes, Bytes>> = meta_env.open_database(&rtxn, None)?;
            db.and_then(|db| db.get(&rtxn, DATA_MAP_SIZE_KEY.as_bytes()).ok().flatten())
                .map(|bytes| usize::from_be_bytes(bytes.try_into().unwrap_or([0; 8])))
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_DATA_MAP_SIZE)
        };

        let data_env = unsafe {
            EnvOpenOptions::new()
                .map_size(data_map_size)
                .max_dbs(2)
                .open(root.join("data.mdb"))?
        };
        let (index_db, trait_db) = {
            let mut wtxn = data_env.write_txn()?;
            let index_db = data_env.create_database(&mut wtxn, Some("index"))?;
            let trait_db = data_env.create_database(&mut wtxn, Some("trait"))?;
            wtxn.commit()?;
            (index_db, trait_db)
        };

        let lock_env = unsafe {
            EnvOpenOptions::new()
                .map_size(LOCK_MAP_SIZE)
                .open(root.join("lock.mdb"))?
        };
        let lock_db = {
            let mut wtxn = lock_env.write_txn()?;
            let db = lock_env.create_database(&mut wtxn, Some("lock"))?;
            wtxn.commit()?;
            db
        };

        Ok(Envs {
            meta_env,
            data_env,
            lock_env,
            index_db,
            trait_db,
            lock_db,
        })
    }
}

/// LMDB-backed `Backend`. A database root directory holds three
/// sub-environments (spec.md §6): `meta.mdb` (current data map size),
/// `data.mdb` (`index`/`trait` sub-databases), `lock.mdb` (advisory
/// locks).
pub struct HeedBackend {
    root: PathBuf,
    envs: RwLock<Envs>,
}

impl HeedBackend {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, HeedError> {
        let root = root.into();
        let envs = Envs::open(&root)?;
        Ok(HeedBackend {
            root,
            envs: RwLock::new(envs),
        })
    }

    fn reopen(&self) -> Result<(), KvError> {
        debug!(root = %self.root.display(), "reopening lmdb environment");
        let fresh = Envs::open(&self.root).map_err(|e| KvError::Io(e.to_string()))?;
        *self.envs.write() = fresh;
        Ok(())
    }

    fn grow_and_retry(&self) -> Result<(), KvError> {
        let current = self.envs.read().data_env.info().map_size;
        let new_size = grown_size(current);
        debug!(old = current, new = new_size, "data map full, growing");

        let envs = self.envs.read();
        let mut meta_wtxn = envs.meta_env.write_txn().map_err(to_kv)?;
        let meta_db: Database<Bytes, Bytes> = envs
            .meta_env
            .open_database(&meta_wtxn, None)
            .map_err(to_kv)?
            .ok_or_else(|| KvError::Io("meta database missing".into()))?;
        meta_db
            .put(
                &mut meta_wtxn,
                DATA_MAP_SIZE_KEY.as_bytes(),
                &new_size.to_be_bytes(),
            )
            .map_err(to_kv)?;
        meta_wtxn.commit().map_err(to_kv)?;

        unsafe {
            envs.data_env.resize(new_size).map_err(to_kv)?;
        }
        Ok(())
    }
}

fn to_kv(e: heed::Error) -> KvError {
    KvError::Io(e.to_string())
}

impl Backend for HeedBackend {
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        loop {
            let (db, env) = {
                let envs = self.envs.read();
                let db = match namespace {
                    Namespace::Index => envs.index_db,
                    Namespace::Trait => envs.trait_db,
                    Namespace::Lock => envs.lock_db,
                };
                let env = match namespace {
                    Namespace::Lock => envs.lock_env.clone(),
                    _ => envs.data_env.clone(),
                };
                (db, env)
            };
            let rtxn = match env.read_txn() {
                Ok(txn) => txn,
                Err(e) => {
                    if is_stale_view(&e) {
                        self.reopen()?;
                        continue;
                    }
                    return Err(to_kv(e));
                }
            };
            return Ok(db.get(&rtxn, key).map_err(to_kv)?.map(|v| v.to_vec()));
        }
    }

    fn put_many(&self, puts: Vec<Put>) -> Result<(), KvError> {
        let (lock_puts, data_puts): (Vec<_>, Vec<_>) =
            puts.into_iter().partition(|p| p.namespace == Namespace::Lock);

        if !lock_puts.is_empty() {
            let envs = self.envs.read();
            let mut wtxn = envs.lock_env.write_txn().map_err(to_kv)?;
            for put in &lock_puts {
                envs.lock_db.put(&mut wtxn, &put.key, &put.value).map_err(to_kv)?;
            }
            wtxn.commit().map_err(to_kv)?;
        }

        if data_puts.is_empty() {
            return Ok(());
        }

        loop {
            let result = {
                let envs = self.envs.read();
                let attempt = (|| -> Result<(), heed::Error> {
                    let mut wtxn = envs.data_env.write_txn()?;
                    for put in &data_puts {
                        let db = match put.namespace {
                            Namespace::Index => &envs.index_db,
                            Namespace::Trait => &envs.trait_db,
                            Namespace::Lock => unreachable!("partitioned out above"),
                        };
                        db.put(&mut wtxn, &put.key, &put.value)?;
                    }
                    wtxn.commit()
                })();
                attempt
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if is_map_full(&e) => {
                    self.grow_and_retry()?;
                }
                Err(e) if is_stale_view(&e) => {
                    self.reopen()?;
                }
                Err(e) => return Err(to_kv(e)),
            }
        }
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<(), KvError> {
        loop {
            let envs = self.envs.read();
            let attempt = (|| -> Result<(), heed::Error> {
                let mut wtxn = envs.data_env.write_txn()?;
                {
                    let mut cursor = envs.trait_db.prefix_iter_mut(&mut wtxn, prefix)?;
                    while cursor.next().transpose()?.is_some() {
                        // SAFETY: no other live iterator over this db.
                        unsafe { cursor.del_current()? };
                    }
                }
                envs.index_db.delete(&mut wtxn, prefix)?;
                wtxn.commit()
            })();

            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if is_stale_view(&e) => {
                    drop(envs);
                    self.reopen()?;
                }
                Err(e) => return Err(to_kv(e)),
            }
        }
    }

    fn iter(
        &self,
        namespace: Namespace,
    ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, KvError> {
        let envs = self.envs.read();
        let (env, db) = match namespace {
            Namespace::Index => (&envs.data_env, &envs.index_db),
            Namespace::Trait => (&envs.data_env, &envs.trait_db),
            Namespace::Lock => (&envs.lock_env, &envs.lock_db),
        };
        let rtxn = env.read_txn().map_err(to_kv)?;
        let entries: Vec<(Vec<u8>, Vec<u8>)> = db
            .iter(&rtxn)
            .map_err(to_kv)?
            .filter_map(|entry| entry.ok())
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        Ok(Box::new(entries.into_iter()))
    }

    fn lock_try(&self, key: &[u8], secret: &[u8]) -> Result<bool, KvError> {
        let envs = self.envs.read();
        let mut wtxn = envs.lock_env.write_txn().map_err(to_kv)?;
        let held = envs.lock_db.get(&wtxn, key).map_err(to_kv)?;
        let result = match held {
            Some(existing) if existing == secret => true,
            Some(_) => false,
            None => {
                envs.lock_db.put(&mut wtxn, key, secret).map_err(to_kv)?;
                true
            }
        };
        wtxn.commit().map_err(to_kv)?;
        Ok(result)
    }

    fn unlock(&self, key: &[u8], secret: &[u8]) -> Result<UnlockOutcome, KvError> {
        let envs = self.envs.read();
        let mut wtxn = envs.lock_env.write_txn().map_err(to_kv)?;
        let held = envs.lock_db.get(&wtxn, key).map_err(to_kv)?;
        let outcome = match held {
            None => UnlockOutcome::AlreadyFree,
            Some(existing) if existing != secret => UnlockOutcome::Mismatch,
            Some(_) => {
                envs.lock_db.delete(&mut wtxn, key).map_err(to_kv)?;
                UnlockOutcome::Released
            }
        };
        wtxn.commit().map_err(to_kv)?;
        Ok(outcome)
    }
}
