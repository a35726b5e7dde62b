//! The persistence engine (spec.md §4.5): commits value graphs to a
//! `Backend`, maintains the weak identity cache, and hands out
//! advisory locks.

use crate::{
    backend::{Backend, KvError, Namespace, Put},
    codec::{self, CodecError, DecodeContext, EncodeContext},
    id::Gid,
    lock::Lock,
    record::{Record, RecordType},
    value::Value,
};
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("record is already bound to a manager")]
    AlreadyBound,
    #[error("value graph references a record owned by a different manager")]
    CrossManager,
    #[error("field not present in the backend")]
    MissingField,
    #[error("record is not bound to this manager")]
    UnboundAccess,
    #[error("record is not bound to any manager")]
    Unbound,
    #[error(transparent)]
    Backend(#[from] KvError),
    #[error(transparent)]
    Codec(CodecError),
    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),
}

impl From<CodecError> for ManagerError {
    fn from(value: CodecError) -> Self {
        match value {
            CodecError::CrossManager => ManagerError::CrossManager,
            other => ManagerError::Codec(other),
        }
    }
}

struct ManagerInner {
    id: Gid,
    backend: Arc<dyn Backend>,
    cache: scc::HashMap<Gid, std::sync::Weak<crate::record::RecordInner>>,
}

/// A handle to an open database. Cheap to clone; every clone shares
/// the same backend connection and identity cache.
///
/// Two `DataManager`s opened on the same backend are still distinct
/// managers — manager identity is per-`open()` call, not per-directory
/// (spec.md §4.5, §9: cross-process sharing happens through the
/// backend, not through manager identity).
#[derive(Clone)]
pub struct DataManager(Arc<ManagerInner>);

impl DataManager {
    pub fn open(backend: Arc<dyn Backend>) -> Self {
        DataManager(Arc::new(ManagerInner {
            id: Gid::new(),
            backend,
            cache: scc::HashMap::default(),
        }))
    }

    pub fn id(&self) -> Gid {
        self.0.id
    }

    /// Persist `record` and its transitive closure of unmanaged
    /// records in a single atomic commit (spec.md §4.5 algorithm).
    pub fn bind(&self, record: &Record) -> Result<(), ManagerError> {
        if record.is_bound() {
            return Err(ManagerError::AlreadyBound);
        }
        let (puts, processed) = self.close_package(vec![record.clone()])?;
        self.0.backend.put_many(puts)?;
        for r in processed {
            self.adopt(&r);
        }
        debug!(gid = %record.gid(), "bound record");
        Ok(())
    }

    /// Delete a bound record's entire on-disk footprint. Does not
    /// cascade: records still referencing this one will fail with
    /// `MissingField` on resolution (spec.md §9, left as-is).
    pub fn unbind(&self, record: &Record) -> Result<(), ManagerError> {
        match record.manager() {
            Some(m) if m.id() == self.id() => {}
            _ => return Err(ManagerError::UnboundAccess),
        }
        self.0.backend.delete_prefix(record.gid().as_ref())?;
        self.0.cache.remove(&record.gid());
        record.set_manager(None);
        debug!(gid = %record.gid(), "unbound record");
        Ok(())
    }

    /// Restartable iteration over every bound record, in GID order.
    pub fn iter(&self) -> Result<impl Iterator<Item = Record> + '_, ManagerError> {
        let entries = self.0.backend.iter(Namespace::Index)?;
        let this = self.clone();
        Ok(entries.filter_map(move |(key, value)| {
            let gid = Gid::from_bytes(&key);
            let kind_value = codec::decode(&value, &this.decode_ctx()).ok()?;
            let kind = RecordType::new(kind_value.as_str()?.to_owned());
            Some(this.lookup_or_rehydrate(gid, kind))
        }))
    }

    pub fn get_field(&self, record: &Record, name: &str) -> Result<Value, ManagerError> {
        let bytes = self
            .0
            .backend
            .get(Namespace::Trait, &field_key(record.gid(), name))?
            .ok_or(ManagerError::MissingField)?;
        Ok(codec::decode(&bytes, &self.decode_ctx())?)
    }

    pub fn set_field(&self, record: &Record, name: &str, value: Value) -> Result<(), ManagerError> {
        let mut seen = HashSet::new();
        let mut ctx = CommitCtx {
            manager_id: self.id(),
            seen: &mut seen,
            newly_enqueued: Vec::new(),
        };
        let bytes = codec::encode(&value, &mut ctx)?;
        let mut puts = vec![Put::new(
            Namespace::Trait,
            field_key(record.gid(), name),
            bytes,
        )];

        let (closure_puts, processed) = self.close_package(ctx.newly_enqueued)?;
        puts.extend(closure_puts);

        self.0.backend.put_many(puts)?;
        for r in processed {
            self.adopt(&r);
        }
        Ok(())
    }

    pub fn allocate_lock(&self, record: &Record, field: Option<&str>) -> Lock {
        match field {
            Some(f) => Lock::for_field(self.0.backend.clone(), record.gid(), f),
            None => Lock::for_record(self.0.backend.clone(), record.gid()),
        }
    }

    pub(crate) fn backend(&self) -> Arc<dyn Backend> {
        self.0.backend.clone()
    }

    /// Materialize a handle for a known `gid`/`kind` pair, sharing
    /// identity with any other live handle for the same `gid`. For
    /// callers (typed wrappers, job schedulers) that already know a
    /// record's kind from a field value rather than from `iter`'s
    /// index scan.
    pub fn rehydrate(&self, gid: Gid, kind: RecordType) -> Record {
        self.lookup_or_rehydrate(gid, kind)
    }

    /// Get-if-live-else-materialize-and-cache (spec.md §3's identity
    /// cache, shared by decode's reference resolution and `iter`).
    pub(crate) fn lookup_or_rehydrate(&self, gid: Gid, kind: RecordType) -> Record {
        let live = self
            .0
            .cache
            .read(&gid, |_, weak| weak.upgrade())
            .flatten();
        if let Some(inner) = live {
            return Record(inner);
        }
        let record = Record::rehydrate(self.clone(), gid, kind);
        let _ = self.0.cache.insert(gid, Arc::downgrade(&record.0));
        record
    }

    fn decode_ctx(&self) -> ManagerDecodeCtx<'_> {
        ManagerDecodeCtx { manager: self }
    }

    fn adopt(&self, record: &Record) {
        record.set_manager(Some(self.clone()));
        let _ = self.0.cache.insert(record.gid(), Arc::downgrade(&record.0));
    }

    /// The closure step of spec.md §4.5's commit algorithm: drains a
    /// work queue of unmanaged records, encoding each one's index
    /// entry and store fields, enqueueing further unmanaged records
    /// discovered along the way. Placeholder-marking against cycles
    /// is `seen`, populated from the initial queue before the first
    /// record is processed.
    fn close_package(&self, initial: Vec<Record>) -> Result<(Vec<Put>, Vec<Record>), ManagerError> {
        let mut seen: HashSet<Gid> = initial.iter().map(|r| r.gid()).collect();
        let mut queue: VecDeque<Record> = initial.into();
        let mut puts = Vec::new();
        let mut processed = Vec::new();

        while let Some(record) = queue.pop_front() {
            let mut ctx = CommitCtx {
                manager_id: self.id(),
                seen: &mut seen,
                newly_enqueued: Vec::new(),
            };

            let kind_bytes = codec::encode(&Value::Str(record.kind().name().to_owned()), &mut ctx)?;
            puts.push(Put::new(Namespace::Index, record.gid().as_ref().to_vec(), kind_bytes));

            for field in record.store_fields() {
                let value = record
                    .get(&field)
                    .expect("unmanaged record's field read never touches a manager");
                let bytes = codec::encode(&value, &mut ctx)?;
                puts.push(Put::new(Namespace::Trait, field_key(record.gid(), &field), bytes));
            }

            queue.extend(ctx.newly_enqueued);
            processed.push(record);
        }

        Ok((puts, processed))
    }
}

fn field_key(gid: Gid, name: &str) -> Vec<u8> {
    let mut key = gid.as_ref().to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

struct CommitCtx<'a> {
    manager_id: Gid,
    seen: &'a mut HashSet<Gid>,
    newly_enqueued: Vec<Record>,
}

impl EncodeContext for CommitCtx<'_> {
    fn resolve(&mut self, record: &Record) -> Result<(), CodecError> {
        match record.manager() {
            Some(m) if m.id() != self.manager_id => Err(CodecError::CrossManager),
            Some(_) => Ok(()),
            None => {
                if self.seen.insert(record.gid()) {
                    self.newly_enqueued.push(record.clone());
                }
                Ok(())
            }
        }
    }
}

struct ManagerDecodeCtx<'a> {
    manager: &'a DataManager,
}

impl DecodeContext for ManagerDecodeCtx<'_> {
    fn rehydrate(&self, gid: Gid, kind: RecordType) -> Record {
        self.manager.lookup_or_rehydrate(gid, kind)
    }
}
