//! The persisted entity type: identity, a typed field dictionary, and
//! the binding that routes reads/writes through a `DataManager`.

use crate::{id::Gid, manager::DataManager, value::Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, OnceLock},
};

/// Runtime-discriminable schema tag for a record.
///
/// Cheaply cloneable; compares and hashes by the interned name, so two
/// `RecordType`s constructed from equal strings (even read back from
/// the backend after a restart) compare equal.
#[derive(Clone, Eq, Serialize, Deserialize)]
pub struct RecordType(Arc<str>);

impl RecordType {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        RecordType(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl PartialEq for RecordType {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl std::hash::Hash for RecordType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state)
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordType({:?})", self.0)
    }
}

impl From<&str> for RecordType {
    fn from(s: &str) -> Self {
        RecordType::new(s)
    }
}

/// Process-wide map from a `RecordType`'s name to every store field
/// name ever declared for it, via either `RecordBuilder::build` or
/// `Record::declare_store_fields`. Lets a record rehydrated generically
/// (through `DataManager::iter`/`lookup_or_rehydrate`, with no caller
/// around to repeat the declaration) learn its own schema instead of
/// starting with an empty `store_fields` set.
fn schema_registry() -> &'static RwLock<HashMap<String, HashSet<String>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, HashSet<String>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn remember_schema<I>(kind: &RecordType, fields: I)
where
    I: IntoIterator<Item = String>,
{
    schema_registry()
        .write()
        .entry(kind.name().to_owned())
        .or_default()
        .extend(fields);
}

fn known_schema(kind: &RecordType) -> HashSet<String> {
    schema_registry()
        .read()
        .get(kind.name())
        .cloned()
        .unwrap_or_default()
}

/// The guts of a record, reference-counted so that `Record` handles
/// are cheap to clone and share identity.
///
/// This is the unit the manager's identity cache holds weakly: as
/// long as at least one strong `Record` handle for a `gid` is alive
/// somewhere in the process, looking that `gid` up again returns the
/// same `RecordInner`.
pub(crate) struct RecordInner {
    gid: Gid,
    kind: RecordType,
    store_fields: RwLock<HashSet<String>>,
    manager: RwLock<Option<DataManager>>,
    fields: RwLock<HashMap<String, Value>>,
}

/// A handle to a persisted (or not-yet-persisted) entity.
///
/// Cloning a `Record` shares identity — both handles refer to the same
/// `gid` and the same in-memory field cache. To produce a logically
/// distinct copy with a fresh identity, use [`Record::clone_deep`].
#[derive(Clone)]
pub struct Record(pub(crate) Arc<RecordInner>);

impl Record {
    pub fn gid(&self) -> Gid {
        self.0.gid
    }

    pub fn kind(&self) -> &RecordType {
        &self.0.kind
    }

    pub fn is_bound(&self) -> bool {
        self.0.manager.read().is_some()
    }

    pub fn manager(&self) -> Option<DataManager> {
        self.0.manager.read().clone()
    }

    pub(crate) fn set_manager(&self, manager: Option<DataManager>) {
        *self.0.manager.write() = manager;
    }

    pub fn store_fields(&self) -> HashSet<String> {
        self.0.store_fields.read().clone()
    }

    pub(crate) fn is_store_field(&self, name: &str) -> bool {
        self.0.store_fields.read().contains(name)
    }

    /// Register field names as persisted, both on this handle and in
    /// the process-wide schema registry `rehydrate` consults. Typed
    /// wrappers (`Job`, `GeneratorJob`) call this right after
    /// obtaining a `Record` handle, so that subsequent `get`/`set`
    /// calls route through the manager instead of reading an empty
    /// in-memory cache — and so any later rehydration of the same
    /// `RecordType` elsewhere in the process picks up the same fields
    /// automatically.
    pub fn declare_store_fields<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        self.0.store_fields.write().extend(names.iter().cloned());
        remember_schema(&self.0.kind, names);
    }

    /// Construct an empty shell for a record the manager knows exists
    /// (an INDEX entry was found) but whose fields haven't been
    /// fetched yet. `store_fields` is pre-populated from whatever this
    /// process has previously learned about records of this `kind`
    /// (via `RecordBuilder::build` or `declare_store_fields`), so field
    /// reads route through the bound manager without the caller having
    /// to repeat the declaration. All field reads on a rehydrated
    /// record go through the bound manager.
    pub(crate) fn rehydrate(manager: DataManager, gid: Gid, kind: RecordType) -> Record {
        let store_fields = known_schema(&kind);
        Record(Arc::new(RecordInner {
            gid,
            kind,
            store_fields: RwLock::new(store_fields),
            manager: RwLock::new(Some(manager)),
            fields: RwLock::new(HashMap::new()),
        }))
    }

    /// Read a field. Routes through the bound manager when the field
    /// is a store field and the record is bound; otherwise returns
    /// the in-memory cached value (or `Value::Null` if never set).
    pub fn get(&self, name: &str) -> Result<Value, crate::manager::ManagerError> {
        let bound = self.0.manager.read().clone();
        if self.is_store_field(name) {
            if let Some(manager) = bound {
                return manager.get_field(self, name);
            }
        }
        Ok(self
            .0
            .fields
            .read()
            .get(name)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Write a field. Mirrors to the backend first when the field is
    /// a store field and the record is bound, then updates the
    /// in-memory cache; `store_fields` invariant (spec.md §3) requires
    /// the backend write to happen before the write is observable, so
    /// the in-memory cache is updated only after `set_field` succeeds.
    pub fn set(&self, name: &str, value: Value) -> Result<(), crate::manager::ManagerError> {
        let bound = self.0.manager.read().clone();
        if self.is_store_field(name) {
            if let Some(manager) = bound {
                manager.set_field(self, name, value.clone())?;
            }
        }
        self.0.fields.write().insert(name.to_owned(), value);
        Ok(())
    }

    /// Acquire this record's `DataLock`, released on drop.
    pub fn with_lock(&self) -> Result<crate::lock::LockGuard, crate::manager::ManagerError> {
        let manager = self
            .0
            .manager
            .read()
            .clone()
            .ok_or(crate::manager::ManagerError::Unbound)?;
        let lock = manager.allocate_lock(self, None);
        Ok(lock.acquire_guard())
    }

    pub fn unbind(&self) -> Result<(), crate::manager::ManagerError> {
        let manager = self
            .0
            .manager
            .read()
            .clone()
            .ok_or(crate::manager::ManagerError::Unbound)?;
        manager.unbind(self)
    }

    /// Deep copy: allocates a fresh `gid`, copies every field value in
    /// memory, and produces an unbound record. This is spec.md
    /// §4.4's `clone()`; it is a distinct method from `Clone::clone`
    /// (which shares identity) because sharing vs. copying identity
    /// are both needed and Rust's `Clone` trait can only mean one of
    /// them.
    pub fn clone_deep(&self) -> Record {
        let fields = self.0.fields.read().clone();
        let store_fields = self.0.store_fields.read().clone();
        Record(Arc::new(RecordInner {
            gid: Gid::new(),
            kind: self.0.kind.clone(),
            store_fields: RwLock::new(store_fields),
            manager: RwLock::new(None),
            fields: RwLock::new(fields),
        }))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("gid", &self.0.gid)
            .field("kind", &self.0.kind)
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Builds a fresh, unbound `Record`, naming which fields are
/// persisted (`store_fields`) and which stay process-local
/// (transient). This plays the role of the static field schema the
/// source declares through its trait/reflection framework (spec.md
/// §1, §9): the set of persisted field names is decided once, at
/// construction, by the code building the record.
pub struct RecordBuilder {
    kind: RecordType,
    fields: HashMap<String, Value>,
    store_fields: HashSet<String>,
}

impl RecordBuilder {
    pub fn new(kind: impl Into<RecordType>) -> Self {
        RecordBuilder {
            kind: kind.into(),
            fields: HashMap::new(),
            store_fields: HashSet::new(),
        }
    }

    /// Add a persisted field.
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.store_fields.insert(name.to_owned());
        self.fields.insert(name.to_owned(), value.into());
        self
    }

    /// Add a process-local field, never mirrored to the backend.
    pub fn transient(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_owned(), value.into());
        self
    }

    pub fn build(self) -> Record {
        remember_schema(&self.kind, self.store_fields.iter().cloned());
        Record(Arc::new(RecordInner {
            gid: Gid::new(),
            kind: self.kind,
            store_fields: RwLock::new(self.store_fields),
            manager: RwLock::new(None),
            fields: RwLock::new(self.fields),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_has_distinct_gid_each_time() {
        let a = RecordBuilder::new("thing").build();
        let b = RecordBuilder::new("thing").build();
        assert_ne!(a.gid(), b.gid());
    }

    #[test]
    fn clone_shares_identity_clone_deep_does_not() {
        let a = RecordBuilder::new("thing").field("x", 1i64).build();
        let shared = a.clone();
        assert_eq!(a.gid(), shared.gid());

        let deep = a.clone_deep();
        assert_ne!(a.gid(), deep.gid());
        assert_eq!(deep.get("x").unwrap(), Value::Int(1));
    }

    #[test]
    fn unbound_record_roundtrips_in_memory_fields() {
        let r = RecordBuilder::new("thing").field("x", "hello").build();
        assert_eq!(r.get("x").unwrap(), Value::Str("hello".into()));
        r.set("x", Value::from("world")).unwrap();
        assert_eq!(r.get("x").unwrap(), Value::Str("world".into()));
    }
}
