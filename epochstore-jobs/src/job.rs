//! `Job`: a leaf unit of work persisted as a `Record` (func, args,
//! kwargs, out, err, state, parent) plus the process-wide registry
//! that resolves a `func` identifier back to Rust code.

use epochstore::{ManagerError, Record, RecordBuilder, RecordType, Value};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    thread,
    time::Duration,
};

pub const JOB_KIND: &str = "Job";

pub(crate) const JOB_FIELDS: &[&str] =
    &["func", "args", "kwargs", "out", "err", "state", "parent"];

/// A registered job body: takes positional and keyword arguments,
/// returns the job's `out` value or a failure message for `err`.
pub type JobFn = dyn Fn(&[Value], &[(String, Value)]) -> Result<Value, String> + Send + Sync;

type Registry = RwLock<HashMap<String, Arc<JobFn>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Make `name` resolvable as a `Job`'s `func`. Workers in any process
/// that calls this with the same name before running can execute jobs
/// created with it — the registration itself is never persisted.
pub fn register_fn(
    name: impl Into<String>,
    f: impl Fn(&[Value], &[(String, Value)]) -> Result<Value, String> + Send + Sync + 'static,
) {
    registry().write().insert(name.into(), Arc::new(f));
}

pub(crate) fn resolve_fn(name: &str) -> Option<Arc<JobFn>> {
    registry().read().get(name).cloned()
}

pub(crate) fn call_registered(
    name: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<Value, String> {
    match resolve_fn(name) {
        Some(f) => f(args, kwargs),
        None => Err(format!("no job function registered under {name:?}")),
    }
}

pub(crate) fn seq_args(value: Value) -> Vec<Value> {
    match value {
        Value::Seq(items) => items,
        _ => Vec::new(),
    }
}

pub(crate) fn map_kwargs(value: Value) -> Vec<(String, Value)> {
    match value {
        Value::Map(pairs) => pairs
            .into_iter()
            .filter_map(|(k, v)| k.as_str().map(|s| (s.to_owned(), v)))
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn kwargs_value(kwargs: Vec<(String, Value)>) -> Value {
    Value::Map(
        kwargs
            .into_iter()
            .map(|(k, v)| (Value::Str(k), v))
            .collect(),
    )
}

/// A job's lifecycle (spec.md §4.6): `New` jobs aren't yet schedulable;
/// `JobManager::bind` moves a job to `Pending`; a worker claims it into
/// `Running`; it settles into `Done`, `Error`, or (generator jobs only)
/// `Waiting` on its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    New,
    Pending,
    Running,
    Waiting,
    Done,
    Error,
}

impl JobState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Waiting => "WAITING",
            JobState::Done => "DONE",
            JobState::Error => "ERROR",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<JobState> {
        Some(match s {
            "NEW" => JobState::New,
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "WAITING" => JobState::Waiting,
            "DONE" => JobState::Done,
            "ERROR" => JobState::Error,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }
}

impl From<JobState> for Value {
    fn from(s: JobState) -> Value {
        Value::Str(s.as_str().to_owned())
    }
}

/// A wrapped `Record` that knows it's a job: which fields are
/// persisted and how to read its state machine.
#[derive(Clone)]
pub struct Job(pub(crate) Record);

impl Job {
    /// Build a fresh, unbound job in state `NEW`.
    pub fn new(func: impl Into<String>, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Job {
        let record = RecordBuilder::new(JOB_KIND)
            .field("func", Value::Str(func.into()))
            .field("args", Value::Seq(args))
            .field("kwargs", kwargs_value(kwargs))
            .field("out", Value::Null)
            .field("err", Value::Null)
            .field("state", JobState::New)
            .field("parent", Value::Null)
            .build();
        Job(record)
    }

    /// Wrap a `Record` known to hold `Job`'s fields (one freshly
    /// rehydrated by the manager, or resolved out of another record's
    /// field), registering its schema so reads and writes route
    /// through the manager.
    pub fn from_record(record: Record) -> Job {
        record.declare_store_fields(JOB_FIELDS.iter().copied());
        Job(record)
    }

    pub fn record(&self) -> &Record {
        &self.0
    }

    pub fn gid(&self) -> epochstore::Gid {
        self.0.gid()
    }

    pub fn kind(&self) -> &RecordType {
        self.0.kind()
    }

    pub fn func(&self) -> String {
        self.0
            .get("func")
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    }

    pub fn args(&self) -> Vec<Value> {
        seq_args(self.0.get("args").unwrap_or(Value::Null))
    }

    pub fn kwargs(&self) -> Vec<(String, Value)> {
        map_kwargs(self.0.get("kwargs").unwrap_or(Value::Null))
    }

    pub fn out(&self) -> Value {
        self.0.get("out").unwrap_or(Value::Null)
    }

    pub fn err(&self) -> Value {
        self.0.get("err").unwrap_or(Value::Null)
    }

    /// Fresh read of the job's state. When the record is bound, this
    /// always goes through the manager — never a stale in-memory copy
    /// left over from before another worker moved the job along.
    pub fn state(&self) -> JobState {
        self.0
            .get("state")
            .ok()
            .and_then(|v| v.as_str().and_then(JobState::parse))
            .unwrap_or(JobState::New)
    }

    pub(crate) fn set_state(&self, state: JobState) -> Result<(), ManagerError> {
        self.0.set("state", state.into())
    }

    /// Transition out of `NEW` into `PENDING`, the precondition
    /// `JobManager::bind` and generator scheduling both enforce before
    /// a job becomes claimable.
    pub(crate) fn schedule(&self) -> Result<(), ManagerError> {
        self.set_state(JobState::Pending)
    }

    pub fn parent(&self) -> Option<crate::generator::GeneratorJob> {
        self.0
            .get("parent")
            .ok()
            .and_then(|v| v.as_record().cloned())
            .map(|r| crate::generator::GeneratorJob::from_record(r))
    }

    pub(crate) fn set_parent(
        &self,
        parent: &crate::generator::GeneratorJob,
    ) -> Result<(), ManagerError> {
        self.0.set("parent", Value::from(parent.record().clone()))
    }

    /// Run this job's function and record the outcome, then notify a
    /// waiting parent generator, if any (spec.md §4.6: leaf execution).
    pub fn execute(&self) {
        self.set_state(JobState::Running).ok();
        let func = self.func();
        let args = self.args();
        let kwargs = self.kwargs();
        match call_registered(&func, &args, &kwargs) {
            Ok(out) => {
                self.0.set("out", out).ok();
                self.set_state(JobState::Done).ok();
            }
            Err(message) => {
                self.0.set("err", Value::Str(message)).ok();
                self.set_state(JobState::Error).ok();
            }
        }
        if let Some(parent) = self.parent() {
            parent.notify(self);
        }
    }

    /// Block the calling thread until the job settles into `Done` or
    /// `Error`, polling its persisted state.
    pub fn join(&self, poll_interval: Duration) -> JobState {
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            thread::sleep(poll_interval);
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("gid", &self.gid())
            .field("func", &self.func())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epochstore::DataManager;
    use epochstore_backends::memory::MemoryBackend;
    use std::sync::Arc;

    fn manager() -> DataManager {
        DataManager::open(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn unbound_job_executes_registered_function_in_process() {
        register_fn("jobs::tests::add", |args, _| {
            let a = args[0].as_int().unwrap();
            let b = args[1].as_int().unwrap();
            Ok(Value::Int(a + b))
        });
        let job = Job::new("jobs::tests::add", vec![Value::Int(2), Value::Int(3)], vec![]);
        job.execute();
        assert_eq!(job.state(), JobState::Done);
        assert_eq!(job.out(), Value::Int(5));
    }

    #[test]
    fn unregistered_func_settles_into_error() {
        let job = Job::new("jobs::tests::does_not_exist", vec![], vec![]);
        job.execute();
        assert_eq!(job.state(), JobState::Error);
        assert!(matches!(job.err(), Value::Str(_)));
    }

    #[test]
    fn bound_job_state_reads_are_fresh_from_the_manager() {
        register_fn("jobs::tests::noop", |_, _| Ok(Value::Null));
        let m = manager();
        let job = Job::new("jobs::tests::noop", vec![], vec![]);
        m.bind(job.record()).unwrap();

        let other_handle = Job::from_record(m.rehydrate(job.gid(), RecordType::new(JOB_KIND)));
        job.execute();
        assert_eq!(other_handle.state(), JobState::Done);
    }
}
