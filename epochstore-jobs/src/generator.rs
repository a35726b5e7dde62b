//! `GeneratorJob`: a job whose body yields child jobs one at a time
//! and completes once every child has settled (spec.md §4.6's
//! generator-job closure algorithm, recast as an explicit state
//! object since Rust has no generator-function equivalent to drive
//! across a process boundary).

use crate::job::{call_registered, kwargs_value, map_kwargs, seq_args, Job, JobState, JOB_FIELDS};
use epochstore::{ManagerError, Record, RecordBuilder, RecordType, Value};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    ops::Deref,
    sync::{Arc, OnceLock},
};

pub const GENERATOR_JOB_KIND: &str = "GeneratorJob";

const GENERATOR_FIELDS: &[&str] = &["children", "return_job"];

/// A step a generator body can hand back: either "run this job next
/// and call me again once it's done" or "I'm finished".
pub enum GeneratorStep<R> {
    Yield(Job),
    Return(JobOrValue<R>),
}

/// A generator's terminal value: either a plain value, or a
/// leaf job whose execution *becomes* the generator's own
/// out/err/state (spec.md §4.6's `return_job`).
pub enum JobOrValue<R> {
    Job(Job),
    Value(R),
}

/// State machine a `GeneratorJob` drives one step at a time. `step` is
/// called with `None` on the first call, then with the just-completed
/// child on every subsequent call.
pub trait JobBody<R>: Send {
    fn step(&mut self, prior: Option<&Job>) -> GeneratorStep<R>;
}

type GeneratorCtor = dyn Fn(&[Value], &[(String, Value)]) -> Box<dyn JobBody<Value>> + Send + Sync;
type GeneratorRegistry = RwLock<HashMap<String, Arc<GeneratorCtor>>>;

fn registry() -> &'static GeneratorRegistry {
    static REGISTRY: OnceLock<GeneratorRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Make `name` resolvable as a `GeneratorJob`'s `func`, the generator
/// counterpart of [`crate::job::register_fn`].
pub fn register_generator(
    name: impl Into<String>,
    ctor: impl Fn(&[Value], &[(String, Value)]) -> Box<dyn JobBody<Value>> + Send + Sync + 'static,
) {
    registry().write().insert(name.into(), Arc::new(ctor));
}

fn resolve_generator(name: &str) -> Option<Arc<GeneratorCtor>> {
    registry().read().get(name).cloned()
}

/// A `Job` (via [`Deref`]) that additionally tracks the children it
/// has scheduled and, on completion, either its own `out` or a
/// `return_job` absorbed as its final leaf execution.
#[derive(Clone)]
pub struct GeneratorJob(pub(crate) Job);

impl Deref for GeneratorJob {
    type Target = Job;

    fn deref(&self) -> &Job {
        &self.0
    }
}

impl GeneratorJob {
    pub fn new(
        func: impl Into<String>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> GeneratorJob {
        let record = RecordBuilder::new(GENERATOR_JOB_KIND)
            .field("func", Value::Str(func.into()))
            .field("args", Value::Seq(args))
            .field("kwargs", kwargs_value(kwargs))
            .field("out", Value::Null)
            .field("err", Value::Null)
            .field("state", JobState::New)
            .field("parent", Value::Null)
            .field("children", Value::Seq(Vec::new()))
            .field("return_job", Value::Null)
            .build();
        GeneratorJob(Job(record))
    }

    pub fn from_record(record: Record) -> GeneratorJob {
        record.declare_store_fields(JOB_FIELDS.iter().copied());
        record.declare_store_fields(GENERATOR_FIELDS.iter().copied());
        GeneratorJob(Job(record))
    }

    pub fn children(&self) -> Vec<Job> {
        match self.record().get("children").unwrap_or(Value::Null) {
            Value::Seq(items) => items
                .into_iter()
                .filter_map(|v| v.as_record().cloned())
                .map(Job::from_record)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn set_children(&self, children: &[Job]) -> Result<(), ManagerError> {
        let seq = Value::Seq(
            children
                .iter()
                .map(|j| Value::Record(j.record().clone()))
                .collect(),
        );
        self.record().set("children", seq)
    }

    pub fn return_job(&self) -> Option<Job> {
        self.record()
            .get("return_job")
            .ok()
            .and_then(|v| v.as_record().cloned())
            .map(Job::from_record)
    }

    fn set_return_job(&self, job: &Job) -> Result<(), ManagerError> {
        self.record().set("return_job", Value::Record(job.record().clone()))
    }

    /// Resolve `func` against the generator registry and drive it to
    /// completion, scheduling each yielded child onto this record's
    /// manager if it's bound, or running children synchronously
    /// in-process if it isn't (spec.md §4.6 step 5, the local-testing
    /// fallback: an unbound generator has no worker pool to hand
    /// children to).
    pub fn execute(&self) {
        self.0.set_state(JobState::Running).ok();
        let func = self.func();
        let args = seq_args(self.record().get("args").unwrap_or(Value::Null));
        let kwargs = map_kwargs(self.record().get("kwargs").unwrap_or(Value::Null));

        let ctor = match resolve_generator(&func) {
            Some(ctor) => ctor,
            None => {
                self.record()
                    .set(
                        "err",
                        Value::Str(format!("no generator function registered under {func:?}")),
                    )
                    .ok();
                self.0.set_state(JobState::Error).ok();
                if let Some(parent) = self.parent() {
                    parent.notify(&self.0);
                }
                return;
            }
        };

        let mut body = ctor(&args, &kwargs);
        let mut prior: Option<Job> = None;
        let mut children = Vec::new();
        let terminal = loop {
            match body.step(prior.as_ref()) {
                GeneratorStep::Yield(child) => {
                    if self.state() == JobState::Error {
                        break None;
                    }
                    child.set_parent(self).ok();
                    if let Some(manager) = self.record().manager() {
                        manager.bind(child.record()).ok();
                    }
                    child.schedule().ok();
                    children.push(child.clone());
                    prior = Some(child);
                }
                GeneratorStep::Return(terminal) => break Some(terminal),
            }
        };
        self.set_children(&children).ok();

        match terminal {
            Some(JobOrValue::Job(return_job)) => {
                self.set_return_job(&return_job).ok();
            }
            Some(JobOrValue::Value(v)) => {
                self.record().set("out", v).ok();
            }
            None => {}
        }

        {
            let _guard = self.record().with_lock().ok();
            if self.state() != JobState::Error {
                self.0.set_state(JobState::Waiting).ok();
                self.check_and_done();
            }
        }

        if !self.record().is_bound() {
            for child in self.children() {
                child.execute();
            }
        }
    }

    /// A child reported a result. Called under the child's own
    /// completion, never by the generator itself. Re-checks whether
    /// every child has now settled.
    pub fn notify(&self, child: &Job) {
        let _guard = match self.record().with_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if child.state() == JobState::Error {
            self.record()
                .set("err", Value::Str(format!("child {} failed", child.gid())))
                .ok();
            self.0.set_state(JobState::Error).ok();
            if let Some(parent) = self.parent() {
                parent.notify(&self.0);
            }
            return;
        }
        if self.state() != JobState::Waiting {
            return;
        }
        self.check_and_done();
    }

    /// Must be called with this generator's `DataLock` already held.
    fn check_and_done(&self) {
        let children = self.children();
        if children.iter().any(|c| !c.state().is_terminal()) {
            return;
        }
        match self.return_job() {
            Some(return_job) => {
                let func = return_job.func();
                let args = return_job.args();
                let kwargs = return_job.kwargs();
                match call_registered(&func, &args, &kwargs) {
                    Ok(out) => {
                        self.record().set("out", out).ok();
                        self.0.set_state(JobState::Done).ok();
                    }
                    Err(message) => {
                        self.record().set("err", Value::Str(message)).ok();
                        self.0.set_state(JobState::Error).ok();
                    }
                }
            }
            None => {
                self.0.set_state(JobState::Done).ok();
            }
        }
        if let Some(parent) = self.parent() {
            parent.notify(&self.0);
        }
    }
}

impl From<GeneratorJob> for Value {
    fn from(g: GeneratorJob) -> Value {
        Value::Record(g.record().clone())
    }
}

pub(crate) fn is_generator_kind(kind: &RecordType) -> bool {
    kind.name() == GENERATOR_JOB_KIND
}

/// Drive a body locally and synchronously, with no manager or worker
/// pool involved: every yielded child runs in-process via
/// [`Job::execute`] as soon as it's produced. Useful for tests and for
/// code that wants generator-style job composition without scheduling.
pub fn run_to_completion<R>(mut body: impl JobBody<R>) -> JobOrValue<R> {
    let mut prior: Option<Job> = None;
    loop {
        match body.step(prior.as_ref()) {
            GeneratorStep::Yield(child) => {
                child.execute();
                prior = Some(child);
            }
            GeneratorStep::Return(terminal) => return terminal,
        }
    }
}

/// Build a schedulable `GeneratorJob` for a name already registered
/// via [`register_generator`].
pub fn generator_job_wrap(
    func: impl Into<String>,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> GeneratorJob {
    GeneratorJob::new(func, args, kwargs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::register_fn;
    use epochstore::DataManager;
    use epochstore_backends::memory::MemoryBackend;
    use std::sync::Arc;

    fn manager() -> DataManager {
        DataManager::open(Arc::new(MemoryBackend::new()))
    }

    struct CountToThree {
        emitted: i64,
    }

    impl JobBody<Value> for CountToThree {
        fn step(&mut self, _prior: Option<&Job>) -> GeneratorStep<Value> {
            if self.emitted >= 3 {
                return GeneratorStep::Return(JobOrValue::Value(Value::Int(self.emitted)));
            }
            self.emitted += 1;
            GeneratorStep::Yield(Job::new("jobs::tests::gen_noop", vec![], vec![]))
        }
    }

    #[test]
    fn run_to_completion_drives_body_locally_without_a_manager() {
        register_fn("jobs::tests::gen_noop", |_, _| Ok(Value::Null));
        let result = run_to_completion(CountToThree { emitted: 0 });
        match result {
            JobOrValue::Value(Value::Int(n)) => assert_eq!(n, 3),
            _ => panic!("expected a plain terminal value"),
        }
    }

    #[test]
    fn unbound_generator_executes_children_and_settles_done() {
        register_fn("jobs::tests::gen_noop2", |_, _| Ok(Value::Null));
        register_generator("jobs::tests::counter", |_, _| {
            Box::new(CountToThree { emitted: 0 })
        });
        let gen = GeneratorJob::new("jobs::tests::counter", vec![], vec![]);
        gen.execute();
        assert_eq!(gen.state(), JobState::Done);
        assert_eq!(gen.children().len(), 3);
    }

    #[test]
    fn bound_generator_schedules_children_as_pending_jobs() {
        register_generator("jobs::tests::counter_bound", |_, _| {
            Box::new(CountToThree { emitted: 0 })
        });
        let m = manager();
        let gen = GeneratorJob::new("jobs::tests::counter_bound", vec![], vec![]);
        m.bind(gen.record()).unwrap();
        gen.execute();
        for child in gen.children() {
            assert_eq!(child.state(), JobState::Pending);
        }
    }

    #[test]
    fn child_failure_propagates_error_to_generator() {
        register_fn("jobs::tests::always_fails", |_, _| Err("boom".to_owned()));
        struct OneFailingChild(bool);
        impl JobBody<Value> for OneFailingChild {
            fn step(&mut self, prior: Option<&Job>) -> GeneratorStep<Value> {
                if let Some(p) = prior {
                    assert_eq!(p.state(), JobState::Error);
                    return GeneratorStep::Return(JobOrValue::Value(Value::Null));
                }
                GeneratorStep::Yield(Job::new("jobs::tests::always_fails", vec![], vec![]))
            }
        }
        let result = run_to_completion(OneFailingChild(false));
        assert!(matches!(result, JobOrValue::Value(Value::Null)));
    }
}
