//! `JobManager`: a `DataManager` specialized for scheduling — binding
//! a job transitions it `NEW` -> `PENDING`, and `request` claims the
//! next pending job under its own `DataLock` (spec.md §4.7).

use crate::{
    generator::{is_generator_kind, GeneratorJob, GENERATOR_JOB_KIND},
    job::{Job, JobState, JOB_KIND},
};
use epochstore::{Backend, DataManager, ManagerError, Record};
use std::{ops::Deref, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobsError {
    #[error("job must be in NEW state to bind, found {0:?}")]
    NotNew(JobState),
    #[error("record kind {0:?} is not a job or generator job")]
    NotAJob(String),
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// A claimed or discovered job, whose concrete shape (leaf or
/// generator) is resolved from its `RecordType`.
#[derive(Clone)]
pub enum AnyJob {
    Job(Job),
    Generator(GeneratorJob),
}

impl AnyJob {
    pub fn record(&self) -> &Record {
        match self {
            AnyJob::Job(j) => j.record(),
            AnyJob::Generator(g) => g.record(),
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            AnyJob::Job(j) => j.state(),
            AnyJob::Generator(g) => g.state(),
        }
    }

    pub fn execute(&self) {
        match self {
            AnyJob::Job(j) => j.execute(),
            AnyJob::Generator(g) => g.execute(),
        }
    }

    fn from_record(record: Record) -> Option<AnyJob> {
        if is_generator_kind(record.kind()) {
            Some(AnyJob::Generator(GeneratorJob::from_record(record)))
        } else if record.kind().name() == JOB_KIND {
            Some(AnyJob::Job(Job::from_record(record)))
        } else {
            None
        }
    }
}

/// Wraps a `DataManager` opened over a backend dedicated to jobs.
/// Every non-scheduling operation (binding arbitrary records, field
/// access, locks) is available unchanged through [`Deref`].
#[derive(Clone)]
pub struct JobManager(DataManager);

impl Deref for JobManager {
    type Target = DataManager;

    fn deref(&self) -> &DataManager {
        &self.0
    }
}

impl JobManager {
    pub fn open(backend: Arc<dyn Backend>) -> Self {
        JobManager(DataManager::open(backend))
    }

    pub fn data_manager(&self) -> &DataManager {
        &self.0
    }

    pub fn bind_job(&self, job: &Job) -> Result<(), JobsError> {
        self.bind_record(job.record())
    }

    pub fn bind_generator(&self, job: &GeneratorJob) -> Result<(), JobsError> {
        self.bind_record(job.record())
    }

    fn bind_record(&self, record: &Record) -> Result<(), JobsError> {
        if record.kind().name() != JOB_KIND && record.kind().name() != GENERATOR_JOB_KIND {
            return Err(JobsError::NotAJob(record.kind().name().to_owned()));
        }
        let state = record
            .get("state")
            .ok()
            .and_then(|v| v.as_str().and_then(JobState::parse))
            .unwrap_or(JobState::New);
        if state != JobState::New {
            return Err(JobsError::NotNew(state));
        }
        self.0.bind(record)?;
        record.set("state", JobState::Pending.into())?;
        Ok(())
    }

    /// Every job and generator job bound to this manager, in `Gid`
    /// order. Restartable the same way [`DataManager::iter`] is.
    pub fn job_iter(&self) -> Result<impl Iterator<Item = AnyJob> + '_, ManagerError> {
        Ok(self.0.iter()?.filter_map(AnyJob::from_record))
    }

    /// Claim the next pending job, if any, transitioning it to
    /// `RUNNING` before returning it. Uses a double-checked lock: the
    /// state is checked once cheaply before acquiring the per-record
    /// `DataLock`, then re-checked under the lock, so two workers
    /// racing for the same job never both claim it.
    pub fn request(&self) -> Option<AnyJob> {
        let candidates = self.job_iter().ok()?;
        for candidate in candidates {
            if candidate.state() != JobState::Pending {
                continue;
            }
            let guard = match candidate.record().with_lock() {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            if candidate.state() != JobState::Pending {
                continue;
            }
            if candidate
                .record()
                .set("state", JobState::Running.into())
                .is_err()
            {
                continue;
            }
            drop(guard);
            return Some(candidate);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{generator::register_generator, generator::GeneratorStep, generator::JobOrValue, job::register_fn};
    use epochstore::Value;
    use epochstore_backends::memory::MemoryBackend;

    fn jobs() -> JobManager {
        JobManager::open(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn binding_a_non_new_job_is_rejected() {
        register_fn("jobs::manager_tests::noop", |_, _| Ok(Value::Null));
        let jm = jobs();
        let job = Job::new("jobs::manager_tests::noop", vec![], vec![]);
        jm.bind_job(&job).unwrap();
        assert!(matches!(jm.bind_job(&job), Err(JobsError::NotNew(JobState::Pending))));
    }

    #[test]
    fn request_claims_exactly_one_of_two_pending_jobs_and_marks_it_running() {
        register_fn("jobs::manager_tests::noop2", |_, _| Ok(Value::Null));
        let jm = jobs();
        let a = Job::new("jobs::manager_tests::noop2", vec![], vec![]);
        let b = Job::new("jobs::manager_tests::noop2", vec![], vec![]);
        jm.bind_job(&a).unwrap();
        jm.bind_job(&b).unwrap();

        let claimed = jm.request().unwrap();
        assert_eq!(claimed.state(), JobState::Running);
        let remaining_pending = jm
            .job_iter()
            .unwrap()
            .filter(|j| j.state() == JobState::Pending)
            .count();
        assert_eq!(remaining_pending, 1);
    }

    #[test]
    fn request_returns_none_when_nothing_is_pending() {
        let jm = jobs();
        assert!(jm.request().is_none());
    }

    struct Immediate;
    impl crate::generator::JobBody<Value> for Immediate {
        fn step(&mut self, _prior: Option<&Job>) -> GeneratorStep<Value> {
            GeneratorStep::Return(JobOrValue::Value(Value::Int(1)))
        }
    }

    #[test]
    fn job_iter_recognizes_both_job_kinds() {
        register_generator("jobs::manager_tests::gen", |_, _| Box::new(Immediate));
        let jm = jobs();
        let job = Job::new("jobs::manager_tests::anything", vec![], vec![]);
        let gen = GeneratorJob::new("jobs::manager_tests::gen", vec![], vec![]);
        jm.bind_job(&job).unwrap();
        jm.bind_generator(&gen).unwrap();

        let kinds: Vec<bool> = jm
            .job_iter()
            .unwrap()
            .map(|j| matches!(j, AnyJob::Generator(_)))
            .collect();
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&true));
        assert!(kinds.contains(&false));
    }
}
