//! Job and generator-job scheduling on top of `epochstore`'s Data
//! Manager: persisted work items, a claim protocol safe under
//! concurrent workers, and a generator-job closure algorithm for jobs
//! that fan out into child jobs before completing.

#![deny(clippy::all)]

pub mod generator;
pub mod job;
pub mod job_manager;
pub mod worker;

pub use generator::{
    generator_job_wrap, register_generator, run_to_completion, GeneratorJob, GeneratorStep,
    JobBody, JobOrValue,
};
pub use job::{register_fn, Job, JobState};
pub use job_manager::{AnyJob, JobManager, JobsError};
pub use worker::{ShutdownMode, Worker};
