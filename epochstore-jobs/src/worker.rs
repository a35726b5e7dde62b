//! A poll-claim-execute worker loop over a `JobManager`.

use crate::job_manager::JobManager;
use std::{
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    thread,
    time::Duration,
};
use tracing::debug;

const RUNNING: u8 = 0;
const SHUTDOWN_GRACEFUL: u8 = 1;
const SHUTDOWN_HARD: u8 = 2;

/// How a running worker should wind down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish the job currently in hand, then stop once the queue is
    /// empty rather than mid-poll.
    Graceful,
    /// Stop as soon as the in-flight job (if any) returns control.
    Hard,
}

/// Claims jobs from a `JobManager` and runs them on the calling
/// thread, sleeping `poll_interval` between empty polls.
pub struct Worker {
    jobs: JobManager,
    poll_interval: Duration,
    shutdown: AtomicU8,
    idle: AtomicBool,
}

impl Worker {
    pub fn new(jobs: JobManager, poll_interval: Duration) -> Self {
        Worker {
            jobs,
            poll_interval,
            shutdown: AtomicU8::new(RUNNING),
            idle: AtomicBool::new(true),
        }
    }

    /// True between claims, while the worker has nothing in hand and
    /// is either sleeping or about to stop. Set around `request`/
    /// `execute` in `run`, not derived from shutdown state, so a
    /// supervisor can poll it during ordinary operation to find a safe
    /// moment to request a shutdown.
    pub fn idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self, mode: ShutdownMode) {
        let value = match mode {
            ShutdownMode::Graceful => SHUTDOWN_GRACEFUL,
            ShutdownMode::Hard => SHUTDOWN_HARD,
        };
        self.shutdown.store(value, Ordering::Relaxed);
    }

    /// Run until a hard shutdown is requested, or a graceful shutdown
    /// is requested and the queue has drained. Each iteration sleeps
    /// `poll_interval` before requesting a job, whether or not the
    /// previous iteration claimed one.
    pub fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) == SHUTDOWN_HARD {
                debug!("worker stopping: hard shutdown");
                return;
            }
            thread::sleep(self.poll_interval);
            match self.jobs.request() {
                Some(job) => {
                    self.idle.store(false, Ordering::Relaxed);
                    debug!(gid = %job.record().gid(), "claimed job");
                    job.execute();
                    self.idle.store(true, Ordering::Relaxed);
                }
                None => {
                    if self.shutdown.load(Ordering::Relaxed) == SHUTDOWN_GRACEFUL {
                        debug!("worker stopping: queue drained");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{register_fn, Job};
    use epochstore::Value;
    use epochstore_backends::memory::MemoryBackend;
    use std::sync::Arc;

    #[test]
    fn worker_drains_pending_jobs_then_stops_gracefully() {
        register_fn("jobs::worker_tests::noop", |_, _| Ok(Value::Null));
        let jm = JobManager::open(Arc::new(MemoryBackend::new()));
        for _ in 0..3 {
            let job = Job::new("jobs::worker_tests::noop", vec![], vec![]);
            jm.bind_job(&job).unwrap();
        }

        let worker = Worker::new(jm.clone(), Duration::from_millis(1));
        worker.request_shutdown(ShutdownMode::Graceful);
        worker.run();

        let remaining = jm
            .job_iter()
            .unwrap()
            .filter(|j| j.state() != crate::job::JobState::Done)
            .count();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn idle_holds_before_running_and_again_after_an_empty_graceful_drain() {
        let jm = JobManager::open(Arc::new(MemoryBackend::new()));
        let worker = Worker::new(jm, Duration::from_millis(1));
        assert!(worker.idle());

        worker.request_shutdown(ShutdownMode::Graceful);
        worker.run();

        assert!(worker.idle());
    }
}
