//! Service loop that processes deferred jobs from the store.

use crate::{DispatchError, DispatchResult, PipelineDispatcher};
use cloak_core::{Job, JobId};
use cloak_store::JobStore;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task;
use tokio::time::sleep;
use tracing::{info, warn};

/// A worker that reserves and dispatches deferred jobs.
pub struct Worker {
    id: String,
    store: JobStore,
    dispatcher: PipelineDispatcher,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(id: impl Into<String>, dispatcher: PipelineDispatcher, poll_interval: Duration) -> Self {
        Self {
            id: id.into(),
            store: dispatcher.store().clone(),
            dispatcher,
            poll_interval,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reserve and process at most one job.
    ///
    /// Returns `None` if nothing was waiting. The lease is released on every
    /// path once a job has been reserved.
    pub async fn run_once(&self) -> DispatchResult<Option<Job>> {
        let store = self.store.clone();
        let Some(job) = task::spawn_blocking(move || store.reserve_next()).await?? else {
            return Ok(None);
        };
        let id = job.id;
        info!(worker_id = %self.id, job_id = %id, "Claimed job");

        let result = self.dispatcher.run_guarded(&id).await;
        self.release(id).await;

        let job = result?;
        info!(worker_id = %self.id, job_id = %id, status = %job.status, "Finished job");
        Ok(Some(job))
    }

    async fn release(&self, id: JobId) {
        let store = self.store.clone();
        let released = match task::spawn_blocking(move || store.release(&id)).await {
            Ok(released) => released.map_err(DispatchError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = released {
            warn!(worker_id = %self.id, job_id = %id, error = %e, "Failed to release lease");
        }
    }

    /// Run the worker loop until `shutdown` turns true.
    ///
    /// Shutdown is only observed between jobs; a job in flight always runs to
    /// a terminal state first. Dropping the sender also stops the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, poll_interval = ?self.poll_interval, "Starting worker");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                // More work may be waiting, poll again right away
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to process job");
                }
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{Behavior, FakeTechnique, Harness};
    use assert_matches::assert_matches;
    use cloak_core::{JobStatus, RunMode, TechniqueKind};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_once_with_empty_queue() {
        let h = Harness::new();
        let worker = Worker::new("w1", h.dispatcher(vec![]), Duration::from_millis(10));
        assert_matches!(worker.run_once().await, Ok(None));
    }

    #[tokio::test]
    async fn test_one_iteration_with_partial_failure() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(vec![
            FakeTechnique::new(TechniqueKind::StringEncryption, Behavior::Succeed),
            FakeTechnique::new(TechniqueKind::Bogus, Behavior::Fail("missing tool")),
        ]);
        let job = h.create(
            &[TechniqueKind::StringEncryption, TechniqueKind::Bogus],
            RunMode::Deferred,
        );
        let worker = Worker::new("w1", dispatcher, Duration::from_millis(10));

        let done = worker.run_once().await.unwrap().unwrap();

        assert_eq!(done.id, job.id);
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(
            done.output_file,
            Some(h.output_dir().join("out_string-encryption"))
        );
        assert!(done.error.is_none());
        assert!(!h.store.is_leased(&job.id));

        let logs = h.store.logs(&job.id).unwrap();
        assert!(logs.iter().any(|l| l.contains("ERROR in bogus: missing tool")));

        let persisted = h.store.load(&job.id).unwrap();
        assert_eq!(persisted, done);
        assert_eq!(persisted, h.store.load(&job.id).unwrap());
    }

    #[tokio::test]
    async fn test_inline_jobs_are_left_alone() {
        let h = Harness::new();
        let job = h.create(&[TechniqueKind::Bogus], RunMode::Inline);
        let worker = Worker::new(
            "w1",
            h.dispatcher(vec![FakeTechnique::new(TechniqueKind::Bogus, Behavior::Succeed)]),
            Duration::from_millis(10),
        );

        assert_matches!(worker.run_once().await, Ok(None));
        assert_eq!(h.store.load(&job.id).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_panic_releases_lease_and_marks_error() {
        let h = Harness::new();
        let job = h.create(&[TechniqueKind::Opaque], RunMode::Deferred);
        let worker = Worker::new(
            "w1",
            h.dispatcher(vec![FakeTechnique::new(TechniqueKind::Opaque, Behavior::Panic)]),
            Duration::from_millis(10),
        );

        let done = worker.run_once().await.unwrap().unwrap();

        assert_eq!(done.status, JobStatus::Error);
        assert!(done.error.unwrap().contains("technique blew up"));
        assert!(!h.store.is_leased(&job.id));
    }

    #[tokio::test]
    async fn test_loop_drains_queue_then_stops_on_shutdown() {
        let h = Harness::new();
        let jobs: Vec<_> = (0..3)
            .map(|_| h.create(&[TechniqueKind::Bogus], RunMode::Deferred))
            .collect();
        let worker = Arc::new(Worker::new(
            "w1",
            h.dispatcher(vec![FakeTechnique::new(TechniqueKind::Bogus, Behavior::Succeed)]),
            Duration::from_millis(20),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run(rx).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let all_done = jobs
                .iter()
                .all(|j| h.store.load(&j.id).unwrap().status.is_terminal());
            if all_done || tokio::time::Instant::now() > deadline {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        for job in &jobs {
            assert_eq!(h.store.load(&job.id).unwrap().status, JobStatus::Completed);
            assert!(!h.store.is_leased(&job.id));
        }
    }
}
