//! Reservation of deferred jobs.
//!
//! A lease is the `.lock` directory inside a job's directory. Creating a
//! directory fails if it already exists, so at most one caller can hold a
//! given job at a time. Leases never expire: a worker that dies without
//! releasing leaves its job stuck in `processing`.

use crate::{JobStore, StoreResult};
use cloak_core::{Job, JobId, JobStatus, JobUpdate, RunMode};
use std::fs;
use std::io::ErrorKind;
use tracing::{debug, info, warn};

impl JobStore {
    /// Claim the oldest queued deferred job and move it to `processing`.
    ///
    /// Returns `None` when nothing is eligible or every candidate is held by
    /// another worker.
    pub fn reserve_next(&self) -> StoreResult<Option<Job>> {
        let candidates = self
            .list()?
            .into_iter()
            .filter(|job| job.status == JobStatus::Queued && job.run_mode == RunMode::Deferred);

        for candidate in candidates {
            let id = candidate.id;
            if !self.try_lease(&id)? {
                debug!(job_id = %id, "Lease held elsewhere, skipping");
                continue;
            }

            match self.claim(&id) {
                Ok(Some(job)) => {
                    info!(job_id = %id, "Reserved job");
                    return Ok(Some(job));
                }
                Ok(None) => {
                    debug!(job_id = %id, "Job left the queue before it was leased");
                    self.release(&id)?;
                }
                Err(e) => {
                    if let Err(release_err) = self.release(&id) {
                        warn!(job_id = %id, error = %release_err, "Failed to release lease");
                    }
                    return Err(e);
                }
            }
        }

        Ok(None)
    }

    /// Drop the lease on `id`. Releasing an unleased job does nothing.
    pub fn release(&self, id: &JobId) -> StoreResult<()> {
        match fs::remove_dir(self.lease_path(id)) {
            Ok(()) => {
                debug!(job_id = %id, "Released lease");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_leased(&self, id: &JobId) -> bool {
        self.lease_path(id).is_dir()
    }

    fn try_lease(&self, id: &JobId) -> StoreResult<bool> {
        match fs::create_dir(self.lease_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // The scan in `reserve_next` may be stale by the time the lease is
    // taken, so the record is checked again under the lease.
    fn claim(&self, id: &JobId) -> StoreResult<Option<Job>> {
        let current = self.load(id)?;
        if current.status != JobStatus::Queued {
            return Ok(None);
        }

        let job = self.update(
            id,
            JobUpdate::step("Initializing...", 0).status(JobStatus::Processing),
        )?;
        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use crate::JobStore;
    use crate::store::tests::new_job;
    use cloak_core::{JobStatus, JobUpdate, RunMode};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_reserve_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        assert!(store.reserve_next().unwrap().is_none());
    }

    #[test]
    fn test_reserve_marks_processing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = store.create(new_job(RunMode::Deferred)).unwrap();

        let reserved = store.reserve_next().unwrap().unwrap();
        assert_eq!(reserved.id, job.id);
        assert_eq!(reserved.status, JobStatus::Processing);
        assert_eq!(reserved.stage, "Initializing...");
        assert_eq!(reserved.progress, 0);
        assert!(store.is_leased(&job.id));

        // Already processing, nothing else to hand out
        assert!(store.reserve_next().unwrap().is_none());
    }

    #[test]
    fn test_reserve_is_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let ids: Vec<_> = (0..5)
            .map(|_| store.create(new_job(RunMode::Deferred)).unwrap().id)
            .collect();

        let order: Vec<_> = std::iter::from_fn(|| store.reserve_next().unwrap())
            .map(|job| job.id)
            .collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn test_inline_jobs_are_never_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        store.create(new_job(RunMode::Inline)).unwrap();
        let deferred = store.create(new_job(RunMode::Deferred)).unwrap();

        assert_eq!(store.reserve_next().unwrap().unwrap().id, deferred.id);
        assert!(store.reserve_next().unwrap().is_none());
    }

    #[test]
    fn test_held_lease_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let first = store.create(new_job(RunMode::Deferred)).unwrap();
        let second = store.create(new_job(RunMode::Deferred)).unwrap();

        std::fs::create_dir(store.lease_path(&first.id)).unwrap();

        assert_eq!(store.reserve_next().unwrap().unwrap().id, second.id);
        assert_eq!(store.load(&first.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_release_clears_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = store.create(new_job(RunMode::Deferred)).unwrap();

        store.reserve_next().unwrap().unwrap();
        store.release(&job.id).unwrap();
        assert!(!store.is_leased(&job.id));
        // Still processing, so not eligible again
        assert!(store.reserve_next().unwrap().is_none());

        // Releasing twice is harmless
        store.release(&job.id).unwrap();
    }

    #[test]
    fn test_finished_job_is_not_reclaimed_after_stale_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = store.create(new_job(RunMode::Deferred)).unwrap();

        // Another worker finished it between our scan and our lease attempt
        store
            .update(
                &job.id,
                JobUpdate::step("Completed!", 100).status(JobStatus::Completed),
            )
            .unwrap();
        assert!(store.try_lease(&job.id).unwrap());
        assert!(store.claim(&job.id).unwrap().is_none());
        store.release(&job.id).unwrap();

        assert_eq!(store.load(&job.id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_at_most_one_worker_gets_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path()).unwrap());
        let job = store.create(new_job(RunMode::Deferred)).unwrap();

        let workers = 16;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.reserve_next().unwrap().map(|job| job.id)
                })
            })
            .collect();

        let winners: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners, vec![job.id]);
    }
}
