//! Job record CRUD.

use crate::atomic::write_json_atomic;
use crate::{StoreError, StoreResult};
use chrono::Utc;
use cloak_core::{Job, JobId, JobUpdate, NewJob};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const JOBS_DIR: &str = "jobs";
const RECORD_FILE: &str = "job.json";
const LOG_FILE: &str = "logs.txt";
const LEASE_MARKER: &str = ".lock";

/// Durable store of job records rooted at a directory.
///
/// Cloning is cheap; clones share the same directory and can be handed to
/// other threads or processes freely, since every mutation goes through an
/// atomic rename or an exclusive directory create.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(JOBS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(JOBS_DIR).join(id.to_string())
    }

    pub fn job_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(RECORD_FILE)
    }

    pub fn log_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(LOG_FILE)
    }

    pub(crate) fn lease_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(LEASE_MARKER)
    }

    /// Allocate a fresh id and persist a queued record for it.
    pub fn create(&self, params: NewJob) -> StoreResult<Job> {
        self.create_with_id(JobId::new(), params)
    }

    /// Persist a queued record under an id the caller allocated up front,
    /// so files keyed by the id can be staged before the record exists.
    pub fn create_with_id(&self, id: JobId, params: NewJob) -> StoreResult<Job> {
        let dir = self.job_dir(&id);
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(id));
            }
            Err(e) => return Err(e.into()),
        }

        let job = Job::new(id, params, Utc::now());
        write_json_atomic(&self.job_path(&id), &job)?;
        fs::File::create(self.log_path(&id))?;

        debug!(job_id = %id, run_mode = %job.run_mode, "Created job");
        Ok(job)
    }

    /// Read the current record for `id`.
    pub fn load(&self, id: &JobId) -> StoreResult<Job> {
        let text = match fs::read_to_string(self.job_path(id)) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*id));
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
            id: *id,
            message: e.to_string(),
        })
    }

    /// Read-modify-write a record.
    ///
    /// Not serialized against other writers of the same job; only the lease
    /// holder is expected to call this for a processing job.
    pub fn update(&self, id: &JobId, update: JobUpdate) -> StoreResult<Job> {
        let mut job = self.load(id)?;
        job.apply(update, Utc::now())?;
        write_json_atomic(&self.job_path(id), &job)?;
        Ok(job)
    }

    /// All records, oldest first.
    pub fn list(&self) -> StoreResult<Vec<Job>> {
        let mut jobs = Vec::new();

        for entry in fs::read_dir(self.root.join(JOBS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<JobId>().ok())
            else {
                continue;
            };

            match self.load(&id) {
                Ok(job) => jobs.push(job),
                // Directory exists but the first write hasn't landed yet
                Err(StoreError::NotFound(_)) => continue,
                Err(StoreError::Corrupt { id, message }) => {
                    warn!(job_id = %id, error = %message, "Skipping corrupt job record");
                }
                Err(e) => return Err(e),
            }
        }

        jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(jobs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cloak_core::{JobStatus, RunMode, TechniqueKind, Tuning};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    pub(crate) fn new_job(run_mode: RunMode) -> NewJob {
        NewJob {
            input_path: "/src/main.c".into(),
            upload_path: "/uploads/main.c".into(),
            techniques: [TechniqueKind::Bogus, TechniqueKind::Opaque]
                .into_iter()
                .collect(),
            tuning: Tuning::default(),
            run_mode,
            requested_output: None,
        }
    }

    #[test]
    fn test_create_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let job = store.create(new_job(RunMode::Deferred)).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);
        assert!(store.log_path(&job.id).exists());

        let loaded = store.load(&job.id).unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn test_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let ids: HashSet<JobId> = (0..200)
            .map(|_| store.create(new_job(RunMode::Inline)).unwrap().id)
            .collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_create_refuses_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let first = store.create(new_job(RunMode::Deferred)).unwrap();
        let err = store
            .create_with_id(first.id, new_job(RunMode::Inline))
            .unwrap_err();
        assert_matches!(err, StoreError::AlreadyExists(id) if id == first.id);

        // Original record untouched
        assert_eq!(store.load(&first.id).unwrap().run_mode, RunMode::Deferred);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let missing = JobId::new();
        assert_matches!(store.load(&missing), Err(StoreError::NotFound(id)) if id == missing);

        let job = store.create(new_job(RunMode::Deferred)).unwrap();
        fs::write(store.job_path(&job.id), "{\"id\": ").unwrap();
        assert_matches!(store.load(&job.id), Err(StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_update_merges_and_rejects_regression() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = store.create(new_job(RunMode::Deferred)).unwrap();

        let updated = store
            .update(
                &job.id,
                JobUpdate::step("Analyzing file structure...", 10).status(JobStatus::Processing),
            )
            .unwrap();
        assert_eq!(updated.stage, "Analyzing file structure...");
        assert_eq!(updated.created_at, job.created_at);
        assert!(updated.updated_at >= job.updated_at);

        let err = store
            .update(&job.id, JobUpdate::new().status(JobStatus::Queued))
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidTransition(_));

        let err = store
            .update(&job.id, JobUpdate::new().progress(150))
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidInput(_));
    }

    #[test]
    fn test_list_is_oldest_first_and_skips_partial() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();

        let a = store.create(new_job(RunMode::Deferred)).unwrap();
        let b = store.create(new_job(RunMode::Inline)).unwrap();
        let c = store.create(new_job(RunMode::Deferred)).unwrap();

        // In-flight creation, no record yet
        fs::create_dir(store.job_dir(&JobId::new())).unwrap();
        // Unrelated clutter
        fs::create_dir(dir.path().join(JOBS_DIR).join("not-a-job")).unwrap();

        let corrupt = store.create(new_job(RunMode::Deferred)).unwrap();
        fs::write(store.job_path(&corrupt.id), "garbage").unwrap();

        let ids: Vec<JobId> = store.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_reload_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).unwrap();
        let job = store.create(new_job(RunMode::Deferred)).unwrap();
        store
            .update(
                &job.id,
                JobUpdate::step("Completed!", 100).status(JobStatus::Completed),
            )
            .unwrap();

        let before = fs::read(store.job_path(&job.id)).unwrap();
        let first = store.load(&job.id).unwrap();
        let second = store.load(&job.id).unwrap();
        let after = fs::read(store.job_path(&job.id)).unwrap();

        assert_eq!(first, second);
        assert_eq!(before, after);
    }

    #[test]
    fn test_readers_never_see_torn_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::open(dir.path()).unwrap());
        let job = store.create(new_job(RunMode::Deferred)).unwrap();
        store
            .update(&job.id, JobUpdate::new().status(JobStatus::Processing))
            .unwrap();

        let writer = {
            let store = Arc::clone(&store);
            let id = job.id;
            thread::spawn(move || {
                for i in 1..=100u8 {
                    // Stage and progress always written together
                    store
                        .update(&id, JobUpdate::step(format!("step {i}"), i))
                        .unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = job.id;
                thread::spawn(move || {
                    for _ in 0..200 {
                        let job = store.load(&id).unwrap();
                        if job.progress > 0 {
                            assert_eq!(job.stage, format!("step {}", job.progress));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.load(&job.id).unwrap().progress, 100);
    }
}
