//! Pipeline dispatcher - runs a job's techniques in canonical order.

use crate::{DispatchError, DispatchResult};
use cloak_core::{
    Job, JobId, JobOutcome, JobStatus, JobUpdate, LogSink, TechniqueContext, TechniqueKind,
    TechniqueRegistry, TechniqueResult,
};
use cloak_store::{JobStore, StoreError};
use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Event emitted while a job is dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StageStarted {
        job_id: JobId,
        technique: TechniqueKind,
        stage: String,
        progress: u8,
    },
    StageCompleted {
        job_id: JobId,
        technique: TechniqueKind,
        success: bool,
    },
    JobFinished {
        job_id: JobId,
        status: JobStatus,
    },
}

/// Log sink that appends to the job's log file and mirrors to tracing.
#[derive(Debug, Clone)]
pub struct StoreLogSink {
    store: JobStore,
}

impl StoreLogSink {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }
}

impl LogSink for StoreLogSink {
    fn log(&self, job_id: &JobId, message: &str) {
        info!(job_id = %job_id, "{}", message);
        if let Err(e) = self.store.append_log(job_id, message) {
            warn!(job_id = %job_id, error = %e, "Failed to append job log");
        }
    }
}

/// Runs selected techniques over a job and records the aggregated outcome.
#[derive(Clone)]
pub struct PipelineDispatcher {
    store: JobStore,
    registry: TechniqueRegistry,
    output_dir: PathBuf,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl PipelineDispatcher {
    pub fn new(store: JobStore, registry: TechniqueRegistry, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            registry,
            output_dir: output_dir.into(),
            events: None,
        }
    }

    /// Send progress events to `tx` as the pipeline runs.
    pub fn with_events(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Run every selected technique and finalize the job.
    ///
    /// Technique failures are recorded, not returned; an `Err` here means the
    /// store itself failed.
    pub async fn run(&self, id: &JobId) -> DispatchResult<Job> {
        let log = StoreLogSink::new(self.store.clone());
        let job = self.store.load(id)?;

        self.store.update(
            id,
            JobUpdate::step("Initializing...", 5).status(JobStatus::Processing),
        )?;
        log.log(id, "Starting obfuscation process...");

        let selected: Vec<TechniqueKind> = job.techniques.iter().collect();
        let names: Vec<&str> = selected.iter().map(|k| k.name()).collect();
        log.log(
            id,
            &format!(
                "Selected techniques: {}",
                if names.is_empty() { "None".to_string() } else { names.join(", ") }
            ),
        );

        self.store
            .update(id, JobUpdate::step("Analyzing file structure...", 10))?;

        let total = selected.len().max(1);
        let mut results: BTreeMap<TechniqueKind, TechniqueResult> = BTreeMap::new();

        for (index, kind) in selected.iter().copied().enumerate() {
            let progress = (10 + index * 80 / total) as u8;
            self.store
                .update(id, JobUpdate::step(kind.stage_label(), progress))?;
            self.emit(PipelineEvent::StageStarted {
                job_id: *id,
                technique: kind,
                stage: kind.stage_label().to_string(),
                progress,
            })
            .await;

            let result = match self.registry.get(kind) {
                Some(technique) => {
                    let ctx = TechniqueContext {
                        job_id: id,
                        input_path: &job.upload_path,
                        output_dir: &self.output_dir,
                        tuning: &job.tuning,
                    };
                    technique.process(ctx, &log).await
                }
                None => TechniqueResult::error(format!("no implementation registered for {kind}")),
            };

            if let Some(message) = result.error_message() {
                log_technique_error(&log, id, kind, message);
            }
            self.emit(PipelineEvent::StageCompleted {
                job_id: *id,
                technique: kind,
                success: result.is_success(),
            })
            .await;
            results.insert(kind, result);
        }

        let finished = self.finalize(&job, results, &log).await?;
        self.emit(PipelineEvent::JobFinished {
            job_id: *id,
            status: finished.status,
        })
        .await;
        Ok(finished)
    }

    async fn finalize(
        &self,
        job: &Job,
        mut results: BTreeMap<TechniqueKind, TechniqueResult>,
        log: &StoreLogSink,
    ) -> DispatchResult<Job> {
        let id = &job.id;
        let successful: Vec<TechniqueKind> = results
            .iter()
            .filter(|(_, r)| r.is_success())
            .map(|(k, _)| *k)
            .collect();
        let failed: Vec<TechniqueKind> = results
            .iter()
            .filter(|(_, r)| !r.is_success())
            .map(|(k, _)| *k)
            .collect();

        // Last succeeder in canonical order is the primary output
        let Some(primary_kind) = successful.last().copied() else {
            let details = if results.is_empty() {
                "No techniques succeeded".to_string()
            } else {
                results
                    .iter()
                    .map(|(kind, r)| format!("{}: {}", kind, r.error_message().unwrap_or("unknown error")))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            let outcome = JobOutcome {
                primary: None,
                all_results: results,
                successful_techniques: successful,
                failed_techniques: failed,
            };
            let finished = self.store.update(
                id,
                JobUpdate::step("Failed", 100)
                    .status(JobStatus::Error)
                    .error(details.clone())
                    .result(outcome),
            )?;
            log.log(id, &format!("All selected techniques failed: {details}"));
            return Ok(finished);
        };

        let mut output_file = results
            .get(&primary_kind)
            .and_then(|r| r.output_file())
            .map(Path::to_path_buf);

        if let (Some(target), Some(current)) = (&job.requested_output, &output_file) {
            match move_output(current, target).await {
                Ok(()) => {
                    if let Some(TechniqueResult::Completed { output_file, .. }) =
                        results.get_mut(&primary_kind)
                    {
                        *output_file = target.clone();
                    }
                    output_file = Some(target.clone());
                    log.log(id, &format!("Output moved to {}", target.display()));
                }
                Err(e) => {
                    log.log(id, &format!("Failed to move output to requested path: {e}"));
                }
            }
        }

        let primary = match results.get(&primary_kind) {
            Some(TechniqueResult::Completed { result, .. }) => Some(result.clone()),
            _ => None,
        };
        let outcome = JobOutcome {
            primary,
            all_results: results,
            successful_techniques: successful.clone(),
            failed_techniques: failed.clone(),
        };

        let mut update = JobUpdate::step("Completed!", 100)
            .status(JobStatus::Completed)
            .result(outcome);
        if let Some(path) = output_file {
            update = update.output_file(path);
        }
        let finished = self.store.update(id, update)?;
        log.log(
            id,
            &format!(
                "Obfuscation completed! Successful: {}, Failed: {}",
                successful.len(),
                failed.len()
            ),
        );
        Ok(finished)
    }

    /// Run the pipeline in its own task so a panicking technique cannot take
    /// down the caller.
    ///
    /// Any failure, including a store error mid-run, is recorded on the job
    /// as `error` before returning.
    pub async fn run_guarded(&self, id: &JobId) -> DispatchResult<Job> {
        let dispatcher = self.clone();
        let job_id = *id;
        let failure = match tokio::spawn(async move { dispatcher.run(&job_id).await }).await {
            Ok(Ok(job)) => return Ok(job),
            Ok(Err(e)) => e,
            Err(join_err) if join_err.is_panic() => {
                DispatchError::Panicked(panic_message(join_err.into_panic()))
            }
            Err(join_err) => DispatchError::Panicked(join_err.to_string()),
        };

        error!(job_id = %id, error = %failure, "Dispatch failed");
        self.record_failure(id, &failure.to_string())
    }

    fn record_failure(&self, id: &JobId, message: &str) -> DispatchResult<Job> {
        StoreLogSink::new(self.store.clone()).log(id, &format!("Service error: {message}"));

        let update = JobUpdate::step("Failed", 100)
            .status(JobStatus::Error)
            .error(message);
        match self.store.update(id, update) {
            Ok(job) => Ok(job),
            // Already terminal; keep what the pipeline recorded
            Err(StoreError::InvalidTransition(_)) => Ok(self.store.load(id)?),
            Err(e) => Err(e.into()),
        }
    }
}

fn log_technique_error(log: &dyn LogSink, id: &JobId, kind: TechniqueKind, message: &str) {
    log.log(id, &format!("ERROR in {kind}: {message}"));
    if message.contains("llvm-as") && message.contains("expected instruction opcode") {
        log.log(id, &format!("LLVM IR syntax error in {kind} - continuing"));
    } else if message.contains("llvm-dis") {
        log.log(id, &format!("LLVM disassembly error in {kind} - continuing"));
    }
}

async fn move_output(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
