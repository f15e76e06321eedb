//! Job record and lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::technique::{TechniqueKind, TechniqueResult, TechniqueSelection, Tuning};
use crate::{Error, JobId, Result};

/// Lifecycle status of a job.
///
/// Transitions only move forward: `queued -> processing -> completed | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Error => 2,
        }
    }

    /// Whether a record in this status may be rewritten with `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        *self == next || next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a job gets executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run synchronously in the submitting process.
    Inline,
    /// Queued for pickup by the service loop.
    #[serde(alias = "service")]
    Deferred,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Inline => f.write_str("inline"),
            RunMode::Deferred => f.write_str("deferred"),
        }
    }
}

/// Aggregated outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Report of the primary (last succeeded) technique.
    pub primary: Option<serde_json::Value>,
    pub all_results: BTreeMap<TechniqueKind, TechniqueResult>,
    pub successful_techniques: Vec<TechniqueKind>,
    pub failed_techniques: Vec<TechniqueKind>,
}

/// Parameters supplied by the producer when creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub input_path: PathBuf,
    pub upload_path: PathBuf,
    pub techniques: TechniqueSelection,
    pub tuning: Tuning,
    pub run_mode: RunMode,
    pub requested_output: Option<PathBuf>,
}

/// A persisted unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// 0-100.
    pub progress: u8,
    pub stage: String,
    pub techniques: TechniqueSelection,
    pub tuning: Tuning,
    pub run_mode: RunMode,
    pub input_path: PathBuf,
    pub upload_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_output: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh queued record.
    pub fn new(id: JobId, params: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            progress: 0,
            stage: "Queued".to_string(),
            techniques: params.techniques,
            tuning: params.tuning,
            run_mode: params.run_mode,
            input_path: params.input_path,
            upload_path: params.upload_path,
            requested_output: params.requested_output,
            output_file: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a partial update into this record.
    ///
    /// Rejects status regressions and out-of-range progress. While the job
    /// stays in `processing`, a lower progress value leaves the stored one
    /// in place.
    pub fn apply(&mut self, update: JobUpdate, now: DateTime<Utc>) -> Result<()> {
        let next_status = update.status.unwrap_or(self.status);
        if !self.status.can_transition_to(next_status) {
            return Err(Error::Conflict(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next_status
            )));
        }

        if let Some(progress) = update.progress {
            if progress > 100 {
                return Err(Error::InvalidInput(format!(
                    "progress {} is out of range",
                    progress
                )));
            }
            let keep_current = self.status == JobStatus::Processing
                && next_status == JobStatus::Processing
                && progress < self.progress;
            if !keep_current {
                self.progress = progress;
            }
        }

        self.status = next_status;
        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        if let Some(output_file) = update.output_file {
            self.output_file = Some(output_file);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        self.updated_at = now;
        Ok(())
    }
}

/// A partial set of fields to merge into a stored job.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub output_file: Option<PathBuf>,
    pub result: Option<JobOutcome>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn result(mut self, result: JobOutcome) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Stage + progress, the most common mid-run update.
    pub fn step(stage: impl Into<String>, progress: u8) -> Self {
        Self::new().stage(stage).progress(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_job() -> Job {
        Job::new(
            JobId::new(),
            NewJob {
                input_path: "/src/main.c".into(),
                upload_path: "/uploads/main.c".into(),
                techniques: [TechniqueKind::Bogus].into_iter().collect(),
                tuning: Tuning::default(),
                run_mode: RunMode::Deferred,
                requested_output: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_transitions_only_move_forward() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn test_apply_rejects_regression() {
        let mut job = queued_job();
        job.apply(JobUpdate::new().status(JobStatus::Completed), Utc::now())
            .unwrap();
        let err = job
            .apply(JobUpdate::new().status(JobStatus::Processing), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_progress_never_decreases_while_processing() {
        let mut job = queued_job();
        job.apply(
            JobUpdate::step("Analyzing", 40).status(JobStatus::Processing),
            Utc::now(),
        )
        .unwrap();
        job.apply(JobUpdate::step("Late", 20), Utc::now()).unwrap();
        assert_eq!(job.progress, 40);
        assert_eq!(job.stage, "Late");

        let err = job.apply(JobUpdate::new().progress(101), Utc::now());
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_apply_refreshes_updated_at_only() {
        let mut job = queued_job();
        let created = job.created_at;
        let later = created + chrono::Duration::seconds(5);
        job.apply(JobUpdate::new().stage("x"), later).unwrap();
        assert_eq!(job.created_at, created);
        assert_eq!(job.updated_at, later);
    }

    #[test]
    fn test_unset_fields_are_omitted() {
        let job = queued_job();
        let value = serde_json::to_value(&job).unwrap();
        assert!(value.get("error").is_none());
        assert!(value.get("output_file").is_none());
        assert_eq!(value["status"], "queued");
        assert_eq!(value["run_mode"], "deferred");
        assert_eq!(value["techniques"], serde_json::json!(["bogus"]));
    }

    #[test]
    fn test_run_mode_accepts_service_alias() {
        let mode: RunMode = serde_json::from_str(r#""service""#).unwrap();
        assert_eq!(mode, RunMode::Deferred);
    }

    #[test]
    fn test_outcome_map_keys_are_technique_names() {
        let mut all_results = BTreeMap::new();
        all_results.insert(
            TechniqueKind::ControlFlow,
            TechniqueResult::error("missing tool"),
        );
        let outcome = JobOutcome {
            primary: None,
            all_results,
            successful_techniques: vec![],
            failed_techniques: vec![TechniqueKind::ControlFlow],
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains(r#""control-flow":{"status":"error""#));
        let back: JobOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
    }
}
