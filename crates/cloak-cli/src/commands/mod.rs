//! CLI command implementations.

pub mod serve;
pub mod submit;

use anyhow::{Context as _, Result};
use cloak_config::SystemConfig;
use cloak_core::{Job, JobId};
use cloak_executor::{check_tools as check_tool_availability, registry_from_config};
use cloak_scheduler::PipelineDispatcher;
use cloak_store::{JobStore, StoreError};
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;

/// Configuration and store shared by every command.
pub struct Context {
    pub config: SystemConfig,
    pub store: JobStore,
}

impl Context {
    pub fn load(home: Option<&Path>, config_file: &Path) -> Result<Self> {
        let home = match home {
            Some(home) => home.to_path_buf(),
            None => std::env::current_dir().context("Failed to determine current directory")?,
        };
        let config_path = home.join(config_file);

        let config = SystemConfig::load_or_builtin(&config_path)
            .with_context(|| format!("Failed to load config file: {}", config_path.display()))?
            .resolve_paths(&home);

        let store = JobStore::open(&config.store)
            .with_context(|| format!("Failed to open job store: {}", config.store.display()))?;

        Ok(Self { config, store })
    }

    pub fn dispatcher(&self) -> PipelineDispatcher {
        PipelineDispatcher::new(
            self.store.clone(),
            registry_from_config(&self.config),
            &self.config.outputs,
        )
    }
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .with_context(|| format!("Invalid job ID: {}", raw))
}

#[derive(Serialize)]
struct JobView<'a> {
    #[serde(flatten)]
    job: &'a Job,
    leased: bool,
}

pub fn status(ctx: &Context, job_id: Option<&str>) -> Result<ExitCode> {
    if let Some(raw) = job_id {
        let id = parse_job_id(raw)?;
        let job = match ctx.store.load(&id) {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                eprintln!("Job {} not found", id);
                return Ok(ExitCode::FAILURE);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to load job {}", id)),
        };
        let view = JobView {
            job: &job,
            leased: ctx.store.is_leased(&id),
        };
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(ExitCode::SUCCESS);
    }

    let jobs = ctx.store.list().context("Failed to list jobs")?;
    if jobs.is_empty() {
        println!("No jobs recorded.");
        return Ok(ExitCode::SUCCESS);
    }
    for job in jobs {
        println!("{}", summary_line(&job));
    }
    Ok(ExitCode::SUCCESS)
}

fn summary_line(job: &Job) -> String {
    format!(
        "{}: status={}, progress={}%, stage={}",
        job.id, job.status, job.progress, job.stage
    )
}

pub fn logs(ctx: &Context, job_id: &str) -> Result<ExitCode> {
    let id = parse_job_id(job_id)?;
    let lines = ctx
        .store
        .logs(&id)
        .with_context(|| format!("Failed to read logs for job {}", id))?;
    if lines.is_empty() {
        println!("No logs found for job {}", id);
        return Ok(ExitCode::FAILURE);
    }
    for line in lines {
        println!("{}", line);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn check_tools(ctx: &Context) -> Result<ExitCode> {
    let report = check_tool_availability(&ctx.config);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_core::{JobStatus, NewJob, RunMode, TechniqueKind, Tuning};

    #[test]
    fn test_context_uses_builtin_config_and_home() {
        let home = tempfile::tempdir().unwrap();
        let ctx = Context::load(Some(home.path()), Path::new("cloak.kdl")).unwrap();

        assert_eq!(ctx.config.store, home.path().join("jobdata"));
        assert_eq!(ctx.config.outputs, home.path().join("outputs"));
        assert!(home.path().join("jobdata").join("jobs").is_dir());
    }

    #[test]
    fn test_context_reads_config_file() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("custom.kdl"),
            "store \"state\"\npoll-interval 0.5\n",
        )
        .unwrap();

        let ctx = Context::load(Some(home.path()), Path::new("custom.kdl")).unwrap();
        assert_eq!(ctx.config.store, home.path().join("state"));
        assert_eq!(ctx.config.poll_interval.as_millis(), 500);
        assert_eq!(ctx.config.techniques.len(), TechniqueKind::ALL.len());
    }

    #[test]
    fn test_job_view_includes_lease_flag() {
        let home = tempfile::tempdir().unwrap();
        let ctx = Context::load(Some(home.path()), Path::new("cloak.kdl")).unwrap();
        let job = ctx
            .store
            .create(NewJob {
                input_path: "main.c".into(),
                upload_path: "uploads/main.c".into(),
                techniques: [TechniqueKind::Bogus].into_iter().collect(),
                tuning: Tuning::default(),
                run_mode: RunMode::Deferred,
                requested_output: None,
            })
            .unwrap();

        let value = serde_json::to_value(JobView {
            job: &job,
            leased: false,
        })
        .unwrap();
        assert_eq!(value["id"], job.id.to_string());
        assert_eq!(value["status"], "queued");
        assert_eq!(value["leased"], false);

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(
            summary_line(&job),
            format!("{}: status=queued, progress=0%, stage=Queued", job.id)
        );
    }
}
