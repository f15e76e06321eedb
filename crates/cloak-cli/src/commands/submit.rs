//! Job submission command.

use super::Context;
use anyhow::{Context as _, Result, bail};
use clap::Args;
use cloak_config::SubmitOverrides;
use cloak_core::{
    JobId, JobStatus, NewJob, ObfuscationLevel, RunMode, TechniqueKind, TechniqueSelection, Tuning,
    UpxLevel,
};
use cloak_executor::missing_tools;
use cloak_scheduler::PipelineEvent;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::mpsc;

const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp"];

#[derive(Args)]
pub struct SubmitArgs {
    /// Source file to obfuscate
    #[arg(short, long)]
    pub input: PathBuf,

    /// Technique to apply, by name or alias (repeatable)
    #[arg(short = 't', long = "technique")]
    pub techniques: Vec<TechniqueKind>,

    /// Apply every technique
    #[arg(long)]
    pub all: bool,

    /// Obfuscation intensity: low, medium, high
    #[arg(long)]
    pub obf_level: Option<ObfuscationLevel>,

    /// UPX compression: off, low, medium, high
    #[arg(long)]
    pub upx_level: Option<UpxLevel>,

    /// KDL file enabling/disabling techniques and setting levels
    #[arg(long)]
    pub overrides: Option<PathBuf>,

    /// Queue the job for `cloak serve` instead of running it now
    #[arg(long)]
    pub background: bool,

    /// Write the job result as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Where to place the primary output
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Submit even when required tools are missing
    #[arg(long)]
    pub skip_tool_check: bool,
}

impl SubmitArgs {
    /// Selection and tuning from flags, defaults and the override file.
    fn selection(&self, defaults: Tuning) -> Result<(TechniqueSelection, Tuning)> {
        let mut selection = if self.all {
            TechniqueSelection::all()
        } else {
            self.techniques.iter().copied().collect()
        };

        let mut tuning = defaults;
        if let Some(level) = self.obf_level {
            tuning.obfuscation_level = level;
        }
        if let Some(level) = self.upx_level {
            tuning.upx_level = level;
        }

        if let Some(path) = &self.overrides {
            SubmitOverrides::load(path)
                .with_context(|| format!("Failed to load overrides: {}", path.display()))?
                .apply(&mut selection, &mut tuning);
        }

        Ok((selection, tuning))
    }
}

fn validate_input(input: &Path) -> Result<()> {
    if !input.is_file() {
        bail!("Input file not found: {}", input.display());
    }
    let supported = input
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if !supported {
        bail!(
            "Unsupported input {}: expected one of .{}",
            input.display(),
            SOURCE_EXTENSIONS.join(", .")
        );
    }
    Ok(())
}

/// Copy the input to `uploads/<job id>/<file name>`.
fn copy_to_uploads(uploads: &Path, id: &JobId, input: &Path) -> Result<PathBuf> {
    let file_name = input
        .file_name()
        .with_context(|| format!("Input has no file name: {}", input.display()))?;
    let dir = uploads.join(id.to_string());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create uploads directory: {}", dir.display()))?;

    let target = dir.join(file_name);
    std::fs::copy(input, &target)
        .with_context(|| format!("Failed to copy input to {}", target.display()))?;
    Ok(target)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to determine current directory")?
        .join(path))
}

pub async fn run(ctx: &Context, args: SubmitArgs) -> Result<ExitCode> {
    validate_input(&args.input)?;

    let (techniques, tuning) = args.selection(ctx.config.defaults)?;
    if techniques.is_empty() {
        bail!("At least one obfuscation technique must be selected (-t <name> or --all)");
    }

    if !args.skip_tool_check {
        let missing = missing_tools(&ctx.config, &techniques);
        if !missing.is_empty() {
            eprintln!("Required tools not available for selected techniques:");
            for (kind, tool) in &missing {
                eprintln!("  - {}: {} not found on PATH", kind, tool);
            }
            return Ok(ExitCode::FAILURE);
        }
    }

    let input_path = absolute(&args.input)?;
    let requested_output = args.output.as_deref().map(absolute).transpose()?;
    let id = JobId::new();
    let upload_path = copy_to_uploads(&ctx.config.uploads, &id, &input_path)?;
    let run_mode = if args.background {
        RunMode::Deferred
    } else {
        RunMode::Inline
    };

    let created = ctx.store.create_with_id(
        id,
        NewJob {
            input_path,
            upload_path,
            techniques,
            tuning,
            run_mode,
            requested_output,
        },
    );
    let job = match created {
        Ok(job) => job,
        Err(e) => {
            let _ = std::fs::remove_dir_all(ctx.config.uploads.join(id.to_string()));
            return Err(e).context("Failed to create job");
        }
    };
    println!("Job {} created", job.id);

    if run_mode == RunMode::Deferred {
        println!("Job queued for background service. Run `cloak serve` to process queued jobs.");
        return Ok(ExitCode::SUCCESS);
    }

    let (tx, mut rx) = mpsc::channel(32);
    let dispatcher = ctx.dispatcher().with_events(tx);
    let handle = tokio::spawn(async move { dispatcher.run_guarded(&id).await });

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::StageStarted {
                stage, progress, ..
            } => {
                println!("[{:>3}%] {}", progress, stage);
            }
            PipelineEvent::StageCompleted {
                technique, success, ..
            } => {
                if success {
                    println!("  ✓ {}", technique);
                } else {
                    println!("  ✗ {}", technique);
                }
            }
            PipelineEvent::JobFinished { .. } => {}
        }
    }

    let job = handle.await.context("Dispatch task failed")??;

    if job.status != JobStatus::Completed {
        eprintln!("{}", job.error.as_deref().unwrap_or("Job failed"));
        return Ok(ExitCode::FAILURE);
    }

    match &job.output_file {
        Some(path) => println!("Obfuscation completed. Output file: {}", path.display()),
        None => println!("Obfuscation completed, but output path was not reported."),
    }

    if let Some(report) = &args.report {
        let body = serde_json::to_string_pretty(&job.result)?;
        std::fs::write(report, body)
            .with_context(|| format!("Failed to write report: {}", report.display()))?;
        println!("Detailed report written to {}", report.display());
    }

    Ok(ExitCode::SUCCESS)
}
