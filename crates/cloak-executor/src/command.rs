//! Technique implementation that shells out to configured toolchains.

use crate::process::{OutputStream, run_step};
use crate::tools::find_tool;
use crate::{ExecutorError, ExecutorResult};
use async_trait::async_trait;
use cloak_config::{TechniqueDefinition, VariableContext, VariableContextBuilder};
use cloak_core::{LogSink, Technique, TechniqueContext, TechniqueKind, TechniqueResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Runs the steps of a `TechniqueDefinition` as external processes.
#[derive(Debug, Clone)]
pub struct CommandTechnique {
    definition: TechniqueDefinition,
}

#[derive(Debug, Serialize)]
struct StepReport {
    command: Vec<String>,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct CommandReport {
    technique: TechniqueKind,
    steps: Vec<StepReport>,
    packed: bool,
    duration_ms: u64,
}

impl CommandTechnique {
    pub fn new(definition: TechniqueDefinition) -> Self {
        Self { definition }
    }

    pub fn definition(&self) -> &TechniqueDefinition {
        &self.definition
    }

    fn work_dir(&self, ctx: &TechniqueContext<'_>) -> PathBuf {
        ctx.output_dir
            .join(".work")
            .join(format!("{}-{}", ctx.job_id, self.definition.kind.name()))
    }

    fn variables(&self, ctx: &TechniqueContext<'_>, work_dir: &Path) -> VariableContext {
        let mut vars = VariableContextBuilder::new()
            .with_job(ctx.job_id)
            .with_technique(self.definition.kind)
            .with_tuning(ctx.tuning)
            .with_input(ctx.input_path)
            .with_output_dir(ctx.output_dir)
            .with_work_dir(work_dir)
            .with_process_env()
            .build();

        let output = PathBuf::from(vars.interpolate(&self.definition.output));
        let output = if output.is_relative() {
            ctx.output_dir.join(output)
        } else {
            output
        };
        vars.paths.output = output.to_string_lossy().to_string();
        vars
    }

    /// Run the steps in a fresh work directory, removing it afterwards
    /// whether or not the steps succeeded.
    async fn run(
        &self,
        ctx: &TechniqueContext<'_>,
        log: &dyn LogSink,
    ) -> ExecutorResult<(PathBuf, CommandReport)> {
        let work_dir = self.work_dir(ctx);
        tokio::fs::create_dir_all(&work_dir).await?;

        let outcome = self.run_in(ctx, log, &work_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            debug!(path = %work_dir.display(), error = %e, "Could not remove work directory");
        }
        outcome
    }

    async fn run_in(
        &self,
        ctx: &TechniqueContext<'_>,
        log: &dyn LogSink,
        work_dir: &Path,
    ) -> ExecutorResult<(PathBuf, CommandReport)> {
        let started = Instant::now();
        let kind = self.definition.kind;

        let vars = self.variables(ctx, work_dir);
        let output = PathBuf::from(&vars.paths.output);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut steps = Vec::with_capacity(self.definition.steps.len());
        for template in &self.definition.steps {
            let unresolved = vars.find_unresolved(template);
            if !unresolved.is_empty() {
                return Err(ExecutorError::Unresolved {
                    template: template.clone(),
                    names: unresolved,
                });
            }

            let argv = vars.interpolate_args(template);
            log.log(ctx.job_id, &format!("[{}] $ {}", kind, argv.join(" ")));
            let step = run_step(&argv, work_dir, self.definition.timeout, |line| {
                match line.stream {
                    OutputStream::Stdout => log.log(ctx.job_id, &line.content),
                    OutputStream::Stderr => {
                        log.log(ctx.job_id, &format!("[{}] {}", kind, line.content))
                    }
                }
            })
            .await?;

            steps.push(StepReport {
                command: argv,
                duration_ms: step.duration.as_millis() as u64,
            });
        }

        if !output.is_file() {
            return Err(ExecutorError::MissingOutput(output));
        }

        let packed = if self.definition.pack {
            self.pack(ctx, log, &output, work_dir).await
        } else {
            false
        };

        Ok((
            output,
            CommandReport {
                technique: kind,
                steps,
                packed,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        ))
    }

    /// Compress the artifact with upx. Never fails the technique.
    async fn pack(
        &self,
        ctx: &TechniqueContext<'_>,
        log: &dyn LogSink,
        output: &Path,
        work_dir: &Path,
    ) -> bool {
        let Some(args) = ctx.tuning.upx_level.args() else {
            return false;
        };
        let Some(upx) = find_tool("upx") else {
            log.log(ctx.job_id, "UPX not found, skipping packing");
            return false;
        };

        let mut argv = vec![upx.to_string_lossy().to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv.push(output.to_string_lossy().to_string());

        log.log(
            ctx.job_id,
            &format!("Packing with UPX ({})", ctx.tuning.upx_level.as_str()),
        );
        match run_step(&argv, work_dir, self.definition.timeout, |line| {
            debug!(job_id = %ctx.job_id, line = %line.content, "upx");
        })
        .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(job_id = %ctx.job_id, error = %e, "UPX packing failed");
                log.log(ctx.job_id, &format!("UPX packing failed: {e}"));
                false
            }
        }
    }
}

#[async_trait]
impl Technique for CommandTechnique {
    fn kind(&self) -> TechniqueKind {
        self.definition.kind
    }

    async fn process(&self, ctx: TechniqueContext<'_>, log: &dyn LogSink) -> TechniqueResult {
        info!(job_id = %ctx.job_id, technique = %self.definition.kind, "Running technique");

        match self.run(&ctx, log).await {
            Ok((output, report)) => match serde_json::to_value(&report) {
                Ok(value) => TechniqueResult::completed(output, value),
                Err(e) => TechniqueResult::error(format!("failed to encode report: {e}")),
            },
            Err(e) => {
                warn!(job_id = %ctx.job_id, technique = %self.definition.kind, error = %e, "Technique failed");
                TechniqueResult::error(e.to_string())
            }
        }
    }
}
