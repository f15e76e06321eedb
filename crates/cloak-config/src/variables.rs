//! Variable interpolation for technique command templates.
//!
//! Supports variables like:
//! - `${input}` - Source file the technique reads
//! - `${output}` - Artifact path the technique must produce
//! - `${output_dir}` - Directory artifacts are written into
//! - `${work_dir}` - Scratch directory private to this technique run
//! - `${technique}` - Technique name (e.g. `control-flow`)
//! - `${job.id}` - Full job id
//! - `${job.short_id}` - First eight characters of the job id
//! - `${obf.level}` - Obfuscation level (`low`, `medium`, `high`)
//! - `${obf.passes}` - Pass count for the level (1, 2, 3)
//! - `${upx.level}` - Packer level (`off`, `low`, `medium`, `high`)
//! - `${env.VAR_NAME}` - Environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${datetime}` - ISO datetime

use cloak_core::{JobId, TechniqueKind, Tuning};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub job: JobContext,
    pub paths: PathContext,
    pub tuning: TuningContext,
    pub technique: String,
    /// Environment variables
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub id: String,
    pub short_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct PathContext {
    pub input: String,
    pub output: String,
    pub output_dir: String,
    pub work_dir: String,
}

#[derive(Debug, Clone, Default)]
pub struct TuningContext {
    pub level: String,
    pub passes: u32,
    pub upx_level: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["input"] => Some(self.paths.input.clone()),
            ["output"] => Some(self.paths.output.clone()),
            ["output_dir"] => Some(self.paths.output_dir.clone()),
            ["work_dir"] => Some(self.paths.work_dir.clone()),
            ["technique"] => Some(self.technique.clone()),

            ["job", "id"] => Some(self.job.id.clone()),
            ["job", "short_id"] => Some(self.job.short_id.clone()),

            ["obf", "level"] => Some(self.tuning.level.clone()),
            ["obf", "passes"] => Some(self.tuning.passes.to_string()),
            ["upx", "level"] => Some(self.tuning.upx_level.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Unknown variables are left in place.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Split a command template into arguments, then interpolate each one.
    ///
    /// Splitting happens first so a substituted path containing spaces stays
    /// a single argument.
    pub fn interpolate_args(&self, template: &str) -> Vec<String> {
        template
            .split_whitespace()
            .map(|arg| self.interpolate(arg))
            .collect()
    }

    /// Names of variables in `input` that this context cannot resolve.
    pub fn find_unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_job(mut self, id: &JobId) -> Self {
        self.ctx.job.id = id.to_string();
        self.ctx.job.short_id = id.short();
        self
    }

    pub fn with_technique(mut self, kind: TechniqueKind) -> Self {
        self.ctx.technique = kind.name().to_string();
        self
    }

    pub fn with_tuning(mut self, tuning: &Tuning) -> Self {
        self.ctx.tuning.level = tuning.obfuscation_level.as_str().to_string();
        self.ctx.tuning.passes = tuning.obfuscation_level.passes();
        self.ctx.tuning.upx_level = tuning.upx_level.as_str().to_string();
        self
    }

    pub fn with_input(mut self, path: &Path) -> Self {
        self.ctx.paths.input = path.to_string_lossy().to_string();
        self
    }

    pub fn with_output_dir(mut self, path: &Path) -> Self {
        self.ctx.paths.output_dir = path.to_string_lossy().to_string();
        self
    }

    pub fn with_work_dir(mut self, path: &Path) -> Self {
        self.ctx.paths.work_dir = path.to_string_lossy().to_string();
        self
    }

    pub fn with_process_env(mut self) -> Self {
        self.ctx.populate_env();
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
