//! System configuration parsing.

use crate::nodes::{
    get_all_string_args, get_first_number_arg, parse_technique_name, parse_value,
    require_string_arg,
};
use crate::{ConfigError, ConfigResult};
use cloak_core::{TechniqueKind, Tuning};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_STEP_TIMEOUT_SECS: f64 = 300.0;
const DEFAULT_POLL_INTERVAL_SECS: f64 = 2.0;

/// Built-in configuration used when no config file exists.
///
/// The technique commands target a Hikari-style clang build; override any
/// `technique` node in `cloak.kdl` to use a different toolchain.
pub const DEFAULT_CONFIG: &str = r#"
store "jobdata"
outputs "outputs"
uploads "uploads"
poll-interval 2.0

defaults {
    obf-level "medium"
    upx-level "high"
}

technique "string-encryption" {
    requires "clang"
    run "clang -O0 -mllvm -enable-strcry ${input} -o ${output}"
    output "${output_dir}/${job.short_id}_string_encryption"
    pack
}

technique "control-flow" {
    requires "clang"
    run "clang -O0 -mllvm -enable-cffobf ${input} -o ${output}"
    output "${output_dir}/${job.short_id}_control_flow"
    pack
}

technique "bogus" {
    requires "clang"
    run "clang -O0 -mllvm -enable-bcfobf -mllvm -bcf_loop=${obf.passes} ${input} -o ${output}"
    output "${output_dir}/${job.short_id}_bogus"
    pack
}

technique "key-function-virtualization" {
    requires "clang"
    run "clang -O0 -mllvm -enable-funcwra ${input} -o ${output}"
    output "${output_dir}/${job.short_id}_key_function_vm"
    pack
}

technique "opaque" {
    requires "clang"
    run "clang -O0 -mllvm -enable-splitobf -mllvm -enable-subobf -mllvm -sub_loop=${obf.passes} ${input} -o ${output}"
    output "${output_dir}/${job.short_id}_opaque"
    pack
}

technique "preprocessor-trickery" {
    requires "gcc"
    run "gcc -E -P ${input} -o ${work_dir}/expanded.c"
    run "gcc -O0 ${work_dir}/expanded.c -o ${output}"
    output "${output_dir}/${job.short_id}_preprocessor"
    pack
}

technique "address-obfuscation" {
    requires "clang"
    run "clang -O0 -mllvm -enable-indibran ${input} -o ${output}"
    output "${output_dir}/${job.short_id}_address"
    pack
}
"#;

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Root of the job record store.
    pub store: PathBuf,
    /// Directory techniques write artifacts into.
    pub outputs: PathBuf,
    /// Directory submitted sources are copied into.
    pub uploads: PathBuf,
    /// Idle sleep between queue polls.
    pub poll_interval: Duration,
    /// Tuning applied when a submission does not override it.
    pub defaults: Tuning,
    /// Technique command definitions, at most one per kind.
    pub techniques: Vec<TechniqueDefinition>,
}

/// How to run one technique through external tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniqueDefinition {
    pub kind: TechniqueKind,
    /// Executables that must be on PATH.
    pub requires: Vec<String>,
    /// Command templates, run in order.
    pub steps: Vec<String>,
    /// Template for the produced artifact path.
    pub output: String,
    /// Pack the artifact with upx when the tuning asks for it.
    pub pack: bool,
    /// Per-step timeout.
    pub timeout: Duration,
}

impl SystemConfig {
    /// The built-in configuration.
    pub fn builtin() -> ConfigResult<Self> {
        parse_system_config(DEFAULT_CONFIG)
    }

    /// Load a config file, or the built-in config if the file does not exist.
    ///
    /// Technique kinds the file does not define keep their built-in definition.
    pub fn load_or_builtin(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Self::builtin();
        }
        let content = std::fs::read_to_string(path)?;
        parse_system_config(&content)?.with_builtin_techniques()
    }

    /// Fill in built-in definitions for any technique kind not configured.
    pub fn with_builtin_techniques(mut self) -> ConfigResult<Self> {
        let builtin = Self::builtin()?;
        for definition in builtin.techniques {
            if self.technique(definition.kind).is_none() {
                self.techniques.push(definition);
            }
        }
        self.techniques.sort_by_key(|d| d.kind);
        Ok(self)
    }

    /// Resolve relative paths against `base`.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        for path in [&mut self.store, &mut self.outputs, &mut self.uploads] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }

    pub fn technique(&self, kind: TechniqueKind) -> Option<&TechniqueDefinition> {
        self.techniques.iter().find(|d| d.kind == kind)
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = SystemConfig {
        store: PathBuf::from("jobdata"),
        outputs: PathBuf::from("outputs"),
        uploads: PathBuf::from("uploads"),
        poll_interval: Duration::from_secs_f64(DEFAULT_POLL_INTERVAL_SECS),
        defaults: Tuning::default(),
        techniques: Vec::new(),
    };

    for node in doc.nodes() {
        match node.name().value() {
            "store" => config.store = require_string_arg(node, "store")?.into(),
            "outputs" => config.outputs = require_string_arg(node, "outputs")?.into(),
            "uploads" => config.uploads = require_string_arg(node, "uploads")?.into(),
            "poll-interval" => {
                config.poll_interval = parse_seconds(node, "poll-interval")?;
            }
            "defaults" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "obf-level" => {
                                config.defaults.obfuscation_level =
                                    parse_value(child, "obf-level")?;
                            }
                            "upx-level" => {
                                config.defaults.upx_level = parse_value(child, "upx-level")?;
                            }
                            _ => {}
                        }
                    }
                }
            }
            "technique" => {
                let definition = parse_technique(node)?;
                if config.technique(definition.kind).is_some() {
                    return Err(ConfigError::Duplicate(format!(
                        "technique '{}'",
                        definition.kind
                    )));
                }
                config.techniques.push(definition);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.techniques.sort_by_key(|d| d.kind);
    Ok(config)
}

fn parse_technique(node: &KdlNode) -> ConfigResult<TechniqueDefinition> {
    let name = require_string_arg(node, "technique name")?;
    let kind = parse_technique_name(&name)?;

    let mut requires = Vec::new();
    let mut steps = Vec::new();
    let mut output = String::new();
    let mut pack = false;
    let mut timeout = Duration::from_secs_f64(DEFAULT_STEP_TIMEOUT_SECS);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "requires" => requires.extend(get_all_string_args(child)),
                "run" => steps.push(require_string_arg(child, "run command")?),
                "output" => output = require_string_arg(child, "output")?,
                "pack" => pack = true,
                "timeout" => timeout = parse_seconds(child, "timeout")?,
                _ => {}
            }
        }
    }

    if steps.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run command for technique '{}'",
            name
        )));
    }
    if output.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "output for technique '{}'",
            name
        )));
    }

    Ok(TechniqueDefinition {
        kind,
        requires,
        steps,
        output,
        pack,
        timeout,
    })
}

fn parse_seconds(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let secs =
        get_first_number_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("must be a positive number of seconds, got {}", secs),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}
