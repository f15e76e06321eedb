//! Technique trait and selection types.
//!
//! A technique is one independent, pluggable processing stage. The
//! dispatcher runs the selected techniques in the canonical order declared
//! by [`TechniqueKind`] and never lets one technique's failure stop the
//! others.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::{Error, JobId};

/// The closed set of techniques, declared in canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TechniqueKind {
    StringEncryption,
    ControlFlow,
    Bogus,
    KeyFunctionVirtualization,
    Opaque,
    PreprocessorTrickery,
    AddressObfuscation,
}

impl TechniqueKind {
    /// Every kind, in canonical order.
    pub const ALL: [TechniqueKind; 7] = [
        TechniqueKind::StringEncryption,
        TechniqueKind::ControlFlow,
        TechniqueKind::Bogus,
        TechniqueKind::KeyFunctionVirtualization,
        TechniqueKind::Opaque,
        TechniqueKind::PreprocessorTrickery,
        TechniqueKind::AddressObfuscation,
    ];

    /// Stable kebab-case name used in records, logs and config.
    pub fn name(&self) -> &'static str {
        match self {
            TechniqueKind::StringEncryption => "string-encryption",
            TechniqueKind::ControlFlow => "control-flow",
            TechniqueKind::Bogus => "bogus",
            TechniqueKind::KeyFunctionVirtualization => "key-function-virtualization",
            TechniqueKind::Opaque => "opaque",
            TechniqueKind::PreprocessorTrickery => "preprocessor-trickery",
            TechniqueKind::AddressObfuscation => "address-obfuscation",
        }
    }

    /// Short command-line alias.
    pub fn alias(&self) -> &'static str {
        match self {
            TechniqueKind::StringEncryption => "s",
            TechniqueKind::ControlFlow => "c",
            TechniqueKind::Bogus => "b",
            TechniqueKind::KeyFunctionVirtualization => "k",
            TechniqueKind::Opaque => "op",
            TechniqueKind::PreprocessorTrickery => "p",
            TechniqueKind::AddressObfuscation => "ad",
        }
    }

    /// Stage label shown while this technique runs.
    pub fn stage_label(&self) -> &'static str {
        match self {
            TechniqueKind::StringEncryption => "Processing string encryption obfuscation...",
            TechniqueKind::ControlFlow => "Processing control flow obfuscation...",
            TechniqueKind::Bogus => "Processing bogus code injection...",
            TechniqueKind::KeyFunctionVirtualization => {
                "Processing key function virtualization..."
            }
            TechniqueKind::Opaque => "Processing opaque predicates...",
            TechniqueKind::PreprocessorTrickery => "Processing preprocessor trickery...",
            TechniqueKind::AddressObfuscation => "Processing address obfuscation...",
        }
    }
}

impl fmt::Display for TechniqueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TechniqueKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TechniqueKind::ALL
            .into_iter()
            .find(|k| k.name() == s || k.alias() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown technique: {}", s)))
    }
}

/// The techniques selected for a job.
///
/// Iteration always follows canonical order, not insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TechniqueSelection(BTreeSet<TechniqueKind>);

impl TechniqueSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select every technique.
    pub fn all() -> Self {
        TechniqueKind::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, kind: TechniqueKind) -> bool {
        self.0.insert(kind)
    }

    pub fn remove(&mut self, kind: TechniqueKind) -> bool {
        self.0.remove(&kind)
    }

    pub fn contains(&self, kind: TechniqueKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = TechniqueKind> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<TechniqueKind> for TechniqueSelection {
    fn from_iter<I: IntoIterator<Item = TechniqueKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// How aggressively techniques transform the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObfuscationLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl ObfuscationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObfuscationLevel::Low => "low",
            ObfuscationLevel::Medium => "medium",
            ObfuscationLevel::High => "high",
        }
    }

    /// Number of transformation passes for this level.
    pub fn passes(&self) -> u32 {
        match self {
            ObfuscationLevel::Low => 1,
            ObfuscationLevel::Medium => 2,
            ObfuscationLevel::High => 3,
        }
    }
}

impl FromStr for ObfuscationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ObfuscationLevel::Low),
            "medium" => Ok(ObfuscationLevel::Medium),
            "high" => Ok(ObfuscationLevel::High),
            _ => Err(Error::InvalidInput(format!(
                "unknown obfuscation level: {}",
                s
            ))),
        }
    }
}

/// Compression applied to the produced binary by the `upx` packer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpxLevel {
    Off,
    Low,
    Medium,
    #[default]
    High,
}

impl UpxLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpxLevel::Off => "off",
            UpxLevel::Low => "low",
            UpxLevel::Medium => "medium",
            UpxLevel::High => "high",
        }
    }

    /// Packer arguments, or `None` when packing is disabled.
    pub fn args(&self) -> Option<&'static [&'static str]> {
        match self {
            UpxLevel::Off => None,
            UpxLevel::Low => Some(&["--fast"]),
            UpxLevel::Medium => Some(&["--best", "--lzma"]),
            UpxLevel::High => Some(&["--best", "--ultra-brute", "--lzma"]),
        }
    }
}

impl FromStr for UpxLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(UpxLevel::Off),
            "low" => Ok(UpxLevel::Low),
            "medium" => Ok(UpxLevel::Medium),
            "high" => Ok(UpxLevel::High),
            _ => Err(Error::InvalidInput(format!("unknown upx level: {}", s))),
        }
    }
}

/// Tuning knobs handed to every technique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    pub obfuscation_level: ObfuscationLevel,
    pub upx_level: UpxLevel,
}

/// Outcome of one technique run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TechniqueResult {
    Completed {
        output_file: PathBuf,
        #[serde(default)]
        result: serde_json::Value,
    },
    Error {
        error: String,
    },
}

impl TechniqueResult {
    pub fn completed(output_file: impl Into<PathBuf>, result: serde_json::Value) -> Self {
        TechniqueResult::Completed {
            output_file: output_file.into(),
            result,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TechniqueResult::Error {
            error: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TechniqueResult::Completed { .. })
    }

    pub fn output_file(&self) -> Option<&Path> {
        match self {
            TechniqueResult::Completed { output_file, .. } => Some(output_file),
            TechniqueResult::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            TechniqueResult::Error { error } => Some(error),
            TechniqueResult::Completed { .. } => None,
        }
    }
}

/// Everything a technique may read about the job it runs for.
#[derive(Debug, Clone, Copy)]
pub struct TechniqueContext<'a> {
    pub job_id: &'a JobId,
    pub input_path: &'a Path,
    pub output_dir: &'a Path,
    pub tuning: &'a Tuning,
}

/// Receives human-readable progress lines from techniques.
pub trait LogSink: Send + Sync {
    fn log(&self, job_id: &JobId, message: &str);
}

/// Trait for technique implementations.
///
/// Implementations must not touch the job record; only the dispatcher
/// writes to the store.
#[async_trait]
pub trait Technique: Send + Sync {
    /// Which technique this implements.
    fn kind(&self) -> TechniqueKind;

    /// Run the technique against the job's input.
    async fn process(&self, ctx: TechniqueContext<'_>, log: &dyn LogSink) -> TechniqueResult;
}

/// Implementations available to the dispatcher, keyed by kind.
#[derive(Clone, Default)]
pub struct TechniqueRegistry {
    techniques: HashMap<TechniqueKind, Arc<dyn Technique>>,
}

impl TechniqueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation, replacing any previous one for its kind.
    pub fn register(&mut self, technique: Arc<dyn Technique>) {
        self.techniques.insert(technique.kind(), technique);
    }

    pub fn with(mut self, technique: Arc<dyn Technique>) -> Self {
        self.register(technique);
        self
    }

    pub fn get(&self, kind: TechniqueKind) -> Option<Arc<dyn Technique>> {
        self.techniques.get(&kind).cloned()
    }

    /// Registered kinds in canonical order.
    pub fn kinds(&self) -> Vec<TechniqueKind> {
        let mut kinds: Vec<_> = self.techniques.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.techniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }
}

impl fmt::Debug for TechniqueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TechniqueRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
