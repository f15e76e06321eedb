//! KDL configuration parsing for cloak.
//!
//! This crate handles parsing of:
//! - System configuration (cloak.kdl): paths, polling, technique definitions
//! - Per-submission override files
//! - Variable interpolation in technique command templates

pub mod error;
mod nodes;
pub mod overrides;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use overrides::{SubmitOverrides, parse_overrides};
pub use system::{DEFAULT_CONFIG, SystemConfig, TechniqueDefinition, parse_system_config};
pub use variables::{
    JobContext, PathContext, TuningContext, VariableContext, VariableContextBuilder,
};
