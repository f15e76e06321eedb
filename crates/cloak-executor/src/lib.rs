//! Technique implementations backed by external toolchains.
//!
//! Provides:
//! - `CommandTechnique`, which runs the command templates from a
//!   `TechniqueDefinition` and optionally packs the result with upx
//! - Tool discovery on `PATH` for `check-tools` and submit-time checks
//! - Registry construction from the system configuration

pub mod command;
pub mod error;
pub mod process;
pub mod tools;

pub use command::CommandTechnique;
pub use error::{ExecutorError, ExecutorResult};
pub use process::{OutputLine, OutputStream, StepOutput, run_step};
pub use tools::{TechniqueTools, ToolReport, check_tools, find_tool, missing_tools};

use cloak_config::SystemConfig;
use cloak_core::TechniqueRegistry;
use std::sync::Arc;

/// Build a registry with one `CommandTechnique` per configured definition.
pub fn registry_from_config(config: &SystemConfig) -> TechniqueRegistry {
    config
        .techniques
        .iter()
        .fold(TechniqueRegistry::new(), |registry, definition| {
            registry.with(Arc::new(CommandTechnique::new(definition.clone())))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_core::TechniqueKind;

    #[test]
    fn test_registry_covers_builtin_techniques() {
        let config = SystemConfig::builtin().unwrap();
        let registry = registry_from_config(&config);
        assert_eq!(registry.kinds(), TechniqueKind::ALL.to_vec());
    }
}
