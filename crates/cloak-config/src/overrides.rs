//! Per-submission override files.
//!
//! ```kdl
//! enable "bogus" "opaque"
//! disable "string-encryption"
//! obf-level "high"
//! upx-level "off"
//! ```

use crate::nodes::{get_all_string_args, parse_technique_name, parse_value};
use crate::ConfigResult;
use cloak_core::{ObfuscationLevel, TechniqueKind, TechniqueSelection, Tuning, UpxLevel};
use kdl::KdlDocument;
use std::path::Path;

/// Selection and tuning changes layered over command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOverrides {
    pub enable: Vec<TechniqueKind>,
    pub disable: Vec<TechniqueKind>,
    pub obfuscation_level: Option<ObfuscationLevel>,
    pub upx_level: Option<UpxLevel>,
}

impl SubmitOverrides {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        parse_overrides(&content)
    }

    /// Apply on top of an existing selection; `disable` wins over `enable`.
    pub fn apply(&self, selection: &mut TechniqueSelection, tuning: &mut Tuning) {
        for kind in &self.enable {
            selection.insert(*kind);
        }
        for kind in &self.disable {
            selection.remove(*kind);
        }
        if let Some(level) = self.obfuscation_level {
            tuning.obfuscation_level = level;
        }
        if let Some(level) = self.upx_level {
            tuning.upx_level = level;
        }
    }
}

/// Parse an override file from KDL text.
pub fn parse_overrides(kdl: &str) -> ConfigResult<SubmitOverrides> {
    let doc: KdlDocument = kdl.parse()?;
    let mut overrides = SubmitOverrides::default();

    for node in doc.nodes() {
        match node.name().value() {
            "enable" => {
                for name in get_all_string_args(node) {
                    overrides.enable.push(parse_technique_name(&name)?);
                }
            }
            "disable" => {
                for name in get_all_string_args(node) {
                    overrides.disable.push(parse_technique_name(&name)?);
                }
            }
            "obf-level" => overrides.obfuscation_level = Some(parse_value(node, "obf-level")?),
            "upx-level" => overrides.upx_level = Some(parse_value(node, "upx-level")?),
            _ => {}
        }
    }

    Ok(overrides)
}
