//! Locating external tools on `PATH`.

use cloak_config::SystemConfig;
use cloak_core::{TechniqueKind, TechniqueSelection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Find an executable by name on the current `PATH`.
///
/// Names containing a path separator are checked as given.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    find_tool_in(name, &path_var)
}

pub(crate) fn find_tool_in(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return is_executable(direct).then(|| direct.to_path_buf());
    }

    std::env::split_paths(path_var)
        .flat_map(|dir| candidates(&dir, name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".EXE;.CMD;.BAT;.COM".to_string());
    let mut out = vec![dir.join(name)];
    out.extend(
        exts.split(';')
            .filter(|ext| !ext.is_empty())
            .map(|ext| dir.join(format!("{name}{ext}"))),
    );
    out
}

#[cfg(not(windows))]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name)]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Availability of one technique's required tools.
#[derive(Debug, Clone, Serialize)]
pub struct TechniqueTools {
    /// Tool name to resolved path, `None` when missing.
    pub tools: BTreeMap<String, Option<PathBuf>>,
    pub available: bool,
}

/// Tool availability across every configured technique.
#[derive(Debug, Clone, Serialize)]
pub struct ToolReport {
    pub techniques: BTreeMap<TechniqueKind, TechniqueTools>,
    /// Whether upx is present for packing.
    pub upx: Option<PathBuf>,
    pub all_available: bool,
}

pub fn check_tools(config: &SystemConfig) -> ToolReport {
    let techniques: BTreeMap<_, _> = config
        .techniques
        .iter()
        .map(|definition| {
            let tools: BTreeMap<_, _> = definition
                .requires
                .iter()
                .map(|tool| (tool.clone(), find_tool(tool)))
                .collect();
            let available = tools.values().all(Option::is_some);
            (definition.kind, TechniqueTools { tools, available })
        })
        .collect();

    let all_available = techniques.values().all(|t| t.available);
    ToolReport {
        techniques,
        upx: find_tool("upx"),
        all_available,
    }
}

/// Required tools that are missing for the selected techniques.
pub fn missing_tools(
    config: &SystemConfig,
    selection: &TechniqueSelection,
) -> Vec<(TechniqueKind, String)> {
    selection
        .iter()
        .filter_map(|kind| config.technique(kind))
        .flat_map(|definition| {
            definition
                .requires
                .iter()
                .filter(|tool| find_tool(tool).is_none())
                .map(|tool| (definition.kind, tool.clone()))
        })
        .collect()
}
