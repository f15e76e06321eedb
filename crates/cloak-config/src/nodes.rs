// Helper functions for extracting values from KDL nodes

use crate::{ConfigError, ConfigResult};
use cloak_core::TechniqueKind;
use kdl::KdlNode;
use std::str::FromStr;

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// First positional argument as seconds; accepts integers and floats.
pub(crate) fn get_first_number_arg(node: &KdlNode) -> Option<f64> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| {
            let value = e.value();
            value
                .as_float()
                .or_else(|| value.as_integer().map(|i| i as f64))
        })
}

pub(crate) fn require_string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

pub(crate) fn parse_value<T>(node: &KdlNode, field: &str) -> ConfigResult<T>
where
    T: FromStr<Err = cloak_core::Error>,
{
    let raw = require_string_arg(node, field)?;
    raw.parse().map_err(|e: cloak_core::Error| ConfigError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn parse_technique_name(name: &str) -> ConfigResult<TechniqueKind> {
    name.parse()
        .map_err(|_| ConfigError::InvalidReference(format!("unknown technique '{}'", name)))
}
