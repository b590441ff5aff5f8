// Helper functions for extracting values from KDL nodes

use crate::{ConfigError, ConfigResult};
use kdl::KdlNode;
use std::collections::BTreeMap;

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

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Space-separated list in a single property, or repeated properties.
pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.extend(s.split_whitespace().map(str::to_string));
                }
            }
        }
    }

    result
}

/// Non-negative integer property. Error if present with the wrong type.
pub(crate) fn get_uint_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_integer()
            .and_then(|n| u64::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: format!("expected a non-negative integer, got {}", v),
            }),
    }
}

fn first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn get_u64_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_integer()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a non-negative integer, got {}", value),
        })
}

pub(crate) fn get_u32_arg(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let n = get_u64_arg(node, field)?;
    u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is out of range", n),
    })
}

pub(crate) fn get_bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value.as_bool().ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("expected #true or #false, got {}", value),
    })
}

/// `env { KEY "value" ... }`
pub(crate) fn parse_env_block(node: &KdlNode) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
    env
}
