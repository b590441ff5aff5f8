//! Controller configuration parsing.

use crate::kdl_util::{
    get_bool_arg, get_first_string_arg, get_string_list_prop, get_string_prop, get_u32_arg,
    get_u64_arg, get_uint_prop, parse_env_block,
};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use kiln_core::node::{BUILT_IN_NODE, Node};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Controller-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Directory holding build records, fingerprints and default workspaces.
    pub root: PathBuf,
    /// Default quiet period for jobs that do not set one.
    pub quiet_period: Duration,
    /// Default checkout attempt budget for jobs that do not set one.
    pub scm_checkout_retry_count: u32,
    /// Pause between checkout attempts.
    pub checkout_retry_backoff: Duration,
    /// How often the queue re-evaluates blocked and waiting items on its own.
    pub maintenance_interval: Duration,
    /// Capacity of the in-memory change-log cache.
    pub changeset_cache: usize,
    /// Attribute upstream changes to downstream builds when computing culprits.
    pub upstream_culprits: bool,
    pub nodes: Vec<Node>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let root = PathBuf::from("/var/lib/kiln");
        Self {
            nodes: vec![Node::new(BUILT_IN_NODE, root.join("workspace")).with_executors(2)],
            root,
            quiet_period: Duration::from_secs(5),
            scm_checkout_retry_count: 0,
            checkout_retry_backoff: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(5),
            changeset_cache: 128,
            upstream_culprits: false,
        }
    }
}

/// Read and parse a controller configuration file.
pub fn load_system_config(path: &std::path::Path) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse controller configuration from KDL text.
///
/// Missing settings keep their defaults. Without any `node` entries the
/// controller gets a built-in node with two executors under `<root>/workspace`.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut nodes = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "controller" => parse_controller(node, &mut config)?,
            "node" => {
                let n = parse_node(node, &config.root)?;
                if nodes.iter().any(|existing: &Node| existing.name == n.name) {
                    return Err(ConfigError::Duplicate(format!("node '{}'", n.name)));
                }
                nodes.push(n);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.nodes = if nodes.is_empty() {
        vec![Node::new(BUILT_IN_NODE, config.root.join("workspace")).with_executors(2)]
    } else {
        nodes
    };

    Ok(config)
}

fn parse_controller(node: &KdlNode, config: &mut SystemConfig) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "root" => {
                config.root = get_first_string_arg(child)
                    .map(PathBuf::from)
                    .ok_or_else(|| ConfigError::MissingField("root".to_string()))?;
            }
            "quiet-period" => config.quiet_period = Duration::from_secs(get_u64_arg(child, field)?),
            "scm-checkout-retry-count" => {
                config.scm_checkout_retry_count = get_u32_arg(child, field)?;
            }
            "checkout-retry-backoff" => {
                config.checkout_retry_backoff = Duration::from_secs(get_u64_arg(child, field)?);
            }
            "maintenance-interval" => {
                let secs = get_u64_arg(child, field)?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: field.to_string(),
                        message: "must be at least 1 second".to_string(),
                    });
                }
                config.maintenance_interval = Duration::from_secs(secs);
            }
            "changeset-cache" => {
                config.changeset_cache = (get_u64_arg(child, field)? as usize).max(1);
            }
            "upstream-culprits" => config.upstream_culprits = get_bool_arg(child, field)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_node(node: &KdlNode, root: &std::path::Path) -> ConfigResult<Node> {
    let name = get_first_string_arg(node)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ConfigError::MissingField("node name".to_string()))?;

    let workspace = get_string_prop(node, "workspace")
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join("nodes").join(&name).join("workspace"));

    let executors = get_uint_prop(node, "executors")?.unwrap_or(1) as usize;

    let mut n = Node::new(name, workspace)
        .with_executors(executors)
        .with_labels(get_string_list_prop(node, "labels"));

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "env" {
                n.env.extend(parse_env_block(child));
            }
        }
    }

    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controller_config() {
        let kdl = r#"
            controller {
                root "/tmp/kiln"
                quiet-period 2
                scm-checkout-retry-count 1
                checkout-retry-backoff 3
                maintenance-interval 7
                changeset-cache 16
                upstream-culprits #true
            }
            node "built-in" executors=2 labels="linux docker" workspace="/tmp/kiln/ws" {
                env {
                    LANG "C.UTF-8"
                }
            }
            node "arm-1" labels="linux arm"
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/kiln"));
        assert_eq!(config.quiet_period, Duration::from_secs(2));
        assert_eq!(config.scm_checkout_retry_count, 1);
        assert_eq!(config.checkout_retry_backoff, Duration::from_secs(3));
        assert_eq!(config.maintenance_interval, Duration::from_secs(7));
        assert_eq!(config.changeset_cache, 16);
        assert!(config.upstream_culprits);

        assert_eq!(config.nodes.len(), 2);
        let built_in = &config.nodes[0];
        assert_eq!(built_in.num_executors, 2);
        assert!(built_in.has_label("docker"));
        assert_eq!(built_in.workspace_root, PathBuf::from("/tmp/kiln/ws"));
        assert_eq!(built_in.env.get("LANG").map(String::as_str), Some("C.UTF-8"));

        let arm = &config.nodes[1];
        assert_eq!(arm.num_executors, 1);
        assert_eq!(
            arm.workspace_root,
            PathBuf::from("/tmp/kiln/nodes/arm-1/workspace")
        );
    }

    #[test]
    fn test_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config.checkout_retry_backoff, Duration::from_secs(10));
        assert!(!config.upstream_culprits);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].name, BUILT_IN_NODE);
    }

    #[test]
    fn test_duplicate_node() {
        let result = parse_system_config("node \"a\"\nnode \"a\"");
        assert!(matches!(result, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_invalid_number() {
        let result = parse_system_config("controller { quiet-period \"soon\" }");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
