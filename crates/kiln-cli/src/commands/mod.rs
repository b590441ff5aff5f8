//! CLI command implementations.

pub mod build;
pub mod fingerprint;
pub mod runs;

use anyhow::{Context, Result, bail};
use kiln_config::{SystemConfig, load_jobs, load_system_config};
use kiln_core::node::{BUILT_IN_NODE, Node};
use std::path::{Path, PathBuf};

const LOCAL_ROOT: &str = ".kiln";

/// Controller configuration for a CLI invocation.
///
/// Without a configuration file, records and workspaces live under `./.kiln`
/// and builds run on a two-executor built-in node.
pub fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<SystemConfig> {
    let mut config = match path {
        Some(path) => load_system_config(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display()))?,
        None => {
            let root = PathBuf::from(LOCAL_ROOT);
            SystemConfig {
                nodes: vec![Node::new(BUILT_IN_NODE, root.join("workspace")).with_executors(2)],
                root,
                ..SystemConfig::default()
            }
        }
    };
    if let Some(root) = root {
        config.root = root;
    }
    Ok(config)
}

/// Parse `KEY=VALUE`.
pub fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

pub fn validate(path: &Path) -> Result<()> {
    match load_jobs(path) {
        Ok(jobs) => {
            println!("Configuration is valid ({} jobs)", jobs.len());
            for job in &jobs {
                let steps = job.prebuild.len() + job.builders.len() + job.publishers.len();
                println!("  {} - {} steps", job.name, steps);
            }
            Ok(())
        }
        Err(e) => bail!("Configuration error in {}: {}", path.display(), e),
    }
}
