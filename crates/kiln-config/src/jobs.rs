//! Job definition parsing.

use crate::kdl_util::{
    get_all_string_args, get_bool_arg, get_first_string_arg, get_string_list_prop,
    get_string_prop, get_u32_arg, get_u64_arg, get_uint_prop, parse_env_block,
};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use kiln_core::job::{DiscardPolicy, JobDef, ScmSpec, StepSpec};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Parse every `job` node in a KDL document.
///
/// Downstream references must name jobs in the same document and must not
/// form a cycle.
pub fn parse_jobs(kdl: &str) -> ConfigResult<Vec<JobDef>> {
    let doc: KdlDocument = kdl.parse()?;

    let mut jobs: Vec<JobDef> = Vec::new();
    for node in doc.nodes() {
        if node.name().value() == "job" {
            let job = parse_job(node)?;
            if jobs.iter().any(|j| j.name == job.name) {
                return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
            }
            jobs.push(job);
        }
    }

    let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
    for job in &jobs {
        for down in &job.downstream {
            if !names.contains(&down.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' triggers unknown job '{}'",
                    job.name, down
                )));
            }
        }
    }

    if let Err(cycle) = detect_cycle(&jobs) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(jobs)
}

/// Read and parse a job file.
pub fn load_jobs(path: &Path) -> ConfigResult<Vec<JobDef>> {
    let text = std::fs::read_to_string(path)?;
    parse_jobs(&text)
}

/// Parse a single job document. Convenience for one-job files.
pub fn parse_job_document(kdl: &str) -> ConfigResult<JobDef> {
    let mut jobs = parse_jobs(kdl)?;
    match jobs.len() {
        1 => Ok(jobs.remove(0)),
        0 => Err(ConfigError::MissingField("job".to_string())),
        n => Err(ConfigError::InvalidValue {
            field: "job".to_string(),
            message: format!("expected one job, found {}", n),
        }),
    }
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobDef> {
    let name = get_first_string_arg(node)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;
    if name.contains('/') {
        return Err(ConfigError::InvalidValue {
            field: "job name".to_string(),
            message: format!("'{}' must not contain '/'", name),
        });
    }

    let mut job = JobDef::new(name);

    let Some(children) = node.children() else {
        return Ok(job);
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "label" => job.label = get_first_string_arg(child),
            "quiet-period" => {
                job.quiet_period = Some(Duration::from_secs(get_u64_arg(child, field)?));
            }
            "concurrent" => job.concurrent = get_bool_arg(child, field)?,
            "max-concurrent" => {
                let n = get_u64_arg(child, field)?;
                if n == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: field.to_string(),
                        message: "must be at least 1".to_string(),
                    });
                }
                job.max_concurrent_builds = Some(n as usize);
            }
            "checkout-retry" => job.scm_checkout_retry_count = Some(get_u32_arg(child, field)?),
            "custom-workspace" => job.custom_workspace = get_first_string_arg(child),
            "block-on-upstream" => job.block_on_upstream = get_bool_arg(child, field)?,
            "keep-dependencies" => job.keep_dependencies = get_bool_arg(child, field)?,
            "discard" => {
                job.discard = Some(DiscardPolicy {
                    num_to_keep: get_uint_prop(child, "num-to-keep")?.map(|n| n as usize),
                    days_to_keep: get_uint_prop(child, "days-to-keep")?.map(|n| n as u32),
                });
            }
            "scm" => job.scm = parse_scm(child)?,
            "env" => job.env.extend(parse_env_block(child)),
            "downstream" => {
                job.downstream.extend(get_all_string_args(child));
                job.downstream.extend(get_string_list_prop(child, "jobs"));
            }
            "prebuild" => job.prebuild = parse_steps(child)?,
            "build" => job.builders = parse_steps(child)?,
            "publish" => job.publishers = parse_steps(child)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if !job.concurrent && job.max_concurrent_builds.is_some_and(|n| n > 1) {
        return Err(ConfigError::InvalidValue {
            field: "max-concurrent".to_string(),
            message: format!("job '{}' is not concurrent", job.name),
        });
    }

    job.label_expr().map_err(|e| ConfigError::InvalidValue {
        field: "label".to_string(),
        message: e.to_string(),
    })?;

    Ok(job)
}

fn parse_scm(node: &KdlNode) -> ConfigResult<ScmSpec> {
    let kind = get_first_string_arg(node).unwrap_or_default();

    match kind.as_str() {
        "git" => {
            let url = get_string_prop(node, "url")
                .ok_or_else(|| ConfigError::MissingField("scm url".to_string()))?;
            Ok(ScmSpec::Git {
                url,
                branch: get_string_prop(node, "branch"),
            })
        }
        "none" | "" => Ok(ScmSpec::None),
        _ => Err(ConfigError::InvalidValue {
            field: "scm type".to_string(),
            message: format!("unknown scm type: {}", kind),
        }),
    }
}

fn parse_steps(node: &KdlNode) -> ConfigResult<Vec<StepSpec>> {
    let mut steps = Vec::new();

    let Some(children) = node.children() else {
        return Ok(steps);
    };

    for child in children.nodes() {
        let step = match child.name().value() {
            "shell" => {
                let command = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("shell command".to_string()))?;
                let unstable_return = match child.get("unstable-return") {
                    Some(v) => Some(
                        v.as_integer()
                            .and_then(|n| i32::try_from(n).ok())
                            .ok_or_else(|| ConfigError::InvalidValue {
                                field: "unstable-return".to_string(),
                                message: format!("expected an exit code, got {}", v),
                            })?,
                    ),
                    None => None,
                };
                StepSpec::Shell {
                    command,
                    unstable_return,
                }
            }
            "fingerprint" => {
                let targets = get_all_string_args(child);
                if targets.is_empty() {
                    return Err(ConfigError::MissingField("fingerprint targets".to_string()));
                }
                StepSpec::Fingerprint { targets }
            }
            "require-env" => StepSpec::RequireEnv {
                name: get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("require-env name".to_string()))?,
            },
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "step".to_string(),
                    message: format!("unknown step: {}", other),
                });
            }
        };
        steps.push(step);
    }

    Ok(steps)
}

/// Detect cycles in the downstream trigger graph using DFS.
fn detect_cycle(jobs: &[JobDef]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let job_map: HashMap<&str, &JobDef> = jobs.iter().map(|j| (j.name.as_str(), j)).collect();

    for job in jobs {
        if !visited.contains_key(job.name.as_str()) {
            if let Some(cycle) = dfs_detect_cycle(&job.name, &job_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    job_map: &'a HashMap<&'a str, &'a JobDef>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(job) = job_map.get(node) {
        for down in &job.downstream {
            let down_str: &'a str = down.as_str();
            if !visited.contains_key(down_str) {
                if let Some(cycle) = dfs_detect_cycle(down_str, job_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(down_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, down));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
