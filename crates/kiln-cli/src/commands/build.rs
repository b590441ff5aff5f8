//! Local build command.

use anyhow::{Context, Result, bail};
use kiln_config::{SystemConfig, load_jobs};
use kiln_core::run::Cause;
use kiln_core::{BuildPtr, BuildResult, QueueId};
use kiln_scheduler::{BuildEvent, Controller, Task};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Build `jobs` from `file` on the configured nodes and print their logs.
pub async fn run(
    config: SystemConfig,
    file: &Path,
    jobs: &[String],
    params: Vec<(String, String)>,
    downstream: bool,
) -> Result<()> {
    let defs = load_jobs(file)
        .with_context(|| format!("Failed to load jobs: {}", file.display()))?;

    let controller = Controller::open(config);
    for mut def in defs {
        // Requested on the command line: no point waiting for more submissions.
        def.quiet_period = Some(Duration::ZERO);
        let name = def.name.clone();
        controller
            .add_job(def)
            .await
            .with_context(|| format!("Invalid job '{}'", name))?;
    }
    controller
        .connect_local_nodes()
        .context("Failed to connect local nodes")?;
    controller.start();

    let mut events = controller.subscribe();
    let user = std::env::var("USER").unwrap_or_else(|_| "cli".to_string());
    let mut pending = HashSet::new();
    for job in jobs {
        let mut task = Task::new(job.clone()).with_cause(Cause::User { id: user.clone() });
        for (key, value) in &params {
            task = task.with_parameter(key.clone(), value.clone());
        }
        let item = controller
            .submit(task)
            .with_context(|| format!("Failed to queue '{}'", job))?;
        if controller.queue().item(item.id).is_some_and(|v| v.stuck) {
            controller.shutdown().await;
            bail!("No connected node can build '{}'", job);
        }
        println!("Queued {} (item {})", job, item.id);
        pending.insert(item.id);
    }

    let mut seen = pending.clone();
    let mut failed = Vec::new();
    while !pending.is_empty() {
        let (build, queue_id, result) = match events.recv().await {
            Ok(BuildEvent::Completed {
                build,
                queue_id: Some(queue_id),
                result,
            }) if pending.contains(&queue_id) => (build, queue_id, result),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed build events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        pending.remove(&queue_id);

        print_log(&controller, &build).await?;
        println!("{} finished: {}\n", build, result);
        if result != BuildResult::Success {
            failed.push(build.clone());
        }

        if downstream {
            for id in downstream_items(&controller, &build, queue_id) {
                if seen.insert(id) {
                    pending.insert(id);
                }
            }
        }
    }

    controller.shutdown().await;

    if !failed.is_empty() {
        let names: Vec<String> = failed.iter().map(ToString::to_string).collect();
        bail!("Builds did not succeed: {}", names.join(", "));
    }
    Ok(())
}

/// Queue items of `build`'s downstream jobs created after `after`.
fn downstream_items(controller: &Arc<Controller>, build: &BuildPtr, after: QueueId) -> Vec<QueueId> {
    let names: Vec<String> = controller
        .jobs()
        .downstream_projects(&build.job)
        .iter()
        .map(|j| j.name.clone())
        .collect();
    let queued = controller.queue().items().into_iter().map(|v| (v.id, v.job));
    let left = controller.queue().left().into_iter().map(|l| (l.id, l.job));
    queued
        .chain(left)
        .filter(|(id, job)| *id > after && names.contains(job))
        .map(|(id, _)| id)
        .collect()
}

async fn print_log(controller: &Controller, build: &BuildPtr) -> Result<()> {
    let log = controller
        .history()
        .runs()
        .load_log(&build.job, build.number)
        .await
        .with_context(|| format!("Failed to read log of {}", build))?;
    println!("--- {} ---", build);
    if let Some(log) = log {
        print!("{}", log);
    }
    Ok(())
}
