//! Build record commands.

use anyhow::{Context, Result, bail};
use kiln_config::SystemConfig;
use kiln_core::persistence::Persistence;
use kiln_storage::{FsPersistence, RunStore};
use std::sync::Arc;

pub async fn list(config: &SystemConfig, job: &str, limit: usize, log: Option<u32>) -> Result<()> {
    let persistence: Arc<dyn Persistence> = Arc::new(FsPersistence::new(config.root.clone()));
    let runs = RunStore::new(persistence);
    runs.load_job(job)
        .await
        .with_context(|| format!("Failed to load records of '{}'", job))?;

    if let Some(number) = log {
        match runs.load_log(job, number).await? {
            Some(text) => print!("{}", text),
            None => bail!("No log for {} #{}", job, number),
        }
        return Ok(());
    }

    let records = runs.runs(job);
    if records.is_empty() {
        println!("No builds of {}", job);
        return Ok(());
    }
    for run in records.into_iter().take(limit) {
        let result = run
            .result()
            .map(|r| r.to_string())
            .unwrap_or_else(|| run.phase.to_string());
        let duration = run
            .duration_ms
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!(
            "#{:<5} {:<10} {:>8}  {}  {}",
            run.number,
            result,
            duration,
            run.timestamp.format("%Y-%m-%d %H:%M:%S"),
            run.built_on.as_deref().unwrap_or("-")
        );
    }
    if let Some(n) = runs.last_successful(job) {
        println!("last successful: #{}", n);
    }
    if let Some(n) = runs.last_stable(job) {
        println!("last stable: #{}", n);
    }
    Ok(())
}
