//! Fingerprint lookup command.

use anyhow::{Context, Result};
use kiln_config::SystemConfig;
use kiln_core::channel::RemoteChannel;
use kiln_executor::LocalChannel;
use kiln_storage::{FingerprintStore, FsPersistence};
use std::path::Path;
use std::sync::Arc;

fn is_md5(s: &str) -> bool {
    s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit())
}

pub async fn show(config: &SystemConfig, target: &str) -> Result<()> {
    let md5 = if is_md5(target) {
        target.to_ascii_lowercase()
    } else {
        let digest = LocalChannel::new("cli")
            .digest(Path::new(target))
            .await
            .with_context(|| format!("Failed to digest {}", target))?;
        digest.md5
    };

    let store = FingerprintStore::new(Arc::new(FsPersistence::new(config.root.clone())));
    let Some(fp) = store.load(&md5).await? else {
        println!("No record of {}", md5);
        return Ok(());
    };

    println!("{}  {}", fp.md5sum, fp.file_name);
    match &fp.original {
        Some(ptr) => println!("produced by: {}", ptr),
        None => println!("produced by: outside any build"),
    }
    println!("first seen: {}", fp.timestamp.format("%Y-%m-%d %H:%M:%S"));
    if fp.usages.is_empty() {
        println!("not used by any build");
    }
    for (job, builds) in &fp.usages {
        println!("  {}: {}", job, builds);
    }
    Ok(())
}
