//! Git checkout through the node's `git` binary.

use async_trait::async_trait;
use kiln_core::changelog::{ChangeEntry, ChangeLogSet};
use kiln_core::channel::ProcSpec;
use kiln_core::env::EnvVars;
use kiln_core::step::{Checkout, CheckoutContext, Scm};
use kiln_core::{Error, Result};
use tracing::{debug, info};

use crate::process::{run_captured, run_logged};

const FIELD_SEP: char = '\u{1f}';

/// Single-quote `s` for `/bin/sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Clones on first use, then fetches and force-checks-out the branch head.
#[derive(Debug, Clone)]
pub struct GitScm {
    url: String,
    branch: Option<String>,
}

impl GitScm {
    pub fn new(url: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            url: url.into(),
            branch,
        }
    }

    fn checkout_script(&self) -> String {
        let url = shell_quote(&self.url);
        let (branch_arg, target) = match &self.branch {
            Some(b) => (format!("-b {} ", shell_quote(b)), shell_quote(&format!("origin/{}", b))),
            None => (String::new(), "origin/HEAD".to_string()),
        };
        format!(
            "if [ -d .git ]; then \
                git remote set-url origin {url} && \
                git fetch --quiet --prune origin && \
                git checkout --quiet -f {target}; \
             else \
                git clone --quiet {branch_arg}{url} .; \
             fi"
        )
    }

    fn env(ctx: &CheckoutContext<'_>) -> std::collections::BTreeMap<String, String> {
        let mut env = ctx.env.as_map().clone();
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        env
    }
}

/// Parse `git log --format=%H%x1f%ae%x1f%s` output.
pub fn parse_log(lines: &[String]) -> ChangeLogSet {
    let entries = lines
        .iter()
        .filter_map(|line| {
            let mut parts = line.splitn(3, FIELD_SEP);
            let commit_id = parts.next()?.trim();
            let author = parts.next()?.trim();
            let message = parts.next().unwrap_or_default().trim();
            (!commit_id.is_empty()).then(|| ChangeEntry {
                commit_id: commit_id.to_string(),
                author: author.to_string(),
                message: message.to_string(),
                affected_paths: Vec::new(),
            })
        })
        .collect();
    ChangeLogSet { entries }
}

#[async_trait]
impl Scm for GitScm {
    fn name(&self) -> &str {
        "git"
    }

    async fn checkout(&self, ctx: &CheckoutContext<'_>) -> Result<Checkout> {
        ctx.channel.mkdirs(ctx.workspace).await?;

        info!(url = %self.url, workspace = %ctx.workspace.display(), "Checking out");
        let spec = ProcSpec::shell(self.checkout_script(), ctx.workspace).with_env(Self::env(ctx));
        let exit = run_logged(ctx.channel, spec, ctx.console, ctx.cancel).await?;
        if !exit.success() {
            return Err(Error::ExecutionFailed(format!(
                "git checkout of {} exited with {:?}",
                self.url, exit.code
            )));
        }

        let rev = run_captured(
            ctx.channel,
            ProcSpec::shell("git rev-parse HEAD", ctx.workspace).with_env(Self::env(ctx)),
            ctx.cancel,
        )
        .await?;
        let revision = rev
            .stdout
            .first()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::ExecutionFailed("git rev-parse printed nothing".to_string()))?;

        let changes = match ctx.previous_revision {
            Some(prev) if prev != revision => {
                let script = format!(
                    "git log --no-merges --format=%H%x1f%ae%x1f%s {}..HEAD",
                    shell_quote(prev)
                );
                let log = run_captured(
                    ctx.channel,
                    ProcSpec::shell(script, ctx.workspace).with_env(Self::env(ctx)),
                    ctx.cancel,
                )
                .await?;
                if log.exit.is_some_and(|e| e.success()) {
                    parse_log(&log.stdout)
                } else {
                    // previous revision no longer reachable
                    ctx.console
                        .println(format!("Could not compute changes since {}", prev));
                    ChangeLogSet::empty()
                }
            }
            _ => ChangeLogSet::empty(),
        };

        debug!(revision = %revision, changes = changes.entries.len(), "Checkout complete");
        Ok(Checkout {
            revision: Some(revision),
            changes,
        })
    }

    fn build_env(&self, env: &mut EnvVars) {
        env.put("GIT_URL", self.url.clone());
        if let Some(branch) = &self.branch {
            env.put("GIT_BRANCH", branch.clone());
        }
    }
}
