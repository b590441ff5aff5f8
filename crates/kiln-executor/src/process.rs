//! Running a process through a channel on behalf of a build.

use futures::StreamExt;
use kiln_core::channel::{LogStream, ProcExit, ProcSpec, RemoteChannel};
use kiln_core::console::Console;
use kiln_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Output captured by [`run_captured`].
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub exit: Option<ProcExit>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Spawn `spec`, copy its output into the console and wait for it.
///
/// If `cancel` fires first the process is terminated and
/// `Error::Interrupted` is returned once it has exited.
pub async fn run_logged(
    channel: &dyn RemoteChannel,
    spec: ProcSpec,
    console: &Console,
    cancel: &CancellationToken,
) -> Result<ProcExit> {
    let handle = channel.spawn(spec).await?;
    let mut output = channel.output(&handle).await?;

    let console = console.clone();
    let pump = tokio::spawn(async move {
        while let Some(line) = output.next().await {
            console.println(line.content);
        }
    });

    let result = tokio::select! {
        exit = channel.wait(&handle) => exit,
        _ = cancel.cancelled() => {
            info!(proc = %handle.id.short(), "Build aborted, terminating process");
            channel.terminate(&handle).await?;
            let _ = channel.wait(&handle).await;
            Err(Error::Interrupted)
        }
    };

    let _ = pump.await;
    debug!(proc = %handle.id.short(), ok = result.is_ok(), "Process finished");
    result
}

/// Spawn `spec` and collect its output instead of logging it.
pub async fn run_captured(
    channel: &dyn RemoteChannel,
    spec: ProcSpec,
    cancel: &CancellationToken,
) -> Result<Captured> {
    let handle = channel.spawn(spec).await?;
    let output = channel.output(&handle).await?;
    let collect = tokio::spawn(output.collect::<Vec<_>>());

    let exit = tokio::select! {
        exit = channel.wait(&handle) => exit?,
        _ = cancel.cancelled() => {
            channel.terminate(&handle).await?;
            let _ = channel.wait(&handle).await;
            return Err(Error::Interrupted);
        }
    };

    let lines = collect
        .await
        .map_err(|e| Error::Internal(format!("output collector failed: {}", e)))?;
    let mut captured = Captured {
        exit: Some(exit),
        ..Default::default()
    };
    for line in lines {
        match line.stream {
            LogStream::Stderr => captured.stderr.push(line.content),
            _ => captured.stdout.push(line.content),
        }
    }
    Ok(captured)
}
