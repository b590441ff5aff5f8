//! Channel to the node the controller runs on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use kiln_core::channel::{FileDigest, LogLine, LogStream, ProcExit, ProcHandle, ProcSpec, RemoteChannel};
use kiln_core::{Error, ResourceId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// How long output may trail a killed process before the pipes are abandoned.
const KILL_DRAIN: Duration = Duration::from_secs(2);

struct LocalProc {
    output: Option<mpsc::UnboundedReceiver<LogLine>>,
    exit: watch::Receiver<Option<ProcExit>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Runs processes on the local machine with `tokio::process`.
pub struct LocalChannel {
    node: String,
    online: AtomicBool,
    procs: Mutex<HashMap<ResourceId, LocalProc>>,
}

impl LocalChannel {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            online: AtomicBool::new(true),
            procs: Mutex::new(HashMap::new()),
        }
    }

    /// Mark the channel online or offline. Spawning on an offline channel fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of processes that have not been waited for.
    pub fn tracked(&self) -> usize {
        self.procs.lock().len()
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::Channel(format!("node '{}' is offline", self.node)))
        }
    }
}

fn pump<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<LogLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(content)) => {
                    let _ = tx.send(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Output read error");
                    break;
                }
            }
        }
    })
}

/// Kill the process and everything it started.
///
/// Children are spawned as process group leaders, so the group id is the pid.
#[cfg(unix)]
fn kill_tree(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            debug!(pgid, error = %e, "Process group kill failed");
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill failed");
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Kill failed");
    }
}

/// Wait for the output pumps to reach end of stream.
///
/// After a kill, anything that escaped the process group may still hold the
/// pipes open; those pumps are given [`KILL_DRAIN`] and then aborted.
async fn drain(mut pumps: Vec<JoinHandle<()>>, killed: bool, id: ResourceId) {
    if !killed {
        for p in pumps {
            let _ = p.await;
        }
        return;
    }
    let all = futures::future::join_all(pumps.iter_mut());
    if tokio::time::timeout(KILL_DRAIN, all).await.is_err() {
        warn!(proc = %id.short(), "Output still open after kill, dropping it");
        for p in &pumps {
            p.abort();
        }
    }
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    fn node_name(&self) -> &str {
        &self.node
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn spawn(&self, spec: ProcSpec) -> Result<ProcHandle> {
        self.check_online()?;
        let Some((program, args)) = spec.command.split_first() else {
            return Err(Error::InvalidInput("empty command".to_string()));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to start {}: {}", program, e)))?;

        let pid = child.id();
        info!(node = %self.node, proc = %spec.id.short(), pid, "Process started");

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, LogStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, LogStream::Stderr, line_tx));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let id = spec.id;

        tokio::spawn(async move {
            let (status, killed) = tokio::select! {
                status = child.wait() => (status, false),
                Ok(()) = &mut kill_rx => {
                    debug!(proc = %id.short(), "Killing process tree");
                    kill_tree(&mut child, pid);
                    (child.wait().await, true)
                }
            };
            // Deliver all output before reporting the exit.
            drain(pumps, killed, id).await;
            let exit = match status {
                Ok(s) => ProcExit { code: s.code() },
                Err(e) => {
                    warn!(proc = %id.short(), error = %e, "Wait failed");
                    ProcExit { code: None }
                }
            };
            let _ = exit_tx.send(Some(exit));
        });

        self.procs.lock().insert(
            spec.id,
            LocalProc {
                output: Some(line_rx),
                exit: exit_rx,
                kill: Some(kill_tx),
            },
        );

        Ok(ProcHandle {
            id: spec.id,
            native_id: pid,
            node: self.node.clone(),
        })
    }

    async fn output(&self, handle: &ProcHandle) -> Result<BoxStream<'static, LogLine>> {
        let rx = self
            .procs
            .lock()
            .get_mut(&handle.id)
            .and_then(|p| p.output.take())
            .ok_or_else(|| Error::NotFound(format!("output of process {}", handle.id.short())))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn wait(&self, handle: &ProcHandle) -> Result<ProcExit> {
        let mut exit = self
            .procs
            .lock()
            .get(&handle.id)
            .map(|p| p.exit.clone())
            .ok_or_else(|| Error::NotFound(format!("process {}", handle.id.short())))?;

        let result = exit
            .wait_for(Option::is_some)
            .await
            .map(|e| *e)
            .map_err(|_| Error::Channel("process monitor went away".to_string()))?;

        self.procs.lock().remove(&handle.id);
        result.ok_or_else(|| Error::Internal("missing exit status".to_string()))
    }

    async fn terminate(&self, handle: &ProcHandle) -> Result<()> {
        let kill = self
            .procs
            .lock()
            .get_mut(&handle.id)
            .and_then(|p| p.kill.take());
        if let Some(kill) = kill {
            info!(node = %self.node, proc = %handle.id.short(), "Terminating process");
            let _ = kill.send(());
        }
        Ok(())
    }

    async fn digest(&self, path: &Path) -> Result<FileDigest> {
        let mut file = tokio::fs::File::open(path).await?;
        let meta = file.metadata().await?;

        let mut ctx = md5::Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
        }

        let modified: DateTime<Utc> = meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now());
        Ok(FileDigest {
            md5: format!("{:x}", ctx.compute()),
            size: meta.len(),
            modified,
        })
    }

    async fn mkdirs(&self, path: &Path) -> Result<()> {
        self.check_online()?;
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_process_and_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new("local");
        let spec = ProcSpec::shell("echo out; echo err >&2; exit 3", dir.path())
            .with_env([("GREETING".to_string(), "hi".to_string())].into());

        let handle = channel.spawn(spec).await.unwrap();
        let output = channel.output(&handle).await.unwrap();
        let exit = channel.wait(&handle).await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());

        let lines: Vec<LogLine> = output.collect().await;
        assert!(lines.iter().any(|l| l.stream == LogStream::Stdout && l.content == "out"));
        assert!(lines.iter().any(|l| l.stream == LogStream::Stderr && l.content == "err"));
        assert_eq!(channel.tracked(), 0);
    }

    #[tokio::test]
    async fn test_environment_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new("local");
        let spec = ProcSpec::shell("echo \"$GREETING\" > greeting.txt", dir.path())
            .with_env([("GREETING".to_string(), "hi".to_string())].into());

        let handle = channel.spawn(spec).await.unwrap();
        assert!(channel.wait(&handle).await.unwrap().success());
        let text = std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap();
        assert_eq!(text.trim(), "hi");
    }

    #[tokio::test]
    async fn test_terminate_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new("local");
        let handle = channel
            .spawn(ProcSpec::shell("sleep 30", dir.path()))
            .await
            .unwrap();

        channel.terminate(&handle).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), channel.wait(&handle))
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_terminate_kills_children_of_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new("local");
        let handle = channel
            .spawn(ProcSpec::shell("sleep 20; echo done", dir.path()))
            .await
            .unwrap();
        let output = channel.output(&handle).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        channel.terminate(&handle).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), channel.wait(&handle))
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.success());

        let lines: Vec<LogLine> = tokio::time::timeout(Duration::from_secs(5), output.collect())
            .await
            .unwrap();
        assert!(lines.iter().all(|l| l.content != "done"));
    }

    #[tokio::test]
    async fn test_offline_channel_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let channel = LocalChannel::new("local");
        channel.set_online(false);
        let err = channel
            .spawn(ProcSpec::shell("true", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }

    #[tokio::test]
    async fn test_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let channel = LocalChannel::new("local");
        let digest = channel.digest(&path).await.unwrap();
        assert_eq!(digest.md5, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(digest.size, 5);
    }
}
