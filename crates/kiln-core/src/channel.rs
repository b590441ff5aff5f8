//! Remote execution channel.
//!
//! A channel is the controller's handle on a node: it starts processes there,
//! streams their output back and can be asked to stop them. The transport
//! behind it (local process, agent connection, container) is up to the
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{ResourceId, Result};

/// Specification for a process to launch on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcSpec {
    /// Unique identifier for this process.
    pub id: ResourceId,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Working directory on the node.
    pub working_dir: PathBuf,
    /// Complete environment of the process.
    pub env: BTreeMap<String, String>,
}

impl ProcSpec {
    /// `sh -c <script>` in `working_dir`.
    pub fn shell(script: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: ResourceId::new(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.into()],
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Handle to a running or completed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcHandle {
    /// The process ID assigned by the controller.
    pub id: ResourceId,
    /// Node-specific identifier (e.g., OS pid).
    pub native_id: Option<u32>,
    /// Name of the node running this process.
    pub node: String,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcExit {
    /// None if the process was killed by a signal.
    pub code: Option<i32>,
}

impl ProcExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A line of process output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Checksum and metadata of a file on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    /// Lower-case hex md5.
    pub md5: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Connection to a node capable of running processes.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Name of the node behind this channel.
    fn node_name(&self) -> &str;

    /// False once the connection is lost.
    fn is_online(&self) -> bool;

    /// Start a process.
    async fn spawn(&self, spec: ProcSpec) -> Result<ProcHandle>;

    /// Output of a process. Can be taken once per process.
    async fn output(&self, handle: &ProcHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Wait for a process to exit.
    async fn wait(&self, handle: &ProcHandle) -> Result<ProcExit>;

    /// Ask a running process to stop. No-op if it already exited.
    async fn terminate(&self, handle: &ProcHandle) -> Result<()>;

    /// md5 of a file on the node.
    async fn digest(&self, path: &Path) -> Result<FileDigest>;

    /// Create a directory (and parents) on the node.
    async fn mkdirs(&self, path: &Path) -> Result<()>;
}
