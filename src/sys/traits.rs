use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cloud::SystemStats;
use crate::error::Result;
use crate::protocol::Envelope;

/// Raw output lines from a container command, forwarded as they arrive.
pub type OutputSink = mpsc::Sender<String>;

// ==============================================================================
// 1. Container Runtime (the only door to the container engine)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Engine state word: `running`, `exited`, `created`, `restarting`, ...
    pub state: String,
    /// Human status column, e.g. `Up 3 minutes`.
    pub status: String,
    pub ip: Option<String>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Arguments for `run -d ... --name <name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// `(host, container)` port bindings.
    pub ports: Vec<(u16, u16)>,
    /// `(host path, container path)` bind mounts.
    pub volumes: Vec<(PathBuf, String)>,
    pub env: Vec<(String, String)>,
    pub network: Option<String>,
}

/// Stop handle for a long-running command (log follower).
pub struct CommandHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CommandHandle {
    pub fn new(stop_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self { stop_tx: Some(stop_tx), task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Kills the underlying command and waits for its task to wind down.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect_all(&self) -> Result<Vec<ContainerInfo>>;

    /// `Ok(None)` when no container carries that name.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>>;

    async fn build(&self, tag: &str, context: &Path, output: Option<OutputSink>) -> Result<()>;

    async fn run(&self, spec: &RunSpec, output: Option<OutputSink>) -> Result<()>;

    async fn start(&self, name: &str, output: Option<OutputSink>) -> Result<()>;

    async fn stop(&self, name: &str, output: Option<OutputSink>) -> Result<()>;

    async fn restart(&self, name: &str, output: Option<OutputSink>) -> Result<()>;

    async fn remove(&self, name: &str, output: Option<OutputSink>) -> Result<()>;

    async fn remove_image(&self, tag: &str, output: Option<OutputSink>) -> Result<()>;

    /// Copies a host file into a (running or stopped) container.
    async fn copy_into(&self, name: &str, source: &Path, dest: &str) -> Result<()>;

    /// `logs --tail N -f <name>`; lines go to `output` until the handle is stopped.
    async fn follow_logs(&self, name: &str, tail: usize, output: OutputSink) -> Result<CommandHandle>;
}

// ==============================================================================
// 2. Cloud Transport (outbound, envelope bodies only)
// ==============================================================================

#[async_trait]
pub trait CloudTransport: Send + Sync {
    /// `POST /register`; the reply body is an envelope carrying the channel.
    async fn register(&self, instance_id: &str, body: &Envelope) -> Result<Envelope>;

    /// `POST /conn/<channel>`.
    async fn send_stats(&self, instance_id: &str, channel: &str, body: &Envelope) -> Result<()>;
}

// ==============================================================================
// 3. Host Telemetry
// ==============================================================================

#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn sample(&self) -> Result<SystemStats>;
}
