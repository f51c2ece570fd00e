// src/sys/mock.rs

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};

use crate::error::{Result, RuntimeOp, ShimError};
use crate::sys::traits::{CommandHandle, ContainerInfo, ContainerRuntime, OutputSink, RunSpec};

/// In-memory container engine for tests.
#[derive(Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<RuntimeOp>>,
    containers: Mutex<HashMap<String, ContainerInfo>>,
    copied: Mutex<Vec<(String, String, String)>>,
    build_gate: Mutex<Option<Arc<Notify>>>,
    pub build_entered: Notify,
    pub log_lines: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn fail(&self, op: RuntimeOp) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn heal(&self, op: RuntimeOp) {
        self.failing.lock().unwrap().remove(&op);
    }

    /// Makes every subsequent build wait until the returned gate is notified.
    pub fn hold_builds(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.build_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn add_container(&self, name: &str, state: &str) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            ContainerInfo {
                id: format!("id-{name}"),
                name: name.to_string(),
                state: state.to_string(),
                status: state.to_string(),
                ip: None,
            },
        );
    }

    pub fn container_state(&self, name: &str) -> Option<String> {
        self.containers.lock().unwrap().get(name).map(|c| c.state.clone())
    }

    /// `(container, dest, file contents)` for every `cp`.
    pub fn copied(&self) -> Vec<(String, String, String)> {
        self.copied.lock().unwrap().clone()
    }

    fn record(&self, op: RuntimeOp, target: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{op} {target}"));
        if self.failing.lock().unwrap().contains(&op) {
            return Err(ShimError::runtime(op, format!("mock failure: {op} {target}")));
        }
        Ok(())
    }

    fn set_state(&self, name: &str, state: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(name) {
            c.state = state.to_string();
            c.status = state.to_string();
        }
    }

    async fn emit(output: Option<OutputSink>, line: String) {
        if let Some(tx) = output {
            let _ = tx.send(line).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn inspect_all(&self) -> Result<Vec<ContainerInfo>> {
        self.record(RuntimeOp::InspectAll, "")?;
        let mut all: Vec<ContainerInfo> = self.containers.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>> {
        self.record(RuntimeOp::Inspect, name)?;
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }

    async fn build(&self, tag: &str, _context: &Path, output: Option<OutputSink>) -> Result<()> {
        self.record(RuntimeOp::Build, tag)?;
        self.build_entered.notify_one();
        let gate = self.build_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Self::emit(output, format!("Successfully tagged {tag}")).await;
        Ok(())
    }

    async fn run(&self, spec: &RunSpec, output: Option<OutputSink>) -> Result<()> {
        self.record(RuntimeOp::Run, &spec.name)?;
        self.add_container(&spec.name, "running");
        Self::emit(output, format!("id-{}", spec.name)).await;
        Ok(())
    }

    async fn start(&self, name: &str, output: Option<OutputSink>) -> Result<()> {
        self.record(RuntimeOp::Start, name)?;
        self.set_state(name, "running");
        Self::emit(output, name.to_string()).await;
        Ok(())
    }

    async fn stop(&self, name: &str, output: Option<OutputSink>) -> Result<()> {
        self.record(RuntimeOp::Stop, name)?;
        self.set_state(name, "exited");
        Self::emit(output, name.to_string()).await;
        Ok(())
    }

    async fn restart(&self, name: &str, output: Option<OutputSink>) -> Result<()> {
        self.record(RuntimeOp::Restart, name)?;
        self.set_state(name, "running");
        Self::emit(output, name.to_string()).await;
        Ok(())
    }

    async fn remove(&self, name: &str, output: Option<OutputSink>) -> Result<()> {
        self.record(RuntimeOp::Remove, name)?;
        self.containers.lock().unwrap().remove(name);
        Self::emit(output, name.to_string()).await;
        Ok(())
    }

    async fn remove_image(&self, tag: &str, _output: Option<OutputSink>) -> Result<()> {
        self.record(RuntimeOp::RemoveImage, tag)
    }

    async fn copy_into(&self, name: &str, source: &Path, dest: &str) -> Result<()> {
        self.record(RuntimeOp::Copy, name)?;
        let contents = tokio::fs::read_to_string(source).await?;
        self.copied
            .lock()
            .unwrap()
            .push((name.to_string(), dest.to_string(), contents));
        Ok(())
    }

    async fn follow_logs(&self, name: &str, _tail: usize, output: OutputSink) -> Result<CommandHandle> {
        self.record(RuntimeOp::Logs, name)?;
        let lines = self.log_lines.lock().unwrap().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            for line in lines {
                if output.send(line).await.is_err() {
                    return;
                }
            }
            let _ = stop_rx.await;
        });
        Ok(CommandHandle::new(stop_tx, task))
    }
}
