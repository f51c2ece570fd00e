// src/sys/docker.rs

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Result, RuntimeOp, ShimError};
use crate::sys::traits::{CommandHandle, ContainerInfo, ContainerRuntime, OutputSink, RunSpec};

const PS_FORMAT: &str = "{{.ID}} {{.Names}} {{.State}} {{.Status}}";

/// Drives the container engine through its command-line surface.
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    /// Spawns the command, streams every stdout/stderr line to `output`, and
    /// returns the collected stdout. A non-zero exit becomes a runtime error
    /// carrying the raw stderr.
    async fn execute(&self, op: RuntimeOp, args: &[String], output: Option<OutputSink>) -> Result<String> {
        debug!(op = %op, args = ?args, "Running container command");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShimError::runtime(op, format!("failed to spawn {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShimError::runtime(op, "stdout pipe unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ShimError::runtime(op, "stderr pipe unavailable"))?;

        let out_task = tokio::spawn(collect_lines(stdout, output.clone()));
        let err_task = tokio::spawn(collect_lines(stderr, output));

        let status = child
            .wait()
            .await
            .map_err(|e| ShimError::runtime(op, e.to_string()))?;
        let stdout = out_task.await.unwrap_or_default();
        let stderr = err_task.await.unwrap_or_default();

        if !status.success() {
            let stderr = if stderr.trim().is_empty() {
                format!("exited with code {}", status.code().unwrap_or(-1))
            } else {
                stderr
            };
            return Err(ShimError::runtime(op, stderr));
        }
        Ok(stdout)
    }

    async fn simple(&self, op: RuntimeOp, verb: &str, target: &str, output: Option<OutputSink>) -> Result<()> {
        self.execute(op, &[verb.to_string(), target.to_string()], output)
            .await
            .map(|_| ())
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R, sink: Option<OutputSink>) -> String {
    let mut collected = String::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(tx) = &sink {
            let _ = tx.send(line.clone()).await;
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

fn ps_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\S+)\s+(\S+)\s+(\S+)\s*(.*)$").expect("ps line pattern is valid"))
}

/// Parses `ps -a --format "{{.ID}} {{.Names}} {{.State}} {{.Status}}"`.
pub fn parse_ps_output(raw: &str) -> Vec<ContainerInfo> {
    raw.lines()
        .filter_map(|line| {
            let caps = ps_line_pattern().captures(line.trim())?;
            Some(ContainerInfo {
                id: caps[1].to_string(),
                name: caps[2].to_string(),
                state: caps[3].to_lowercase(),
                status: caps[4].trim().to_string(),
                ip: None,
            })
        })
        .collect()
}

/// Parses the JSON array printed by `inspect --type container <name>`.
pub fn parse_inspect_output(raw: &str) -> Result<Option<ContainerInfo>> {
    let parsed: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| ShimError::runtime(RuntimeOp::Inspect, format!("malformed inspect output: {e}")))?;
    let Some(entry) = parsed.as_array().and_then(|a| a.first()) else {
        return Ok(None);
    };

    let text = |value: &serde_json::Value| value.as_str().unwrap_or_default().to_string();
    let state = &entry["State"];
    let ip = entry["NetworkSettings"]["Networks"]
        .as_object()
        .and_then(|nets| nets.values().find_map(|n| n["IPAddress"].as_str()))
        .or_else(|| entry["NetworkSettings"]["IPAddress"].as_str())
        .filter(|ip| !ip.is_empty())
        .map(str::to_string);

    Ok(Some(ContainerInfo {
        id: text(&entry["Id"]),
        name: text(&entry["Name"]).trim_start_matches('/').to_string(),
        state: text(&state["Status"]),
        status: text(&state["Status"]),
        ip,
    }))
}

pub fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "-d".to_string()];
    for (host, container) in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{host}:{container}"));
    }
    for (host, container) in &spec.volumes {
        args.push("-v".to_string());
        args.push(format!("{}:{}", host.display(), container));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    args.push("--name".to_string());
    args.push(spec.name.clone());
    args.push(spec.image.clone());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect_all(&self) -> Result<Vec<ContainerInfo>> {
        let args = ["ps", "-a", "--no-trunc", "--format", PS_FORMAT].map(String::from);
        let stdout = self.execute(RuntimeOp::InspectAll, &args, None).await?;
        Ok(parse_ps_output(&stdout))
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let args = ["inspect", "--type", "container", name].map(String::from);
        match self.execute(RuntimeOp::Inspect, &args, None).await {
            Ok(stdout) => parse_inspect_output(&stdout),
            Err(ShimError::Runtime { stderr, .. }) if stderr.contains("No such") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn build(&self, tag: &str, context: &Path, output: Option<OutputSink>) -> Result<()> {
        let args = vec![
            "build".to_string(),
            "-t".to_string(),
            tag.to_string(),
            context.display().to_string(),
        ];
        self.execute(RuntimeOp::Build, &args, output).await.map(|_| ())
    }

    async fn run(&self, spec: &RunSpec, output: Option<OutputSink>) -> Result<()> {
        self.execute(RuntimeOp::Run, &run_args(spec), output).await.map(|_| ())
    }

    async fn start(&self, name: &str, output: Option<OutputSink>) -> Result<()> {
        self.simple(RuntimeOp::Start, "start", name, output).await
    }

    async fn stop(&self, name: &str, output: Option<OutputSink>) -> Result<()> {
        self.simple(RuntimeOp::Stop, "stop", name, output).await
    }

    async fn restart(&self, name: &str, output: Option<OutputSink>) -> Result<()> {
        self.simple(RuntimeOp::Restart, "restart", name, output).await
    }

    async fn remove(&self, name: &str, output: Option<OutputSink>) -> Result<()> {
        self.simple(RuntimeOp::Remove, "rm", name, output).await
    }

    async fn remove_image(&self, tag: &str, output: Option<OutputSink>) -> Result<()> {
        self.simple(RuntimeOp::RemoveImage, "rmi", tag, output).await
    }

    async fn copy_into(&self, name: &str, source: &Path, dest: &str) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            source.display().to_string(),
            format!("{name}:{dest}"),
        ];
        self.execute(RuntimeOp::Copy, &args, None).await.map(|_| ())
    }

    async fn follow_logs(&self, name: &str, tail: usize, output: OutputSink) -> Result<CommandHandle> {
        let mut child = Command::new(&self.program)
            .args(["logs", "--tail", &tail.to_string(), "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShimError::runtime(RuntimeOp::Logs, e.to_string()))?;

        // The engine writes container stdout and stderr to the matching pipes.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, output));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let name = name.to_string();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx => {
                    let _ = child.kill().await;
                    debug!(container = %name, "Log follower stopped");
                }
                status = child.wait() => {
                    debug!(container = %name, status = ?status, "Log follower exited");
                }
            }
        });
        Ok(CommandHandle::new(stop_tx, task))
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, sink: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if sink.send(line).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_ps_output() {
        let raw = "abc123 bcms-instance-one running Up 2 minutes\n\
                   def456 bcms-proxy exited Exited (0) 3 hours ago\n\
                   \n";
        let containers = parse_ps_output(raw);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "bcms-instance-one");
        assert!(containers[0].is_running());
        assert_eq!(containers[1].state, "exited");
        assert_eq!(containers[1].status, "Exited (0) 3 hours ago");
    }

    #[test]
    fn test_parse_inspect_output() {
        let raw = r#"[{"Id":"f00","Name":"/bcms-instance-one","State":{"Status":"running","Running":true},
            "NetworkSettings":{"IPAddress":"","Networks":{"bcms":{"IPAddress":"172.18.0.4"}}}}]"#;
        let info = parse_inspect_output(raw).unwrap().unwrap();
        assert_eq!(info.name, "bcms-instance-one");
        assert_eq!(info.ip.as_deref(), Some("172.18.0.4"));
        assert!(info.is_running());

        assert_eq!(parse_inspect_output("[]").unwrap(), None);
        assert!(matches!(
            parse_inspect_output("garbage"),
            Err(ShimError::Runtime { op: RuntimeOp::Inspect, .. })
        ));
    }

    #[test]
    fn test_run_args_order() {
        let spec = RunSpec {
            name: "bcms-proxy".to_string(),
            image: "bcms-proxy".to_string(),
            ports: vec![(80, 80), (3000, 3000)],
            volumes: vec![(PathBuf::from("/srv/proxy/ssl"), "/etc/nginx/ssl".to_string())],
            env: vec![("PORT".to_string(), "1280".to_string())],
            network: Some("bcms".to_string()),
        };
        assert_eq!(
            run_args(&spec),
            vec![
                "run", "-d", "-p", "80:80", "-p", "3000:3000", "-v", "/srv/proxy/ssl:/etc/nginx/ssl",
                "-e", "PORT=1280", "--network", "bcms", "--name", "bcms-proxy", "bcms-proxy",
            ]
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let cli = DockerCli::new("sh");
        let args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
        let err = cli.execute(RuntimeOp::Build, &args, None).await.unwrap_err();
        match err {
            ShimError::Runtime { op, stderr } => {
                assert_eq!(op, RuntimeOp::Build);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_lines_are_streamed() {
        let cli = DockerCli::new("sh");
        let (tx, mut rx) = mpsc::channel(8);
        let args = vec!["-c".to_string(), "echo one; echo two".to_string()];
        let stdout = cli.execute(RuntimeOp::Run, &args, Some(tx)).await.unwrap();

        assert_eq!(stdout, "one\ntwo\n");
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
    }
}
