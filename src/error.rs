// src/error.rs

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;

/// Container runtime operation that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    InspectAll,
    Inspect,
    Logs,
    Build,
    Run,
    Start,
    Stop,
    Restart,
    Remove,
    RemoveImage,
    Copy,
}

impl fmt::Display for RuntimeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeOp::InspectAll => "inspect all",
            RuntimeOp::Inspect => "inspect",
            RuntimeOp::Logs => "logs",
            RuntimeOp::Build => "build",
            RuntimeOp::Run => "run",
            RuntimeOp::Start => "start",
            RuntimeOp::Stop => "stop",
            RuntimeOp::Restart => "restart",
            RuntimeOp::Remove => "rm",
            RuntimeOp::RemoveImage => "rmi",
            RuntimeOp::Copy => "cp",
        };
        f.write_str(name)
    }
}

/// Shim errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShimError {
    /// Envelope or signed-header rejection (validation or crypto).
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Container/proxy command failed; carries the raw stderr.
    #[error("Runtime error during '{op}': {stderr}")]
    Runtime { op: RuntimeOp, stderr: String },

    /// Remote side (instance or cloud) could not be reached.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A lifecycle operation is already in flight for this target.
    #[error("Busy: an operation is already running for '{0}'")]
    Busy(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Instance already exists: {0}")]
    AlreadyExists(String),

    #[error("No free port left in range {from}-{to}")]
    PortsExhausted { from: u16, to: u16 },

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ShimError {
    pub fn runtime(op: RuntimeOp, stderr: impl Into<String>) -> Self {
        ShimError::Runtime { op, stderr: stderr.into() }
    }
}

pub type Result<T> = std::result::Result<T, ShimError>;
