// 🛡️ Zero-Trust Architecture: everything that touches the host goes through here.

pub mod traits;     // Global contracts
pub mod docker;     // Container engine CLI
pub mod secrets;    // Memory hygiene (InstanceSecret, PrivateKey)
pub mod nginx;      // Ingress config rendering
pub mod ssl;        // Certificate tree
pub mod stats;      // Host telemetry
pub mod cloud_http; // Outbound cloud calls

#[cfg(test)]
pub mod mock;       // In-memory container engine

// 🏗️ SLA Re-exports
pub use docker::DockerCli;
pub use secrets::{InstanceSecret, PrivateKey};
pub use traits::{CloudTransport, CommandHandle, ContainerInfo, ContainerRuntime, OutputSink, RunSpec, StatsSource};
