// src/shim.rs

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::cloud::Heartbeat;
use crate::config::ShimConfig;
use crate::error::{Result, ShimError};
use crate::instance::{DataUpdate, Instance, InstanceManager, UpdateResult};
use crate::protocol::{self, Envelope, KeyRing, SecureMessaging, SignedHeaders};
use crate::proxy::ProxyEngine;
use crate::sys::traits::{CloudTransport, ContainerRuntime, OutputSink, StatsSource};

/// Background drivers and the handles that stop them.
pub struct Drivers {
    tasks: Vec<(&'static str, Arc<Notify>, JoinHandle<()>)>,
}

/// The shim service: wires the core components together and exposes the
/// operations the (external) request layer calls into.
pub struct Shim {
    config: ShimConfig,
    messaging: Arc<SecureMessaging>,
    instances: Arc<InstanceManager>,
    proxy: Arc<ProxyEngine>,
    heartbeat: Arc<Heartbeat>,
}

impl Shim {
    pub fn new(
        config: ShimConfig,
        runtime: Arc<dyn ContainerRuntime>,
        transport: Arc<dyn CloudTransport>,
        stats: Arc<dyn StatsSource>,
        keys: KeyRing,
    ) -> Result<Self> {
        let messaging = Arc::new(SecureMessaging::new(keys));
        let instances = Arc::new(InstanceManager::new(config.clone(), runtime.clone(), messaging.clone()));
        let proxy = Arc::new(ProxyEngine::new(&config, instances.clone(), runtime)?);
        let heartbeat = Arc::new(Heartbeat::new(instances.clone(), messaging.clone(), transport, stats));
        Ok(Self { config, messaging, instances, proxy, heartbeat })
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    pub fn messaging(&self) -> &Arc<SecureMessaging> {
        &self.messaging
    }

    pub fn instances(&self) -> &Arc<InstanceManager> {
        &self.instances
    }

    pub fn proxy(&self) -> &Arc<ProxyEngine> {
        &self.proxy
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    /// Restores records, reconciles with the runtime and renders the proxy.
    pub async fn boot(&self) -> Result<()> {
        let restored = self.instances.restore().await?;
        if let Err(e) = self.instances.sync_with_runtime().await {
            // Keep booting: statuses converge on the next health sweep.
            warn!(error = %e, "Failed to sync instance statuses with runtime");
        }
        self.proxy.update_config().await?;
        info!(instances = restored, "Shim booted");
        Ok(())
    }

    // ==============================================================================
    // 1. Message boundary
    // ==============================================================================

    pub async fn decode(&self, instance_id: &str, envelope: &Envelope) -> Result<Value> {
        self.messaging.decode(instance_id, envelope).await.map_err(|e| {
            protocol::log_rejection(instance_id, &e);
            ShimError::Protocol(e)
        })
    }

    pub async fn encode(&self, instance_id: &str, payload: &Value) -> Result<Envelope> {
        Ok(self.messaging.encode(instance_id, payload).await?)
    }

    /// Verifies a flat-header call against the instance's own secret.
    pub async fn verify_signed(&self, instance_id: &str, signed: &SignedHeaders, payload: &Value) -> Result<()> {
        let instance = self
            .instances
            .find_by_id(instance_id)
            .await
            .ok_or_else(|| ShimError::NotFound(instance_id.to_string()))?;
        let secret = instance
            .secret
            .ok_or_else(|| ShimError::InvalidRequest(format!("instance '{instance_id}' has no secret")))?;
        let key = secret.use_secret(|code| Zeroizing::new(code.as_bytes().to_vec()));

        self.messaging
            .verify_headers(&key, signed, payload)
            .await
            .map_err(|e| {
                protocol::log_rejection(instance_id, &e);
                ShimError::Protocol(e)
            })
    }

    // ==============================================================================
    // 2. Instance operations that touch routing
    // ==============================================================================

    pub async fn provision(&self, instance_id: &str) -> Result<Instance> {
        self.instances.create(instance_id).await
    }

    /// Domain changes re-render the proxy config; the debounce applies it.
    pub async fn update_data(&self, instance_id: &str, update: DataUpdate) -> Result<UpdateResult> {
        let result = self.instances.update(instance_id, update).await?;
        if result.domains {
            self.proxy.update_config().await?;
        }
        Ok(result)
    }

    pub async fn remove_instance(&self, instance_id: &str, output: Option<OutputSink>) -> Result<()> {
        self.instances.remove(instance_id, output).await?;
        self.proxy.update_config().await?;
        Ok(())
    }

    // ==============================================================================
    // 3. Drivers
    // ==============================================================================

    /// Replay sweep (1s), health sweep, proxy debounce (5s), heartbeat (1s).
    pub fn spawn_drivers(&self) -> Drivers {
        let messaging = self.messaging.clone();
        let instances = self.instances.clone();
        let proxy = self.proxy.clone();
        let heartbeat = self.heartbeat.clone();

        Drivers {
            tasks: vec![
                (
                    "replay-sweeper",
                    self.messaging.shutdown_handle(),
                    tokio::spawn(async move { messaging.run_sweeper().await }),
                ),
                (
                    "health-monitor",
                    self.instances.shutdown_handle(),
                    tokio::spawn(async move { instances.run_health_monitor().await }),
                ),
                (
                    "proxy-debounce",
                    self.proxy.shutdown_handle(),
                    tokio::spawn(async move { proxy.run_debounce().await }),
                ),
                (
                    "cloud-heartbeat",
                    self.heartbeat.shutdown_handle(),
                    tokio::spawn(async move { heartbeat.run().await }),
                ),
            ],
        }
    }
}

impl Drivers {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signals every driver and waits for it to exit.
    pub async fn shutdown(self) {
        for (_, notify, _) in &self.tasks {
            // notify_one stores a permit, so a driver mid-tick still sees it.
            notify.notify_one();
        }
        for (name, _, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(driver = name, error = %e, "Driver ended abnormally");
            }
        }
        info!("All drivers stopped");
    }
}
