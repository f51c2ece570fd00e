//! Container lifecycle manager: the single owner of instance records and the
//! only component that drives the container runtime for tenant containers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::ShimConfig;
use crate::error::{Result, RuntimeOp, ShimError};
use crate::protocol::{self, SecureMessaging};
use crate::sys::nginx::validate_domain_format;
use crate::sys::secrets::InstanceSecret;
use crate::sys::traits::{CommandHandle, ContainerInfo, ContainerRuntime, OutputSink, RunSpec};

pub mod health;
pub mod locks;
pub mod model;
pub mod ports;
pub mod storage;

pub use model::{
    CodeCategory, CodeItem, CodeUpload, DataUpdate, Domain, DomainSsl, Instance, InstanceData, InstanceStatus,
    UpdateResult,
};

use health::HealthProbe;
use locks::{DataLocks, OperationGuards};
use storage::{InstanceStorage, SECRET_FILE};

/// Shared container network in managed mode; instances resolve by container name.
pub const INSTANCE_NETWORK: &str = "bcms";
const APP_ROOT: &str = "/app/backend";
const LOOPBACK: &str = "127.0.0.1";
const LOG_BUFFER: usize = 256;

pub struct InstanceManager {
    config: ShimConfig,
    runtime: Arc<dyn ContainerRuntime>,
    messaging: Arc<SecureMessaging>,
    storage: Arc<InstanceStorage>,
    instances: RwLock<HashMap<String, Instance>>,
    guards: OperationGuards,
    data_locks: DataLocks,
    probe: HealthProbe,
    shutdown: Arc<Notify>,
}

impl InstanceManager {
    pub fn new(config: ShimConfig, runtime: Arc<dyn ContainerRuntime>, messaging: Arc<SecureMessaging>) -> Self {
        Self {
            storage: Arc::new(InstanceStorage::new(config.storage_dir.clone())),
            config,
            runtime,
            messaging,
            instances: RwLock::new(HashMap::new()),
            guards: OperationGuards::default(),
            data_locks: DataLocks::default(),
            probe: HealthProbe::default(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn storage(&self) -> &InstanceStorage {
        &self.storage
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    // ==============================================================================
    // 1. Lookups
    // ==============================================================================

    pub async fn find_by_id(&self, id: &str) -> Option<Instance> {
        self.instances.read().await.get(id).cloned()
    }

    /// The most recently created instance claiming `domain`.
    pub async fn find_by_domain(&self, domain: &str) -> Option<Instance> {
        self.instances
            .read()
            .await
            .values()
            .filter(|instance| instance.serves(domain))
            .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
            .cloned()
    }

    /// Every instance, oldest first (ties broken by id).
    pub async fn find_all(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        all
    }

    // ==============================================================================
    // 2. Records
    // ==============================================================================

    /// Unguarded: any status may follow any other, including itself.
    pub async fn set_status(&self, id: &str, status: InstanceStatus) -> Result<Instance> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| ShimError::NotFound(id.to_string()))?;
        instance.transition(status);
        self.storage.write_record(instance).await?;
        debug!(instance_id = %id, from = %instance.previous_status, to = %status, "Status changed");
        Ok(instance.clone())
    }

    pub async fn create(&self, id: &str) -> Result<Instance> {
        model::validate_instance_id(id).map_err(ShimError::InvalidRequest)?;

        {
            let mut instances = self.instances.write().await;
            if instances.contains_key(id) {
                return Err(ShimError::AlreadyExists(id.to_string()));
            }
            let held = instances.values().map(|instance| instance.port).collect();
            let port = ports::allocate(self.config.port_from, self.config.port_to, &held)?;

            let name = Instance::container_name(id);
            let ip = if self.config.local { LOOPBACK.to_string() } else { name.clone() };
            let instance = Instance {
                id: id.to_string(),
                name,
                port,
                ip,
                status: InstanceStatus::Unknown,
                previous_status: InstanceStatus::Unknown,
                secret: None,
                data: InstanceData::default(),
                created_at: protocol::now_ms(),
            };

            self.storage.prepare(id, &self.config.instance_image).await?;
            self.storage.write_record(&instance).await?;
            info!(instance_id = %id, port, "Instance created");
            instances.insert(id.to_string(), instance);
        }

        self.create_secret(id).await?;
        self.find_by_id(id)
            .await
            .ok_or_else(|| ShimError::NotFound(id.to_string()))
    }

    /// Fresh secret per call (or `"local"` in local mode), persisted to `shim.json`.
    pub async fn create_secret(&self, id: &str) -> Result<InstanceSecret> {
        let secret = if self.config.local {
            InstanceSecret::local()
        } else {
            InstanceSecret::generate()
        };

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| ShimError::NotFound(id.to_string()))?;
        self.storage.write_secret(id, &secret).await?;
        instance.secret = Some(secret.clone());
        Ok(secret)
    }

    /// Applies whichever of `domains/functions/events/jobs` the request carries.
    /// Code categories are replaced wholesale on disk and then in memory while
    /// the per-instance data lock is held.
    pub async fn update(&self, id: &str, update: DataUpdate) -> Result<UpdateResult> {
        if let Some(domains) = &update.domains {
            for domain in domains {
                validate_domain_format(&domain.name).map_err(ShimError::InvalidDomain)?;
            }
        }
        if !self.instances.read().await.contains_key(id) {
            return Err(ShimError::NotFound(id.to_string()));
        }

        let _data = self.data_locks.lock(id).await;
        // A concurrent remove may have won the lock.
        if !self.instances.read().await.contains_key(id) {
            return Err(ShimError::NotFound(id.to_string()));
        }
        let mut result = UpdateResult::default();

        for category in CodeCategory::ALL {
            let Some(uploads) = update.category(category) else {
                continue;
            };
            let items = self.storage.replace_category(id, category, uploads).await?;
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| ShimError::NotFound(id.to_string()))?;
            instance.data.set_category(category, items);
            result.mark(category);
        }

        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| ShimError::NotFound(id.to_string()))?;
        if let Some(domains) = update.domains {
            instance.data.domains = domains;
            result.domains = true;
        }
        self.storage.write_record(instance).await?;

        info!(instance_id = %id, result = ?result, "Instance data updated");
        Ok(result)
    }

    // ==============================================================================
    // 3. Lifecycle (one in-flight operation per instance)
    // ==============================================================================

    pub async fn start(&self, id: &str, output: Option<OutputSink>) -> Result<()> {
        let _busy = self.guards.acquire(id)?;
        let name = self.container_name_of(id).await?;
        info!(instance_id = %id, "Starting instance");
        match self.runtime.start(&name, output).await {
            Ok(()) => self.set_status(id, InstanceStatus::Starting).await.map(|_| ()),
            Err(e) => Err(self.lifecycle_failed(id, RuntimeOp::Start, e).await),
        }
    }

    pub async fn stop(&self, id: &str, output: Option<OutputSink>) -> Result<()> {
        let _busy = self.guards.acquire(id)?;
        let name = self.container_name_of(id).await?;
        info!(instance_id = %id, "Stopping instance");
        self.runtime.stop(&name, output).await.inspect_err(|e| {
            error!(instance_id = %id, op = %RuntimeOp::Stop, error = %e, "Lifecycle operation failed");
        })?;
        self.set_status(id, InstanceStatus::Down).await.map(|_| ())
    }

    pub async fn restart(&self, id: &str, output: Option<OutputSink>) -> Result<()> {
        let _busy = self.guards.acquire(id)?;
        let name = self.container_name_of(id).await?;
        info!(instance_id = %id, "Restarting instance");
        match self.runtime.restart(&name, output).await {
            Ok(()) => self.set_status(id, InstanceStatus::Restarting).await.map(|_| ()),
            Err(e) => Err(self.lifecycle_failed(id, RuntimeOp::Restart, e).await),
        }
    }

    /// Tears the container down and drops the record once removal succeeded.
    pub async fn remove(&self, id: &str, output: Option<OutputSink>) -> Result<()> {
        let _busy = self.guards.acquire(id)?;
        let name = self.container_name_of(id).await?;
        info!(instance_id = %id, "Removing instance");

        // Best-effort: the container may already be stopped.
        if let Err(e) = self.runtime.stop(&name, output.clone()).await {
            debug!(instance_id = %id, error = %e, "Stop before remove failed (tolerated)");
        }
        match self.runtime.remove(&name, output).await {
            Ok(()) => {}
            Err(ShimError::Runtime { ref stderr, .. }) if stderr.contains("No such container") => {
                debug!(instance_id = %id, "Container already absent");
            }
            Err(e) => {
                error!(instance_id = %id, op = %RuntimeOp::Remove, error = %e, "Lifecycle operation failed");
                return Err(e);
            }
        }

        // Waits out any in-flight category replace before the tree goes away.
        let _data = self.data_locks.lock(id).await;
        self.instances.write().await.remove(id);
        self.data_locks.forget(id);
        if let Err(e) = self.storage.remove(id).await {
            warn!(instance_id = %id, error = %e, "Instance removed but its storage dir could not be deleted");
        }
        Ok(())
    }

    /// Builds the instance image (tagged with the container name) from its storage dir.
    pub async fn build(&self, id: &str, output: Option<OutputSink>) -> Result<()> {
        let _busy = self.guards.acquire(id)?;
        let name = self.container_name_of(id).await?;
        // The build context must not be read mid category replace.
        let _data = self.data_locks.lock(id).await;
        info!(instance_id = %id, "Building instance image");
        self.runtime
            .build(&name, &self.storage.dir(id), output)
            .await
            .inspect_err(|e| {
                error!(instance_id = %id, op = %RuntimeOp::Build, error = %e, "Lifecycle operation failed");
            })
    }

    pub async fn run(&self, id: &str, output: Option<OutputSink>) -> Result<()> {
        let _busy = self.guards.acquire(id)?;
        let instance = self
            .find_by_id(id)
            .await
            .ok_or_else(|| ShimError::NotFound(id.to_string()))?;

        if self.runtime.inspect(&instance.name).await?.is_some() {
            if let Err(e) = self.runtime.stop(&instance.name, output.clone()).await {
                debug!(instance_id = %id, error = %e, "Stop before run failed (tolerated)");
            }
            self.runtime.remove(&instance.name, output.clone()).await?;
        }

        let spec = self.run_spec(&instance)?;
        info!(instance_id = %id, port = instance.port, "Running instance container");
        match self.runtime.run(&spec, output).await {
            Ok(()) => self.set_status(id, InstanceStatus::Starting).await.map(|_| ()),
            Err(e) => Err(self.lifecycle_failed(id, RuntimeOp::Run, e).await),
        }
    }

    fn run_spec(&self, instance: &Instance) -> Result<RunSpec> {
        let dir = std::path::absolute(self.storage.dir(&instance.id))?;
        let mut volumes: Vec<_> = CodeCategory::ALL
            .iter()
            .map(|category| (dir.join(category.dir_name()), format!("{APP_ROOT}/{}", category.dir_name())))
            .collect();
        volumes.push((dir.join(SECRET_FILE), format!("{APP_ROOT}/{SECRET_FILE}")));

        let (ports, network) = if self.config.local {
            (vec![(instance.port, instance.port)], None)
        } else {
            (Vec::new(), Some(INSTANCE_NETWORK.to_string()))
        };

        Ok(RunSpec {
            name: instance.name.clone(),
            image: instance.name.clone(),
            ports,
            volumes,
            env: vec![
                ("PORT".to_string(), instance.port.to_string()),
                ("BCMS_INSTANCE_ID".to_string(), instance.id.clone()),
            ],
            network,
        })
    }

    async fn container_name_of(&self, id: &str) -> Result<String> {
        self.instances
            .read()
            .await
            .get(id)
            .map(|instance| instance.name.clone())
            .ok_or_else(|| ShimError::NotFound(id.to_string()))
    }

    /// Logs the failure, marks the instance `down-to-error`, and hands the error back.
    async fn lifecycle_failed(&self, id: &str, op: RuntimeOp, err: ShimError) -> ShimError {
        error!(instance_id = %id, op = %op, error = %err, "Lifecycle operation failed");
        if let Err(e) = self.set_status(id, InstanceStatus::DownToError).await {
            warn!(instance_id = %id, error = %e, "Failed to record error status");
        }
        err
    }

    // ==============================================================================
    // 4. Health
    // ==============================================================================

    /// Probes the instance; never changes its status.
    pub async fn check_health(&self, id: &str) -> Result<bool> {
        let instance = self
            .find_by_id(id)
            .await
            .ok_or_else(|| ShimError::NotFound(id.to_string()))?;
        let secret = instance
            .secret
            .ok_or_else(|| ShimError::InvalidRequest(format!("instance '{id}' has no secret")))?;
        Ok(self
            .probe
            .probe(&self.messaging, id, &instance.ip, instance.port, &secret)
            .await)
    }

    /// One sweep over every idle instance. Returns the status changes applied.
    pub async fn health_sweep(&self) -> Vec<(String, InstanceStatus)> {
        let mut changes = Vec::new();
        for instance in self.find_all().await {
            if self.guards.is_busy(&instance.id) {
                continue;
            }
            let healthy = match self.check_health(&instance.id).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Health check skipped");
                    continue;
                }
            };
            let next = match (healthy, instance.status) {
                (true, InstanceStatus::Running | InstanceStatus::SafeMode) => None,
                (true, _) => Some(InstanceStatus::Running),
                (false, InstanceStatus::Running) => Some(InstanceStatus::Down),
                (false, _) => None,
            };
            if let Some(status) = next {
                match self.set_status(&instance.id, status).await {
                    Ok(_) => changes.push((instance.id, status)),
                    Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to apply health status"),
                }
            }
        }
        changes
    }

    pub async fn run_health_monitor(&self) {
        info!(interval_secs = self.config.health_interval.as_secs(), "Health monitor started");
        let mut ticker = tokio::time::interval(self.config.health_interval);
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    let changes = self.health_sweep().await;
                    if !changes.is_empty() {
                        info!(changed = changes.len(), "Health sweep updated statuses");
                    }
                }
            }
        }
    }

    // ==============================================================================
    // 5. Boot and observation
    // ==============================================================================

    /// Reloads every persisted record (and its secret) from storage.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.storage.read_records().await?;
        let mut instances = self.instances.write().await;
        for mut instance in records {
            if let Err(e) = model::validate_instance_id(&instance.id) {
                warn!(error = %e, "Skipping stored record with invalid id");
                continue;
            }
            match self.storage.read_secret(&instance.id).await {
                Ok(secret) => instance.secret = secret,
                Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to read secret descriptor"),
            }
            instances.insert(instance.id.clone(), instance);
        }
        info!(count = instances.len(), "Restored instances from storage");
        Ok(instances.len())
    }

    /// Aligns statuses with what the runtime reports: running containers are
    /// `running`, exited or missing ones are `down`. `safe-mode` is left alone.
    pub async fn sync_with_runtime(&self) -> Result<()> {
        let live: HashMap<String, ContainerInfo> = self
            .runtime
            .inspect_all()
            .await?
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();

        for instance in self.find_all().await {
            let observed = match live.get(&instance.name) {
                Some(info) if info.is_running() => InstanceStatus::Running,
                _ => InstanceStatus::Down,
            };
            if instance.status != observed && instance.status != InstanceStatus::SafeMode {
                self.set_status(&instance.id, observed).await?;
            }
        }
        Ok(())
    }

    /// Follows container logs into `storage/<id>/logs/<YYYY-M-D>.log`.
    /// Stopping (or dropping) the handle ends the follower.
    pub async fn follow_logs(&self, id: &str, tail: usize) -> Result<CommandHandle> {
        let name = self.container_name_of(id).await?;
        let (tx, mut rx) = mpsc::channel::<String>(LOG_BUFFER);
        let follower = self.runtime.follow_logs(&name, tail, tx).await?;

        let storage = self.storage.clone();
        let instance_id = id.to_string();
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let today = chrono::Local::now().date_naive();
                if let Err(e) = storage.append_log(&instance_id, today, &line).await {
                    warn!(instance_id = %instance_id, error = %e, "Failed to append log line");
                }
            }
        });

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = stop_rx.await;
            follower.stop().await;
            let _ = writer.await;
        });
        Ok(CommandHandle::new(stop_tx, task))
    }
}
