//! Reverse proxy configuration engine.
//!
//! `update_config` renders the routing table from the live instance set and
//! records it as the desired config. A 5s debounce tick compares desired with
//! last-applied and, on a difference, copies the file into the proxy container
//! and restarts it (stop, then start). Bursts of edits collapse into one restart.

use std::collections::BTreeMap;
use std::fs as std_fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::ShimConfig;
use crate::error::Result;
use crate::instance::{DomainSsl, Instance, InstanceManager, INSTANCE_NETWORK};
use crate::sys::nginx::{self, CERT_MOUNT, DEFAULT_TEMPLATE};
use crate::sys::ssl::CertificateStore;
use crate::sys::traits::{ContainerRuntime, OutputSink, RunSpec};

pub const PROXY_CONTAINER: &str = "bcms-proxy";
pub const PROXY_IMAGE: &str = "bcms-proxy";
pub const CONFIG_FILE: &str = "nginx.conf";
const CONTAINER_CONFIG_PATH: &str = "/etc/nginx/nginx.conf";
const PROXY_DOCKERFILE: &str = "FROM nginx:stable-alpine\nCOPY nginx.conf /etc/nginx/nginx.conf\n";
const PROXY_PORTS: [(u16, u16); 2] = [(80, 80), (3000, 3000)];
const DEBOUNCE_INTERVAL: Duration = Duration::from_secs(5);

struct Route<'a> {
    instance_id: &'a str,
    ip: &'a str,
    port: u16,
    ssl: Option<&'a DomainSsl>,
}

/// Output of one render: the composite config plus the certificates it refers to.
#[derive(Debug, Default, PartialEq)]
pub struct Rendered {
    pub config: String,
    pub certificates: Vec<(String, DomainSsl)>,
    pub http_blocks: usize,
    pub https_blocks: usize,
}

/// Pure function of the instance list (oldest first). A domain claimed by
/// several instances routes to the last one in that order.
pub fn render(instances: &[Instance], template: &str, excluded_suffixes: &[String]) -> Rendered {
    let mut routes: BTreeMap<String, Route<'_>> = BTreeMap::new();
    for instance in instances {
        for domain in &instance.data.domains {
            let name = domain.name.to_ascii_lowercase();
            if excluded_suffixes.iter().any(|suffix| name.ends_with(suffix.as_str())) {
                continue;
            }
            if let Err(e) = nginx::validate_domain_format(&name) {
                warn!(instance_id = %instance.id, error = %e, "Skipping unroutable domain");
                continue;
            }
            let route = Route {
                instance_id: &instance.id,
                ip: &instance.ip,
                port: instance.port,
                ssl: domain.ssl.as_ref(),
            };
            if let Some(previous) = routes.insert(name.clone(), route) {
                if previous.instance_id != instance.id {
                    warn!(
                        domain = %name,
                        previous = %previous.instance_id,
                        winner = %instance.id,
                        "Domain claimed by several instances, last registered wins"
                    );
                }
            }
        }
    }

    let mut rendered = Rendered::default();
    let mut blocks = nginx::render_default_block();
    for (domain, route) in &routes {
        match route.ssl {
            Some(ssl) => {
                blocks.push_str(&nginx::render_https_block(domain, route.ip, route.port));
                rendered.certificates.push((domain.clone(), ssl.clone()));
                rendered.https_blocks += 1;
            }
            None => {
                blocks.push_str(&nginx::render_http_block(domain, route.ip, route.port));
                rendered.http_blocks += 1;
            }
        }
    }
    rendered.config = nginx::compose(template, &blocks);
    rendered
}

#[derive(Default)]
struct ApplyState {
    desired: Option<String>,
    applied: Option<String>,
}

pub struct ProxyEngine {
    instances: Arc<InstanceManager>,
    runtime: Arc<dyn ContainerRuntime>,
    dir: PathBuf,
    template: String,
    excluded_suffixes: Vec<String>,
    local: bool,
    certs: CertificateStore,
    // Held across render+write and across apply so the proxy never sees a
    // half-rebuilt certificate tree.
    render_lock: Mutex<()>,
    state: Mutex<ApplyState>,
    shutdown: Arc<Notify>,
}

impl ProxyEngine {
    pub fn new(config: &ShimConfig, instances: Arc<InstanceManager>, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let template = match &config.proxy_template {
            Some(path) => std_fs::read_to_string(path)?,
            None => DEFAULT_TEMPLATE.to_string(),
        };
        Ok(Self {
            instances,
            runtime,
            certs: CertificateStore::new(config.proxy_dir.join("ssl")),
            dir: config.proxy_dir.clone(),
            template,
            excluded_suffixes: config.proxy_excluded_suffixes.clone(),
            local: config.local,
            render_lock: Mutex::new(()),
            state: Mutex::new(ApplyState::default()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Re-materializes certificates and the config file. Returns whether the
    /// desired config differs from the previous render.
    pub async fn update_config(&self) -> Result<bool> {
        let _render = self.render_lock.lock().await;
        let instances = self.instances.find_all().await;
        let rendered = render(&instances, &self.template, &self.excluded_suffixes);

        self.certs.wipe().await?;
        for (domain, ssl) in &rendered.certificates {
            self.certs.install(domain, &ssl.cert, &ssl.key).await?;
        }
        write_config(&self.config_path(), &rendered.config).await?;

        let mut state = self.state.lock().await;
        let changed = state.desired.as_deref() != Some(rendered.config.as_str());
        if changed {
            info!(
                http = rendered.http_blocks,
                https = rendered.https_blocks,
                "Proxy config regenerated"
            );
        }
        state.desired = Some(rendered.config);
        Ok(changed)
    }

    /// Debounce step: pushes the desired config into the proxy only when it
    /// differs from what was last applied. Returns whether a restart happened.
    pub async fn apply_pending(&self) -> Result<bool> {
        let _render = self.render_lock.lock().await;
        let desired = {
            let state = self.state.lock().await;
            match &state.desired {
                Some(desired) if state.applied.as_ref() != Some(desired) => desired.clone(),
                _ => return Ok(false),
            }
        };

        self.runtime
            .copy_into(PROXY_CONTAINER, &self.config_path(), CONTAINER_CONFIG_PATH)
            .await?;
        self.runtime.stop(PROXY_CONTAINER, None).await?;
        self.runtime.start(PROXY_CONTAINER, None).await?;

        self.state.lock().await.applied = Some(desired);
        info!("Proxy restarted with new config");
        Ok(true)
    }

    pub async fn run_debounce(&self) {
        info!(interval_secs = DEBOUNCE_INTERVAL.as_secs(), "Proxy debounce started");
        let mut ticker = tokio::time::interval(DEBOUNCE_INTERVAL);
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Proxy debounce received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    // Left pending on failure; the next tick retries.
                    if let Err(e) = self.apply_pending().await {
                        warn!(error = %e, "Failed to apply proxy config");
                    }
                }
            }
        }
    }

    // ==============================================================================
    // Proxy container lifecycle
    // ==============================================================================

    pub async fn start(&self, output: Option<OutputSink>) -> Result<()> {
        self.runtime.start(PROXY_CONTAINER, output).await
    }

    pub async fn stop(&self, output: Option<OutputSink>) -> Result<()> {
        self.runtime.stop(PROXY_CONTAINER, output).await
    }

    pub async fn restart(&self, output: Option<OutputSink>) -> Result<()> {
        self.runtime.restart(PROXY_CONTAINER, output).await
    }

    /// Best-effort stop, rm, rmi; an already absent proxy is not an error.
    pub async fn remove(&self, output: Option<OutputSink>) {
        if let Err(e) = self.runtime.stop(PROXY_CONTAINER, output.clone()).await {
            debug!(error = %e, "Proxy stop skipped");
        }
        if let Err(e) = self.runtime.remove(PROXY_CONTAINER, output.clone()).await {
            debug!(error = %e, "Proxy rm skipped");
        }
        if let Err(e) = self.runtime.remove_image(PROXY_IMAGE, output).await {
            debug!(error = %e, "Proxy rmi skipped");
        }
    }

    /// updateConfig, remove, build, then run with ports 80/3000 and the
    /// certificate tree mounted read-only.
    pub async fn run(&self, output: Option<OutputSink>) -> Result<()> {
        self.update_config().await?;
        self.remove(output.clone()).await;

        let _render = self.render_lock.lock().await;
        self.ensure_build_context().await?;
        self.runtime.build(PROXY_IMAGE, &self.dir, output.clone()).await?;

        let spec = RunSpec {
            name: PROXY_CONTAINER.to_string(),
            image: PROXY_IMAGE.to_string(),
            ports: PROXY_PORTS.to_vec(),
            volumes: vec![(std::path::absolute(self.certs.root())?, format!("{CERT_MOUNT}:ro"))],
            env: Vec::new(),
            network: (!self.local).then(|| INSTANCE_NETWORK.to_string()),
        };
        self.runtime.run(&spec, output).await?;

        // The image was built with the current config baked in.
        let mut state = self.state.lock().await;
        state.applied = state.desired.clone();
        info!("Proxy container running");
        Ok(())
    }

    async fn ensure_build_context(&self) -> Result<()> {
        let dockerfile = self.dir.join("Dockerfile");
        if !tokio_fs::try_exists(&dockerfile).await? {
            tokio_fs::create_dir_all(&self.dir).await?;
            tokio_fs::write(&dockerfile, PROXY_DOCKERFILE).await?;
        }
        Ok(())
    }
}

/// tmp + rename so the proxy never reads a half-written file; world-readable
/// for the nginx worker.
async fn write_config(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio_fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("conf.tmp");
    let mut opts = std_fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o644);

    let mut file = tokio_fs::OpenOptions::from(opts).open(&tmp).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    tokio_fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeOp;
    use crate::instance::{DataUpdate, Domain, InstanceData, InstanceStatus};
    use crate::protocol::SecureMessaging;
    use crate::sys::mock::MockRuntime;
    use crate::sys::PrivateKey;
    use std::os::unix::fs::PermissionsExt;

    fn instance(id: &str, port: u16, created_at: i64, domains: Vec<Domain>) -> Instance {
        Instance {
            id: id.to_string(),
            name: Instance::container_name(id),
            port,
            ip: Instance::container_name(id),
            status: InstanceStatus::Running,
            previous_status: InstanceStatus::Unknown,
            secret: None,
            data: InstanceData { domains, ..Default::default() },
            created_at,
        }
    }

    fn tls(name: &str) -> Domain {
        Domain {
            name: name.to_string(),
            ssl: Some(DomainSsl { cert: "CERT".into(), key: PrivateKey::new("KEY".into()) }),
        }
    }

    #[test]
    fn test_render_http_only_domain() {
        let rendered = render(
            &[instance("abc123", 1280, 1, vec![Domain::http("foo.example.com")])],
            DEFAULT_TEMPLATE,
            &[],
        );
        assert_eq!(rendered.http_blocks, 1);
        assert_eq!(rendered.https_blocks, 0);
        assert_eq!(rendered.config.matches("server_name foo.example.com;").count(), 1);
        assert!(rendered.config.contains("proxy_pass http://bcms-instance-abc123:1280;"));
        assert!(!rendered.config.contains("listen 443"));
        assert!(!rendered.config.contains(nginx::SERVERS_PLACEHOLDER));
    }

    #[test]
    fn test_render_always_has_catch_all() {
        let rendered = render(&[], DEFAULT_TEMPLATE, &[]);
        assert!(rendered.config.contains("listen 80 default_server;"));
        assert!(rendered.config.contains("return 404;"));
    }

    #[test]
    fn test_tls_domain_gets_https_block_only() {
        let rendered = render(&[instance("a", 1280, 1, vec![tls("secure.example.com")])], DEFAULT_TEMPLATE, &[]);
        assert_eq!(rendered.https_blocks, 1);
        assert_eq!(rendered.http_blocks, 0);
        assert_eq!(rendered.certificates.len(), 1);
        assert!(rendered.config.contains("ssl_certificate /etc/nginx/ssl/secure.example.com/crt;"));
    }

    #[test]
    fn test_excluded_suffix_and_bad_domains_skipped() {
        let rendered = render(
            &[instance(
                "a",
                1280,
                1,
                vec![Domain::http("a.internal"), Domain::http("bad;domain"), Domain::http("ok.example.com")],
            )],
            DEFAULT_TEMPLATE,
            &[".internal".to_string()],
        );
        assert_eq!(rendered.http_blocks, 1);
        assert!(!rendered.config.contains("a.internal"));
        assert!(!rendered.config.contains("bad;domain"));
    }

    #[test]
    fn test_duplicate_domain_routes_to_last_registered() {
        let rendered = render(
            &[
                instance("old", 1280, 1, vec![Domain::http("shared.example.com")]),
                instance("new", 1281, 2, vec![Domain::http("Shared.Example.com")]),
            ],
            DEFAULT_TEMPLATE,
            &[],
        );
        assert_eq!(rendered.http_blocks, 1);
        assert!(rendered.config.contains("bcms-instance-new:1281"));
        assert!(!rendered.config.contains("bcms-instance-old:1280"));
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: Arc<MockRuntime>,
        instances: Arc<InstanceManager>,
        proxy: ProxyEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = ShimConfig::rooted_at(dir.path());
        let runtime = Arc::new(MockRuntime::default());
        let instances = Arc::new(InstanceManager::new(
            config.clone(),
            runtime.clone(),
            Arc::new(SecureMessaging::default()),
        ));
        let proxy = ProxyEngine::new(&config, instances.clone(), runtime.clone()).unwrap();
        Fixture { _dir: dir, runtime, instances, proxy }
    }

    async fn set_domains(instances: &InstanceManager, id: &str, domains: Vec<Domain>) {
        let update = DataUpdate { domains: Some(domains), ..Default::default() };
        instances.update(id, update).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_config_is_idempotent_and_restarts_once() {
        let f = fixture();
        f.instances.create("abc123").await.unwrap();
        set_domains(&f.instances, "abc123", vec![Domain::http("foo.example.com")]).await;

        assert!(f.proxy.update_config().await.unwrap());
        let first = std::fs::read(f.proxy.config_path()).unwrap();
        assert!(f.proxy.apply_pending().await.unwrap());

        assert!(!f.proxy.update_config().await.unwrap());
        let second = std::fs::read(f.proxy.config_path()).unwrap();
        assert_eq!(first, second);
        assert!(!f.proxy.apply_pending().await.unwrap());

        assert_eq!(f.runtime.count("cp"), 1);
        assert_eq!(f.runtime.count("stop"), 1);
        assert_eq!(f.runtime.count("start"), 1);
        let copied = f.runtime.copied();
        assert_eq!(copied[0].0, PROXY_CONTAINER);
        assert_eq!(copied[0].1, "/etc/nginx/nginx.conf");
    }

    #[tokio::test]
    async fn test_burst_of_edits_collapses_into_one_restart() {
        let f = fixture();
        f.instances.create("abc123").await.unwrap();
        for n in 0..3 {
            set_domains(&f.instances, "abc123", vec![Domain::http(&format!("d{n}.example.com"))]).await;
            f.proxy.update_config().await.unwrap();
        }
        assert!(f.proxy.apply_pending().await.unwrap());
        assert_eq!(f.runtime.count("stop"), 1);
        assert!(f.runtime.copied()[0].2.contains("d2.example.com"));
        assert!(!f.runtime.copied()[0].2.contains("d0.example.com"));
    }

    #[tokio::test]
    async fn test_failed_apply_stays_pending() {
        let f = fixture();
        f.proxy.update_config().await.unwrap();
        f.runtime.fail(RuntimeOp::Copy);
        assert!(f.proxy.apply_pending().await.is_err());

        f.runtime.heal(RuntimeOp::Copy);
        assert!(f.proxy.apply_pending().await.unwrap());
    }

    #[tokio::test]
    async fn test_certificates_rewritten_from_scratch() {
        let f = fixture();
        f.instances.create("abc123").await.unwrap();
        set_domains(&f.instances, "abc123", vec![tls("old.example.com")]).await;
        f.proxy.update_config().await.unwrap();

        set_domains(&f.instances, "abc123", vec![tls("new.example.com")]).await;
        f.proxy.update_config().await.unwrap();

        let ssl_root = f.proxy.dir.join("ssl");
        assert!(!ssl_root.join("old.example.com").exists());
        let key = ssl_root.join("new.example.com").join("key");
        let mode = std::fs::metadata(key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_run_tears_down_then_builds_and_runs() {
        let f = fixture();
        f.runtime.fail(RuntimeOp::Stop);
        f.runtime.fail(RuntimeOp::RemoveImage);

        f.proxy.run(None).await.unwrap();
        let calls = f.runtime.calls();
        let order: Vec<&str> = calls.iter().map(|c| c.split(' ').next().unwrap_or("")).collect();
        assert_eq!(order, vec!["stop", "rm", "rmi", "build", "run"]);
        assert!(f.proxy.dir.join("Dockerfile").is_file());
        assert_eq!(f.runtime.container_state(PROXY_CONTAINER).as_deref(), Some("running"));

        // Nothing pending right after a fresh run.
        assert!(!f.proxy.apply_pending().await.unwrap());
    }
}
