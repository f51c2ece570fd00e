// src/main.rs

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use bcms_shim::config::ShimConfig;
use bcms_shim::protocol::KeyRing;
use bcms_shim::sys::cloud_http::HttpCloudTransport;
use bcms_shim::sys::stats::SysinfoStats;
use bcms_shim::sys::DockerCli;
use bcms_shim::Shim;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment (SLA Layer)
    // ==============================================================================

    init_tracing();
    let config = ShimConfig::load()?;

    // Key slots are read once at boot; a missing license dir simply means no
    // instance can exchange envelopes yet.
    let keys = KeyRing::default();
    let licenses = keys.load_dir(&config.license_dir).await?;
    info!(licenses, dir = %config.license_dir.display(), "License key slots loaded");

    // ==============================================================================
    // 2. Dependency Injection
    // ==============================================================================

    let transport = Arc::new(HttpCloudTransport::new(&config.cloud_origin)?);
    let shim = Shim::new(
        config,
        Arc::new(DockerCli::default()),
        transport,
        Arc::new(SysinfoStats),
        keys,
    )?;

    // ==============================================================================
    // 3. Boot, drivers, graceful shutdown
    // ==============================================================================

    shim.boot().await?;
    let drivers = shim.spawn_drivers();
    info!(
        drivers = drivers.len(),
        storage = %shim.config().storage_dir.display(),
        "⚙️ BCMS shim running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    drivers.shutdown().await;

    Ok(())
}

/// `RUST_LOG` filtering (default `info`); `BCMS_LOG_JSON=true` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("BCMS_LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
