// src/instance/health.rs

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::protocol::SecureMessaging;
use crate::sys::secrets::InstanceSecret;

pub const HEALTH_PATH: &str = "/api/shim/calls/health";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Deserialize)]
struct HealthReply {
    #[serde(default)]
    ok: bool,
}

/// Signed `POST /api/shim/calls/health` against an instance's private address.
pub struct HealthProbe {
    client: reqwest::Client,
}

impl Default for HealthProbe {
    fn default() -> Self {
        // Instances live on private addresses; never route probes through a proxy.
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl HealthProbe {
    /// `true` only for HTTP 200 carrying `{"ok": true}`. A refused connection is
    /// the normal "not up yet" answer and is only logged at debug level.
    pub async fn probe(
        &self,
        messaging: &SecureMessaging,
        instance_id: &str,
        ip: &str,
        port: u16,
        secret: &InstanceSecret,
    ) -> bool {
        let payload = json!({});
        let signed = secret.use_secret(|code| messaging.sign_headers(code.as_bytes(), &payload));
        let url = format!("http://{ip}:{port}{HEALTH_PATH}");

        let mut request = self.client.post(&url).timeout(PROBE_TIMEOUT).json(&payload);
        for (name, value) in signed.pairs() {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                debug!(instance_id = %instance_id, url = %url, "Instance unreachable");
                return false;
            }
            Err(e) => {
                warn!(instance_id = %instance_id, url = %url, error = %e, "Health probe failed");
                return false;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            warn!(instance_id = %instance_id, status = %response.status(), "Health probe answered non-200");
            return false;
        }
        match response.json::<HealthReply>().await {
            Ok(reply) => reply.ok,
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Health probe returned malformed body");
                false
            }
        }
    }
}
