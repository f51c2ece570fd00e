// src/sys/cloud_http.rs

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, ShimError};
use crate::protocol::headers::HEADER_IID;
use crate::protocol::Envelope;
use crate::sys::traits::CloudTransport;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to the cloud service over plain HTTP(S); confidentiality and
/// authenticity come from the envelope, not the transport.
pub struct HttpCloudTransport {
    origin: String,
    client: reqwest::Client,
}

impl HttpCloudTransport {
    pub fn new(origin: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            origin: origin.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(&self, instance_id: &str, path: &str, body: &Envelope) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.origin, path);
        debug!(instance_id = %instance_id, url = %url, "POST to cloud");

        let response = self
            .client
            .post(&url)
            .header(HEADER_IID, instance_id)
            .json(body)
            .send()
            .await
            .map_err(|e| ShimError::Connectivity(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ShimError::Connectivity(format!("{url} answered {status}: {text}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl CloudTransport for HttpCloudTransport {
    async fn register(&self, instance_id: &str, body: &Envelope) -> Result<Envelope> {
        let response = self.post(instance_id, "/register", body).await?;
        Ok(response.json::<Envelope>().await?)
    }

    async fn send_stats(&self, instance_id: &str, channel: &str, body: &Envelope) -> Result<()> {
        self.post(instance_id, &format!("/conn/{channel}"), body).await?;
        Ok(())
    }
}
