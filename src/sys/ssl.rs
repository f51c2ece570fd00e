use std::fs as std_fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, ShimError};
use crate::sys::nginx::validate_domain_format;
use crate::sys::secrets::PrivateKey;

pub const CERT_FILE: &str = "crt";
pub const KEY_FILE: &str = "key";

// ==============================================================================
// Certificate tree consumed (bind-mounted) by the proxy container
// ==============================================================================

pub struct CertificateStore {
    // 🛡️ SLA: Strict Type to prevent path traversal
    root: PathBuf,
}

impl CertificateStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drops every previously materialized certificate and recreates an empty root.
    pub async fn wipe(&self) -> Result<()> {
        match tokio_fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio_fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Writes `<root>/<domain>/{crt,key}`, both owner read/write only.
    pub async fn install(&self, domain: &str, cert_pem: &str, key: &PrivateKey) -> Result<PathBuf> {
        // 1. 🛡️ Zero-Trust Path Traversal Shield
        validate_domain_format(domain).map_err(ShimError::InvalidDomain)?;

        let domain_path = self.root.join(domain);
        tokio_fs::create_dir_all(&domain_path).await?;

        // 2. 🛡️ Locked down from inception: mode is applied at open, not after
        write_private(&domain_path.join(CERT_FILE), cert_pem).await?;

        // 🚨 The plaintext key never crosses an `.await`: plain std I/O inside the closure.
        let key_path = domain_path.join(KEY_FILE);
        let written = key.use_secret(|pem| -> std::io::Result<()> {
            let mut file = private_options().open(&key_path)?;
            file.write_all(pem.as_bytes())?;
            file.sync_all()
        });

        if let Err(e) = written {
            // Never leave a certificate without its key behind.
            let _ = tokio_fs::remove_dir_all(&domain_path).await;
            return Err(e.into());
        }
        Ok(domain_path)
    }
}

fn private_options() -> std_fs::OpenOptions {
    let mut opts = std_fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600); // rw-------
    opts
}

async fn write_private(path: &Path, content: &str) -> Result<()> {
    let mut file = tokio_fs::OpenOptions::from(private_options()).open(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}
