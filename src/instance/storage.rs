// src/instance/storage.rs

use std::collections::HashSet;
use std::fs as std_fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::model::{CodeCategory, CodeItem, CodeUpload, Instance};
use crate::error::{Result, ShimError};
use crate::sys::secrets::InstanceSecret;

pub const RECORD_FILE: &str = "container.json";
pub const SECRET_FILE: &str = "shim.json";
pub const DOCKERFILE: &str = "Dockerfile";
pub const LOGS_DIR: &str = "logs";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretDescriptor {
    code: String,
    local: bool,
    instance_id: String,
}

// ==============================================================================
// storage/<id>/{container.json, shim.json, Dockerfile, functions, events, jobs, logs}
// ==============================================================================

pub struct InstanceStorage {
    root: PathBuf,
}

impl InstanceStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn category_dir(&self, id: &str, category: CodeCategory) -> PathBuf {
        self.dir(id).join(category.dir_name())
    }

    /// Creates the per-category directories and the bootstrap Dockerfile.
    pub async fn prepare(&self, id: &str, image: &str) -> Result<()> {
        let dir = self.dir(id);
        for category in CodeCategory::ALL {
            tokio_fs::create_dir_all(dir.join(category.dir_name())).await?;
        }
        tokio_fs::create_dir_all(dir.join(LOGS_DIR)).await?;
        tokio_fs::write(dir.join(DOCKERFILE), format!("FROM {image}\n")).await?;
        Ok(())
    }

    pub async fn write_record(&self, instance: &Instance) -> Result<()> {
        let json = serde_json::to_vec_pretty(instance)?;
        write_atomic(&self.dir(&instance.id).join(RECORD_FILE), &json).await
    }

    /// Persists `{code, local: false, instanceId}`.
    pub async fn write_secret(&self, id: &str, secret: &InstanceSecret) -> Result<()> {
        let descriptor = secret.use_secret(|code| SecretDescriptor {
            code: code.to_string(),
            local: false,
            instance_id: id.to_string(),
        });
        let json = serde_json::to_vec(&descriptor)?;
        write_atomic(&self.dir(id).join(SECRET_FILE), &json).await
    }

    pub async fn read_secret(&self, id: &str) -> Result<Option<InstanceSecret>> {
        let raw = match tokio_fs::read(self.dir(id).join(SECRET_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let descriptor: SecretDescriptor = serde_json::from_slice(&raw)?;
        Ok(Some(InstanceSecret::new(descriptor.code)))
    }

    /// Every readable `*/container.json` under the root. Unreadable records are
    /// skipped with a warning so one corrupt tenant never blocks the others.
    pub async fn read_records(&self) -> Result<Vec<Instance>> {
        let mut entries = match tokio_fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(RECORD_FILE);
            let raw = match tokio_fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read instance record");
                    continue;
                }
            };
            match serde_json::from_slice::<Instance>(&raw) {
                Ok(instance) => records.push(instance),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed instance record"),
            }
        }
        Ok(records)
    }

    /// Full replace of one category. Every item is decoded and written into a
    /// staging dir first, which is then swapped in by rename: on error the
    /// previous set stays on disk untouched.
    pub async fn replace_category(
        &self,
        id: &str,
        category: CodeCategory,
        uploads: &[CodeUpload],
    ) -> Result<Vec<CodeItem>> {
        let mut names = HashSet::with_capacity(uploads.len());
        let mut decoded = Vec::with_capacity(uploads.len());
        for upload in uploads {
            validate_file_stem(&upload.name)?;
            if !names.insert(upload.name.as_str()) {
                return Err(ShimError::InvalidRequest(format!(
                    "{}/{}: duplicate code item name",
                    category.dir_name(),
                    upload.name
                )));
            }
            let code = BASE64.decode(upload.code.trim()).map_err(|e| {
                ShimError::InvalidRequest(format!("{}/{}: code is not base64: {e}", category.dir_name(), upload.name))
            })?;
            decoded.push((upload.item(), code));
        }

        let dir = self.category_dir(id, category);
        let staging = self.dir(id).join(format!(".{}.staging", category.dir_name()));
        let retired = self.dir(id).join(format!(".{}.retired", category.dir_name()));
        remove_dir_if_present(&staging).await?;
        remove_dir_if_present(&retired).await?;

        // Non-recursive: a removed instance must not be brought back to life.
        tokio_fs::create_dir(&staging).await?;
        let mut items = Vec::with_capacity(decoded.len());
        for (item, code) in decoded {
            if let Err(e) = tokio_fs::write(staging.join(format!("{}.js", item.name)), code).await {
                let _ = tokio_fs::remove_dir_all(&staging).await;
                return Err(e.into());
            }
            items.push(item);
        }

        let had_previous = match tokio_fs::rename(&dir, &retired).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                let _ = tokio_fs::remove_dir_all(&staging).await;
                return Err(e.into());
            }
        };
        if let Err(e) = tokio_fs::rename(&staging, &dir).await {
            if had_previous {
                let _ = tokio_fs::rename(&retired, &dir).await;
            }
            let _ = tokio_fs::remove_dir_all(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = remove_dir_if_present(&retired).await {
            warn!(path = %retired.display(), error = %e, "Failed to clean up retired code dir");
        }
        Ok(items)
    }

    /// Sorted file stems currently on disk for a category.
    pub async fn list_category(&self, id: &str, category: CodeCategory) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio_fs::read_dir(self.category_dir(id, category)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "js") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn log_path(&self, id: &str, date: chrono::NaiveDate) -> PathBuf {
        self.dir(id)
            .join(LOGS_DIR)
            .join(format!("{}.log", date.format("%Y-%-m-%-d")))
    }

    pub async fn append_log(&self, id: &str, date: chrono::NaiveDate, line: &str) -> Result<()> {
        let path = self.log_path(id, date);
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }
        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        remove_dir_if_present(&self.dir(id)).await
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<()> {
    match tokio_fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `<name>.js` has to fit in a single path component.
const MAX_ITEM_NAME: usize = 128;

fn validate_file_stem(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_ITEM_NAME
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid {
        return Err(ShimError::InvalidRequest(format!("invalid code item name '{name}'")));
    }
    Ok(())
}

/// Writes through a sibling temp file and renames it over the target, owner-only.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut opts = std_fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600);

    let mut file = tokio_fs::OpenOptions::from(opts).open(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    tokio_fs::rename(&tmp, path).await?;
    Ok(())
}
