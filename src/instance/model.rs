// src/instance/model.rs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sys::secrets::{InstanceSecret, PrivateKey};

pub const CONTAINER_PREFIX: &str = "bcms-instance-";

/// Advisory telemetry. Any status may follow any other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    #[default]
    Unknown,
    Starting,
    Running,
    Restarting,
    Down,
    DownToError,
    SafeMode,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Unknown => "unknown",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Restarting => "restarting",
            InstanceStatus::Down => "down",
            InstanceStatus::DownToError => "down-to-error",
            InstanceStatus::SafeMode => "safe-mode",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSsl {
    pub cert: String,
    pub key: PrivateKey,
}

impl fmt::Debug for DomainSsl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainSsl")
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<DomainSsl>,
}

impl Domain {
    pub fn http(name: &str) -> Self {
        Self { name: name.to_string(), ssl: None }
    }
}

/// Code-carrying payload categories, each mirrored by `storage/<id>/<category>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeCategory {
    Functions,
    Events,
    Jobs,
}

impl CodeCategory {
    pub const ALL: [CodeCategory; 3] = [CodeCategory::Functions, CodeCategory::Events, CodeCategory::Jobs];

    pub fn dir_name(&self) -> &'static str {
        match self {
            CodeCategory::Functions => "functions",
            CodeCategory::Events => "events",
            CodeCategory::Jobs => "jobs",
        }
    }
}

/// What stays in memory once the code has been written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeItem {
    pub hash: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Inbound item; `code` is base64 and never retained after materialization.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUpload {
    pub hash: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

impl CodeUpload {
    pub fn item(&self) -> CodeItem {
        CodeItem {
            hash: self.hash.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl fmt::Debug for CodeUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUpload")
            .field("hash", &self.hash)
            .field("name", &self.name)
            .field("type", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceData {
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub functions: Vec<CodeItem>,
    #[serde(default)]
    pub events: Vec<CodeItem>,
    #[serde(default)]
    pub jobs: Vec<CodeItem>,
}

impl InstanceData {
    pub fn category(&self, category: CodeCategory) -> &[CodeItem] {
        match category {
            CodeCategory::Functions => &self.functions,
            CodeCategory::Events => &self.events,
            CodeCategory::Jobs => &self.jobs,
        }
    }

    pub fn set_category(&mut self, category: CodeCategory, items: Vec<CodeItem>) {
        match category {
            CodeCategory::Functions => self.functions = items,
            CodeCategory::Events => self.events = items,
            CodeCategory::Jobs => self.jobs = items,
        }
    }
}

/// Partial update; absent fields are left untouched, present ones replace wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataUpdate {
    pub domains: Option<Vec<Domain>>,
    pub functions: Option<Vec<CodeUpload>>,
    pub events: Option<Vec<CodeUpload>>,
    pub jobs: Option<Vec<CodeUpload>>,
}

impl DataUpdate {
    pub fn category(&self, category: CodeCategory) -> Option<&[CodeUpload]> {
        match category {
            CodeCategory::Functions => self.functions.as_deref(),
            CodeCategory::Events => self.events.as_deref(),
            CodeCategory::Jobs => self.jobs.as_deref(),
        }
    }
}

/// Which categories the request carried (not whether they changed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub domains: bool,
    pub functions: bool,
    pub events: bool,
    pub jobs: bool,
}

impl UpdateResult {
    pub(crate) fn mark(&mut self, category: CodeCategory) {
        match category {
            CodeCategory::Functions => self.functions = true,
            CodeCategory::Events => self.events = true,
            CodeCategory::Jobs => self.jobs = true,
        }
    }
}

/// One tenant. Persisted as `storage/<id>/container.json`; the secret lives
/// separately in `shim.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub port: u16,
    pub ip: String,
    pub status: InstanceStatus,
    pub previous_status: InstanceStatus,
    #[serde(skip)]
    pub secret: Option<InstanceSecret>,
    #[serde(default)]
    pub data: InstanceData,
    pub created_at: i64,
}

impl Instance {
    pub fn container_name(id: &str) -> String {
        format!("{CONTAINER_PREFIX}{id}")
    }

    pub fn serves(&self, domain: &str) -> bool {
        self.data.domains.iter().any(|d| d.name.eq_ignore_ascii_case(domain))
    }

    /// Moves the current status into `previous_status`, unconditionally.
    pub fn transition(&mut self, status: InstanceStatus) {
        self.previous_status = self.status;
        self.status = status;
    }
}

/// Instance ids become path segments and container names.
pub fn validate_instance_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > 64 {
        return Err(format!("instance id must be 1-64 characters, got {}", id.len()));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(format!("invalid characters in instance id '{id}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&InstanceStatus::DownToError).unwrap(), "\"down-to-error\"");
        assert_eq!(InstanceStatus::SafeMode.to_string(), "safe-mode");
        let parsed: InstanceStatus = serde_json::from_str("\"restarting\"").unwrap();
        assert_eq!(parsed, InstanceStatus::Restarting);
    }

    #[test]
    fn test_code_upload_debug_hides_code() {
        let upload = CodeUpload {
            hash: "h".into(),
            name: "fn".into(),
            kind: "js".into(),
            code: "c2VjcmV0".into(),
        };
        assert!(!format!("{upload:?}").contains("c2VjcmV0"));

        let ssl = DomainSsl { cert: "CERT".into(), key: PrivateKey::new("PRIVATE".into()) };
        assert!(!format!("{ssl:?}").contains("PRIVATE"));
    }

    #[test]
    fn test_data_update_accepts_partial_json() {
        let update: DataUpdate = serde_json::from_str(
            r#"{"domains":[{"name":"foo.example.com"}],"jobs":[{"hash":"1","name":"j","type":"cron","code":""}]}"#,
        )
        .unwrap();
        assert_eq!(update.domains.as_ref().map(Vec::len), Some(1));
        assert!(update.functions.is_none());
        assert_eq!(update.category(CodeCategory::Jobs).map(|j| j.len()), Some(1));
    }

    #[test]
    fn test_instance_id_validation() {
        assert!(validate_instance_id("abc123").is_ok());
        assert!(validate_instance_id("tenant_1-a").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("../etc").is_err());
        assert!(validate_instance_id("a b").is_err());
    }
}
