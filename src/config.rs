// src/config.rs

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got '{value}'")]
    Malformed {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("port range is empty: {from} > {to}")]
    EmptyPortRange { from: u16, to: u16 },
}

#[derive(Clone, Debug)]
pub struct ShimConfig {
    // 📂 Per-instance storage root: storage/<id>/{shim.json,functions,events,jobs,logs}
    pub storage_dir: PathBuf,

    // Local/dev deployments get predictable secrets and loopback addressing.
    pub local: bool,

    // 🛡️ SLA Boundary: ports handed out to instances
    pub port_from: u16,
    pub port_to: u16,

    pub instance_image: String,
    pub cloud_origin: String,
    pub license_dir: PathBuf,

    // Reverse proxy
    pub proxy_dir: PathBuf,
    pub proxy_template: Option<PathBuf>,
    pub proxy_excluded_suffixes: Vec<String>,

    pub health_interval: Duration,
}

impl ShimConfig {
    pub fn load() -> Result<Self, ConfigError> {
        // Numbers and flags are parsed strictly; a typo in the environment stops
        // the shim at boot instead of silently falling back to a default.
        let port_from = parse_var("BCMS_SHIM_PORT_FROM", 1280u16, "port number")?;
        let port_to = parse_var("BCMS_SHIM_PORT_TO", 1380u16, "port number")?;
        if port_from > port_to {
            return Err(ConfigError::EmptyPortRange { from: port_from, to: port_to });
        }

        let health_secs = parse_var("BCMS_HEALTH_INTERVAL_SECS", 15u64, "number of seconds")?;

        Ok(Self {
            storage_dir: PathBuf::from(
                env::var("BCMS_SHIM_STORAGE").unwrap_or_else(|_| "storage".to_string()),
            ),
            local: parse_var("BCMS_SHIM_LOCAL", false, "boolean")?,
            port_from,
            port_to,
            instance_image: env::var("BCMS_INSTANCE_IMAGE")
                .unwrap_or_else(|_| "becomes/cms-backend:latest".to_string()),
            cloud_origin: env::var("BCMS_CLOUD_ORIGIN")
                .unwrap_or_else(|_| "https://cloud.thebcms.com".to_string()),
            license_dir: PathBuf::from(
                env::var("BCMS_LICENSE_DIR").unwrap_or_else(|_| "licenses".to_string()),
            ),
            proxy_dir: PathBuf::from(
                env::var("BCMS_PROXY_DIR").unwrap_or_else(|_| "proxy".to_string()),
            ),
            proxy_template: env::var("BCMS_PROXY_TEMPLATE").ok().map(PathBuf::from),
            proxy_excluded_suffixes: env::var("BCMS_PROXY_EXCLUDE")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            health_interval: Duration::from_secs(health_secs),
        })
    }

    /// Defaults rooted at `base`, used by tests and local tooling.
    pub fn rooted_at(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            storage_dir: base.join("storage"),
            local: false,
            port_from: 1280,
            port_to: 1380,
            instance_image: "becomes/cms-backend:latest".to_string(),
            cloud_origin: "https://cloud.thebcms.com".to_string(),
            license_dir: base.join("licenses"),
            proxy_dir: base.join("proxy"),
            proxy_template: None,
            proxy_excluded_suffixes: Vec::new(),
            health_interval: Duration::from_secs(15),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Malformed { var, expected, value }),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list_drops_blanks() {
        assert_eq!(
            split_list(" .internal , ,.local,"),
            vec![".internal".to_string(), ".local".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_rooted_at_places_everything_under_base() {
        let config = ShimConfig::rooted_at("/tmp/shim");
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/shim/storage"));
        assert_eq!(config.proxy_dir, PathBuf::from("/tmp/shim/proxy"));
        assert!(config.port_from <= config.port_to);
    }
}
