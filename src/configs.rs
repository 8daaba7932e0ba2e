use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IcpError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "icp-admin.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub defaults: IssuanceDefaults,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            catalog_path: default_catalog_path(),
            backup_dir: default_backup_dir(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("ca")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("ca/catalog.json")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolchainConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_digest")]
    pub digest: String,
    #[serde(default = "default_key_bits")]
    pub key_bits: u32,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            digest: default_digest(),
            key_bits: default_key_bits(),
        }
    }
}

impl ToolchainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_program() -> PathBuf {
    PathBuf::from("openssl")
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_digest() -> String {
    "sha256".to_string()
}

fn default_key_bits() -> u32 {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssuanceDefaults {
    #[serde(default = "default_root_validity")]
    pub root_validity_days: u32,
    #[serde(default = "default_ca_validity")]
    pub ca_validity_days: u32,
    #[serde(default = "default_certificate_validity")]
    pub certificate_validity_days: u32,
    #[serde(default = "default_crl_validity")]
    pub crl_validity_days: u32,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub crl_base_uri: String,
    #[serde(default)]
    pub cps_uri: String,
    #[serde(default)]
    pub policy_oids: Vec<String>,
}

impl Default for IssuanceDefaults {
    fn default() -> Self {
        Self {
            root_validity_days: default_root_validity(),
            ca_validity_days: default_ca_validity(),
            certificate_validity_days: default_certificate_validity(),
            crl_validity_days: default_crl_validity(),
            country: default_country(),
            crl_base_uri: String::new(),
            cps_uri: String::new(),
            policy_oids: Vec::new(),
        }
    }
}

impl IssuanceDefaults {
    /// CRL publication URI for a CA, derived from `crl_base_uri`.
    ///
    /// Empty when no base URI is configured.
    pub fn crl_uri_for(&self, ca_name: &str) -> String {
        if self.crl_base_uri.is_empty() {
            return String::new();
        }
        format!("{}/{}.crl", self.crl_base_uri.trim_end_matches('/'), ca_name)
    }
}

fn default_root_validity() -> u32 {
    7300 // 20 years
}

fn default_ca_validity() -> u32 {
    3650
}

fn default_certificate_validity() -> u32 {
    2190
}

fn default_crl_validity() -> u32 {
    7
}

fn default_country() -> String {
    "BR".to_string()
}

/// Relying-party side: CRL retrieval during validation.
#[derive(Debug, Deserialize, Clone)]
pub struct TrustConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl TrustConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|e| {
            IcpError::Configuration(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&config_str).map_err(|e| {
            IcpError::Configuration(format!(
                "failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load configuration with default path (icp-admin.toml), falling back to
    /// built-in defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::from_file(DEFAULT_CONFIG_PATH)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.storage.base_dir, PathBuf::from("ca"));
        assert_eq!(config.toolchain.timeout_secs, 120);
        assert_eq!(config.toolchain.program, PathBuf::from("openssl"));
        assert_eq!(config.defaults.certificate_validity_days, 2190);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.trust.fetch_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [toolchain]
            timeout_secs = 30

            [defaults]
            crl_base_uri = "http://pki.example.br/crl/"
            policy_oids = ["2.16.76.1.2.1.1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.toolchain.timeout(), Duration::from_secs(30));
        assert_eq!(config.toolchain.digest, "sha256");
        assert_eq!(
            config.defaults.crl_uri_for("AC-Test"),
            "http://pki.example.br/crl/AC-Test.crl"
        );
        assert_eq!(config.defaults.policy_oids.len(), 1);
    }

    #[test]
    fn crl_uri_empty_without_base() {
        assert_eq!(IssuanceDefaults::default().crl_uri_for("R"), "");
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = AppConfig::from_file("/nonexistent/icp-admin.toml").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
