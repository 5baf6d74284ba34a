//! Test-run configuration
//!
//! The suite is pointed at a BOSH director through a YAML file whose absolute
//! path is given in `$PGATS_CONFIG`. Fields left out of the file fall back to
//! the values of a local bosh-lite style director.
//!
//! ```yaml
//! bosh:
//!   target: 192.168.50.4
//!   username: admin
//!   password: admin
//!   director_ca_cert: |
//!     -----BEGIN CERTIFICATE-----
//! cloud_configs:
//!   default_azs: [z1]
//!   default_networks:
//!   - name: private
//!   default_persistent_disk_type: 10GB
//!   default_vm_type: m3.medium
//! postgres_release_version: latest
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the absolute path of the config file
pub const CONFIG_PATH_ENV: &str = "PGATS_CONFIG";

/// Environment variable overriding `postgres_release_version`
pub const RELEASE_VERSION_ENV: &str = "POSTGRES_RELEASE_VERSION";

/// Release version meaning "whatever the director already has as latest"
pub const LATEST_RELEASE: &str = "latest";

/// Expected PostgreSQL version meaning "the latest entry of versions.yml"
pub const CURRENT_POSTGRESQL: &str = "current";

pub const MISSING_CERTIFICATE_MSG: &str =
    "missing `director_ca_cert` - specify BOSH director CA certificate";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{}", MISSING_CERTIFICATE_MSG)]
    MissingCertificate,

    #[error("missing `{0}` - specify BOSH director {0}")]
    MissingField(&'static str),

    #[error("$PGATS_CONFIG {0:?} does not specify an absolute path to test config file")]
    IncorrectEnv(String),
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Top-level configuration of a test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgatsConfig {
    pub bosh: BoshConfig,
    #[serde(rename = "cloud_configs")]
    pub cloud_config: CloudConfig,
    pub postgres_release_version: String,
    /// Expected `SELECT version()` prefix of the deployed server, or `current`
    pub postgresql_version: String,
    /// Location of the release versions file
    pub versions_file: PathBuf,
}

impl Default for PgatsConfig {
    fn default() -> Self {
        Self {
            bosh: BoshConfig::default(),
            cloud_config: CloudConfig::default(),
            postgres_release_version: LATEST_RELEASE.to_string(),
            postgresql_version: CURRENT_POSTGRESQL.to_string(),
            versions_file: PathBuf::from("versions.yml"),
        }
    }
}

/// Director endpoint and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoshConfig {
    pub target: String,
    #[serde(alias = "client")]
    pub username: String,
    #[serde(alias = "client_secret")]
    pub password: String,
    #[serde(alias = "ca_cert")]
    pub director_ca_cert: String,
}

impl Default for BoshConfig {
    fn default() -> Self {
        Self {
            target: "192.168.50.4".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            director_ca_cert: String::new(),
        }
    }
}

impl BoshConfig {
    /// Director API URL; the target may be a bare host or a full URL
    pub fn director_url(&self) -> String {
        if self.target.starts_with("https://") || self.target.starts_with("http://") {
            self.target.clone()
        } else {
            format!("https://{}:25555", self.target)
        }
    }
}

/// Cloud-config values injected into every instance group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    #[serde(rename = "default_azs")]
    pub azs: Vec<String>,
    #[serde(rename = "default_networks")]
    pub networks: Vec<JobNetwork>,
    #[serde(rename = "default_persistent_disk_type")]
    pub persistent_disk_type: String,
    #[serde(rename = "default_vm_type")]
    pub vm_type: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            azs: vec!["z1".to_string()],
            networks: vec![JobNetwork {
                name: "private".to_string(),
                static_ips: Vec::new(),
                default: Vec::new(),
            }],
            persistent_disk_type: "10GB".to_string(),
            vm_type: "m3.medium".to_string(),
        }
    }
}

impl CloudConfig {
    /// Name of the first configured network, used to build BOSH DNS names
    pub fn primary_network(&self) -> &str {
        self.networks
            .first()
            .map(|n| n.name.as_str())
            .unwrap_or("default")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNetwork {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,
}

/// Parse a config document, applying defaults for omitted fields
pub fn parse_config(data: &str) -> Result<PgatsConfig> {
    let config: PgatsConfig = serde_yaml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

/// Read and parse the config file at `path`
pub fn load_config(path: impl AsRef<Path>) -> Result<PgatsConfig> {
    let data = std::fs::read_to_string(path.as_ref())?;
    parse_config(&data)
}

fn validate(config: &PgatsConfig) -> Result<()> {
    if config.bosh.director_ca_cert.is_empty() {
        return Err(ConfigError::MissingCertificate);
    }
    if config.bosh.target.is_empty() {
        return Err(ConfigError::MissingField("target"));
    }
    if config.bosh.username.is_empty() {
        return Err(ConfigError::MissingField("username"));
    }
    if config.bosh.password.is_empty() {
        return Err(ConfigError::MissingField("password"));
    }
    Ok(())
}

/// Validate a `$PGATS_CONFIG` value
pub fn config_path_from(value: Option<&str>) -> Result<PathBuf> {
    match value {
        Some(path) if path.starts_with('/') => Ok(PathBuf::from(path)),
        other => Err(ConfigError::IncorrectEnv(
            other.unwrap_or_default().to_string(),
        )),
    }
}

/// Resolve the config path from the environment
pub fn config_path() -> Result<PathBuf> {
    let value = std::env::var(CONFIG_PATH_ENV).ok();
    config_path_from(value.as_deref())
}

/// Load the config named by `$PGATS_CONFIG`, honouring `$POSTGRES_RELEASE_VERSION`
pub fn load_from_env() -> Result<PgatsConfig> {
    let path = config_path()?;
    let mut config = load_config(&path)?;
    if let Ok(version) = std::env::var(RELEASE_VERSION_ENV)
        && !version.is_empty()
    {
        config.postgres_release_version = version;
    }
    tracing::info!(
        path = %path.display(),
        target = %config.bosh.target,
        release = %config.postgres_release_version,
        "Loaded test configuration"
    );
    Ok(config)
}
