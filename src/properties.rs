//! Declared PostgreSQL job properties
//!
//! The `postgres` job's `databases` block describes what the deployed server
//! should look like. It is read back out of the evaluated manifest and used
//! both to connect and as the expected side of validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use crate::manifest::Manifest;

pub const MISSING_MANDATORY_PROP_MSG: &str = "Mandatory property is missing";

#[derive(Error, Debug)]
pub enum PropertiesError {
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{}", MISSING_MANDATORY_PROP_MSG)]
    MissingMandatory,

    #[error("No properties found for job {0}")]
    JobNotFound(String),

    #[error("No roles declared")]
    NoRoles,
}

pub type Result<T, E = PropertiesError> = std::result::Result<T, E>;

/// The job's `properties` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub databases: PgProperties,
}

/// `databases` properties of the postgres job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgProperties {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<PgDbProperties>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<PgRoleProperties>,
    pub port: u16,
    pub max_connections: u32,
    pub log_line_prefix: String,
    #[serde(rename = "collect_statement_statistics")]
    pub collect_statement_stats: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monit_timeout: Option<u32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_config: BTreeMap<String, Value>,
}

impl Default for PgProperties {
    fn default() -> Self {
        Self {
            address: String::new(),
            databases: Vec::new(),
            roles: Vec::new(),
            port: 0,
            max_connections: 500,
            log_line_prefix: "%m: ".to_string(),
            collect_statement_stats: false,
            monit_timeout: None,
            additional_config: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgDbProperties {
    pub citext: bool,
    pub name: String,
    pub tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgRoleProperties {
    pub name: String,
    pub password: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Certificate common name mapped onto this role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
}

/// Parse a `properties` YAML document
///
/// Omitted fields take the release defaults; a missing or zero port is an error.
pub fn load_properties(data: &str) -> Result<Properties> {
    let value: Value = serde_yaml::from_str(data)?;
    properties_from_value(&value)
}

/// Build [`Properties`] from an already parsed `properties` section
pub fn properties_from_value(value: &Value) -> Result<Properties> {
    let databases = match value.get("databases") {
        None | Some(Value::Null) => PgProperties::default(),
        Some(section) => serde_yaml::from_value(section.clone())?,
    };
    if databases.port == 0 {
        return Err(PropertiesError::MissingMandatory);
    }
    Ok(Properties { databases })
}

impl Properties {
    /// Connection URL for the first declared role
    ///
    /// `address` overrides the declared address when given.
    pub fn postgres_url(&self, address: Option<&str>) -> Result<String> {
        let pg = &self.databases;
        let role = pg.roles.first().ok_or(PropertiesError::NoRoles)?;
        let address = address.unwrap_or(&pg.address);
        Ok(format!(
            "postgres://{}:{}@{}:{}/postgres?sslmode=disable",
            role.name, role.password, address, pg.port
        ))
    }
}

/// Raw job properties of an evaluated manifest, keyed by job name
#[derive(Debug, Clone, Default)]
pub struct ManifestProperties {
    jobs: Vec<(String, Value)>,
}

impl ManifestProperties {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let jobs = manifest
            .instance_groups()
            .filter_map(|group| group.get("jobs").and_then(Value::as_sequence))
            .flatten()
            .filter_map(|job| {
                let name = job.get("name").and_then(Value::as_str)?;
                let properties = job.get("properties")?;
                Some((name.to_string(), properties.clone()))
            })
            .collect();
        Self { jobs }
    }

    /// Parsed properties of every instance of `job`
    pub fn job_properties(&self, job: &str) -> Result<Vec<Properties>> {
        self.jobs
            .iter()
            .filter(|(name, _)| name == job)
            .map(|(_, value)| properties_from_value(value))
            .collect()
    }

    /// Properties of the first instance of `job`
    pub fn first_job_properties(&self, job: &str) -> Result<Properties> {
        self.job_properties(job)?
            .into_iter()
            .next()
            .ok_or_else(|| PropertiesError::JobNotFound(job.to_string()))
    }
}
