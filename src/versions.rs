//! Known postgres-release versions and the PostgreSQL server they ship
//!
//! `versions.yml` maps release numbers to the `SELECT version()` prefix of the
//! bundled server and names the releases used as upgrade sources:
//!
//! ```yaml
//! versions:
//!   28: "PostgreSQL 9.6.8"
//!   30: "PostgreSQL 10.3"
//! old: 28
//! older: 22
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VersionsError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid versions YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid release version key: {0}")]
    InvalidKey(String),

    #[error("No release versions defined")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct VersionsFile {
    versions: serde_yaml::Mapping,
    #[serde(default)]
    old: Option<serde_yaml::Value>,
    #[serde(default)]
    older: Option<serde_yaml::Value>,
}

/// Parsed `versions.yml`
#[derive(Debug, Clone)]
pub struct PostgresReleaseVersions {
    /// Release number to server version string, ordered numerically
    versions: BTreeMap<u32, String>,
    old: Option<u32>,
    older: Option<u32>,
}

fn key_to_u32(value: &serde_yaml::Value) -> Result<u32, VersionsError> {
    match value {
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| VersionsError::InvalidKey(n.to_string())),
        serde_yaml::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| VersionsError::InvalidKey(s.clone())),
        other => Err(VersionsError::InvalidKey(format!("{:?}", other))),
    }
}

impl PostgresReleaseVersions {
    /// Parse a versions document
    pub fn parse(data: &str) -> Result<Self, VersionsError> {
        let file: VersionsFile = serde_yaml::from_str(data)?;

        let mut versions = BTreeMap::new();
        for (key, value) in &file.versions {
            let server = match value {
                serde_yaml::Value::String(s) => s.clone(),
                other => serde_yaml::to_string(other)?.trim().to_string(),
            };
            versions.insert(key_to_u32(key)?, server);
        }
        if versions.is_empty() {
            return Err(VersionsError::Empty);
        }

        Ok(Self {
            versions,
            old: file.old.as_ref().map(key_to_u32).transpose()?,
            older: file.older.as_ref().map(key_to_u32).transpose()?,
        })
    }

    /// Read and parse a versions file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VersionsError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&data)
    }

    /// Highest known release number
    pub fn latest_version(&self) -> u32 {
        self.versions.keys().next_back().copied().unwrap_or_default()
    }

    pub fn old_version(&self) -> Option<u32> {
        self.old
    }

    pub fn older_version(&self) -> Option<u32> {
        self.older
    }

    /// Server version string shipped by a release, empty when unknown
    pub fn postgresql_version(&self, release: u32) -> &str {
        self.versions
            .get(&release)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Release numbers in ascending order
    pub fn releases(&self) -> impl Iterator<Item = u32> + '_ {
        self.versions.keys().copied()
    }

    /// Whether moving from `release` to a server reporting `current` crosses a major version
    pub fn is_major(&self, current: &str, release: u32) -> bool {
        major_of(current) != major_of(self.postgresql_version(release))
    }
}

/// Major component of a `PostgreSQL x.y.z` string
///
/// Before 10 the major version is `x.y`; from 10 on it is `x`.
pub fn major_of(version: &str) -> String {
    let number = version
        .trim()
        .strip_prefix("PostgreSQL")
        .unwrap_or(version)
        .split_whitespace()
        .next()
        .unwrap_or_default();
    let mut parts = number.split('.');
    let first = parts.next().unwrap_or_default();
    match first.parse::<u32>() {
        Ok(n) if n < 10 => match parts.next() {
            Some(second) => format!("{}.{}", first, second),
            None => first.to_string(),
        },
        _ => first.to_string(),
    }
}
