//! Crate-level error type
//!
//! Each layer carries its own error enum; this one aggregates them so
//! scenario code can use `?` across director, manifest and SQL calls.

use thiserror::Error;

use crate::config::ConfigError;
use crate::director::DirectorError;
use crate::manifest::ManifestError;
use crate::postgres::PgError;
use crate::properties::PropertiesError;
use crate::validator::ValidationError;
use crate::versions::VersionsError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `ConfigError`, `PgError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ConfigError(#[from] ConfigError),

    #[error(transparent)]
    ManifestError(#[from] ManifestError),

    #[error(transparent)]
    DirectorError(#[from] DirectorError),

    #[error(transparent)]
    PgError(#[from] PgError),

    #[error(transparent)]
    PropertiesError(#[from] PropertiesError),

    #[error(transparent)]
    ValidationError(#[from] ValidationError),

    #[error(transparent)]
    VersionsError(#[from] VersionsError),

    #[error("Bootstrap error: {0}")]
    BootstrapError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
