//! Declared vs observed server state
//!
//! Each check returns the first mismatch it finds. Roles are checked in two
//! passes so a missing or extra role is reported before any permission
//! difference.

use async_trait::async_trait;
use chrono::DateTime;
use serde_yaml::Value;
use thiserror::Error;

use crate::postgres::{PgData, PgError, PgOutputData, PgRole};
use crate::properties::{PgDbProperties, PgProperties};

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Database {0} has not been created")]
    MissingDatabase(String),

    #[error("Extension {extension} has not been created in database {database}")]
    MissingExtension { extension: String, database: String },

    #[error("Extra database {0} has been created")]
    ExtraDatabase(String),

    #[error("Extra extension {extension} has been created in database {database}")]
    ExtraExtension { extension: String, database: String },

    #[error("Role {0} has not been created")]
    MissingRole(String),

    #[error("Extra role {0} has been created")]
    ExtraRole(String),

    #[error("Incorrect permissions for role {0}")]
    IncorrectRolePermission(String),

    #[error("Incorrect value for setting {0}")]
    IncorrectSetting(String),

    #[error("Setting {0} is not present")]
    MissingSetting(String),

    #[error("Expected PostgreSQL version {expected}, found {actual}")]
    WrongVersion { expected: String, actual: String },

    #[error(transparent)]
    Database(#[from] PgError),
}

pub type Result<T, E = ValidationError> = std::result::Result<T, E>;

/// Questions only the live server can answer
#[async_trait]
pub trait ServerInspector: Send + Sync {
    /// Normalise a date through the server's `timestamptz` parser
    async fn convert_to_postgres_date(&self, input: &str) -> Result<String, PgError>;

    async fn get_postgresql_version(&self) -> Result<String, PgError>;
}

#[async_trait]
impl ServerInspector for PgData {
    async fn convert_to_postgres_date(&self, input: &str) -> Result<String, PgError> {
        PgData::convert_to_postgres_date(self, input).await
    }

    async fn get_postgresql_version(&self) -> Result<String, PgError> {
        PgData::get_postgresql_version(self).await
    }
}

/// What the release creates without being asked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorDefaults {
    /// Extensions in every declared database
    pub database_extensions: Vec<String>,
    pub citext_extension: String,
    pub statement_stats_extension: String,
    /// Databases that always exist, with their extensions
    pub system_databases: Vec<(String, Vec<String>)>,
    pub system_roles: Vec<String>,
    pub system_role_prefix: String,
}

impl Default for ValidatorDefaults {
    fn default() -> Self {
        Self {
            database_extensions: vec!["pgcrypto".to_string(), "plpgsql".to_string()],
            citext_extension: "citext".to_string(),
            statement_stats_extension: "pg_stat_statements".to_string(),
            system_databases: vec![("postgres".to_string(), vec!["plpgsql".to_string()])],
            system_roles: vec!["vcap".to_string()],
            system_role_prefix: "pg_".to_string(),
        }
    }
}

impl ValidatorDefaults {
    fn is_system_role(&self, name: &str) -> bool {
        self.system_roles.iter().any(|r| r == name) || name.starts_with(&self.system_role_prefix)
    }

    fn is_system_database(&self, name: &str) -> bool {
        self.system_databases.iter().any(|(db, _)| db == name)
    }
}

pub struct Validator<'a> {
    pub manifest_props: PgProperties,
    pub postgres_data: PgOutputData,
    pub inspector: &'a dyn ServerInspector,
    /// Expected `version()` prefix; empty skips the check
    pub postgresql_version: String,
    pub defaults: ValidatorDefaults,
}

impl<'a> Validator<'a> {
    pub fn new(
        manifest_props: PgProperties,
        postgres_data: PgOutputData,
        inspector: &'a dyn ServerInspector,
        postgresql_version: impl Into<String>,
    ) -> Self {
        Self {
            manifest_props,
            postgres_data,
            inspector,
            postgresql_version: postgresql_version.into(),
            defaults: ValidatorDefaults::default(),
        }
    }

    fn expected_extensions(&self, db: &PgDbProperties) -> Vec<String> {
        let mut extensions = self.defaults.database_extensions.clone();
        if db.citext {
            extensions.push(self.defaults.citext_extension.clone());
        }
        if self.manifest_props.collect_statement_stats {
            extensions.push(self.defaults.statement_stats_extension.clone());
        }
        extensions
    }

    fn check_extensions(&self, database: &str, expected: &[String]) -> Result<()> {
        let observed = self
            .postgres_data
            .database(database)
            .ok_or_else(|| ValidationError::MissingDatabase(database.to_string()))?;

        if let Some(missing) = expected.iter().find(|ext| !observed.has_extension(ext)) {
            return Err(ValidationError::MissingExtension {
                extension: missing.clone(),
                database: database.to_string(),
            });
        }
        if let Some(extra) = observed
            .extensions
            .iter()
            .find(|ext| !expected.contains(&ext.name))
        {
            return Err(ValidationError::ExtraExtension {
                extension: extra.name.clone(),
                database: database.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_databases(&self) -> Result<()> {
        for db in &self.manifest_props.databases {
            self.check_extensions(&db.name, &self.expected_extensions(db))?;
        }
        for (name, extensions) in &self.defaults.system_databases {
            if self.postgres_data.database(name).is_some() {
                self.check_extensions(name, extensions)?;
            }
        }
        if let Some(extra) = self.postgres_data.databases.iter().find(|observed| {
            !self.defaults.is_system_database(&observed.name)
                && !self
                    .manifest_props
                    .databases
                    .iter()
                    .any(|db| db.name == observed.name)
        }) {
            return Err(ValidationError::ExtraDatabase(extra.name.clone()));
        }
        Ok(())
    }

    /// Compare one declared permission against the observed role
    async fn permission_matches(&self, permission: &str, role: &PgRole) -> Result<bool> {
        let permission = permission.trim();
        let upper = permission.to_ascii_uppercase();
        let matches = match upper.as_str() {
            "SUPERUSER" => role.superuser,
            "NOSUPERUSER" => !role.superuser,
            "CREATEDB" => role.create_db,
            "NOCREATEDB" => !role.create_db,
            "CREATEROLE" => role.create_role,
            "NOCREATEROLE" => !role.create_role,
            "INHERIT" => role.inherit,
            "NOINHERIT" => !role.inherit,
            "REPLICATION" => role.replication,
            "NOREPLICATION" => !role.replication,
            "LOGIN" => role.can_login,
            "NOLOGIN" => !role.can_login,
            _ => {
                if let Some(limit) = upper.strip_prefix("CONNECTION LIMIT ") {
                    parse_connection_limit(limit) == Some(role.conn_limit)
                } else if upper.starts_with("VALID UNTIL ") {
                    let declared = permission
                        .get("VALID UNTIL ".len()..)
                        .unwrap_or_default()
                        .trim();
                    let normalised = self.inspector.convert_to_postgres_date(declared).await?;
                    match &role.valid_until {
                        Some(observed) => same_instant(&normalised, observed),
                        None => false,
                    }
                } else {
                    tracing::warn!(permission, role = %role.name, "Unknown role permission");
                    false
                }
            }
        };
        Ok(matches)
    }

    pub async fn validate_roles(&self) -> Result<()> {
        for declared in &self.manifest_props.roles {
            if self.postgres_data.role(&declared.name).is_none() {
                return Err(ValidationError::MissingRole(declared.name.clone()));
            }
        }
        if let Some(extra) = self.postgres_data.roles.iter().find(|observed| {
            !self.defaults.is_system_role(&observed.name)
                && !self
                    .manifest_props
                    .roles
                    .iter()
                    .any(|r| r.name == observed.name)
        }) {
            return Err(ValidationError::ExtraRole(extra.name.clone()));
        }

        for declared in &self.manifest_props.roles {
            let Some(observed) = self.postgres_data.role(&declared.name) else {
                continue;
            };
            for permission in &declared.permissions {
                if !self.permission_matches(permission, observed).await? {
                    tracing::debug!(role = %declared.name, permission = %permission, "Permission mismatch");
                    return Err(ValidationError::IncorrectRolePermission(declared.name.clone()));
                }
            }
        }
        Ok(())
    }

    fn check_setting(&self, name: &str, expected: &str) -> Result<()> {
        match self.postgres_data.settings.get(name) {
            None => Err(ValidationError::MissingSetting(name.to_string())),
            Some(actual) if actual != expected => {
                tracing::debug!(setting = name, expected, actual = %actual, "Setting mismatch");
                Err(ValidationError::IncorrectSetting(name.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    pub fn validate_settings(&self) -> Result<()> {
        let props = &self.manifest_props;
        self.check_setting("port", &props.port.to_string())?;
        self.check_setting("max_connections", &props.max_connections.to_string())?;
        self.check_setting("log_line_prefix", &props.log_line_prefix)?;

        if props.collect_statement_stats
            && let Some(libraries) = self.postgres_data.settings.get("shared_preload_libraries")
            && !libraries
                .split(',')
                .any(|l| l.trim() == self.defaults.statement_stats_extension)
        {
            return Err(ValidationError::IncorrectSetting(
                "shared_preload_libraries".to_string(),
            ));
        }

        for (name, value) in &props.additional_config {
            self.check_setting(name, &setting_string(value))?;
        }
        Ok(())
    }

    pub async fn validate_postgresql_version(&self) -> Result<()> {
        if self.postgresql_version.is_empty() {
            return Ok(());
        }
        let actual = self.inspector.get_postgresql_version().await?;
        if !actual.starts_with(&self.postgresql_version) {
            return Err(ValidationError::WrongVersion {
                expected: self.postgresql_version.clone(),
                actual,
            });
        }
        Ok(())
    }

    pub async fn validate_all(&self) -> Result<()> {
        self.validate_databases()?;
        self.validate_roles().await?;
        self.validate_settings()?;
        self.validate_postgresql_version().await
    }

    /// Whether every database's tables match those in `after`
    pub fn compare_tables_to(&self, after: &PgOutputData) -> bool {
        self.postgres_data.databases.len() == after.databases.len()
            && self.postgres_data.databases.iter().all(|before| {
                after
                    .database(&before.name)
                    .is_some_and(|db| db.tables == before.tables)
            })
    }
}

/// `"20"` of `CONNECTION LIMIT 20`
pub fn parse_connection_limit(input: &str) -> Option<i32> {
    input.trim().parse().ok()
}

fn same_instant(a: &str, b: &str) -> bool {
    match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// How `pg_settings` reports a configured value
fn setting_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "on".to_string(),
        Value::Bool(false) => "off".to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
