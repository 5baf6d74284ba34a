//! PostgreSQL access for scenarios
//!
//! Server state is read through queries wrapped in `row_to_json` and decoded
//! into the types below, which are also the observed side of validation.

pub mod client;
pub mod load;
pub mod sql;
pub mod tls;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::{PgCommon, PgConn, PgData, User};
pub use load::LoadType;
pub use tls::SslMode;

pub const NO_CONNECTION_AVAILABLE_MSG: &str = "No connections available";
pub const MISSING_DB_ADDRESS_MSG: &str = "Database address not specified";
pub const MISSING_DB_PORT_MSG: &str = "Database port not specified";
pub const MISSING_DEFAULT_USER_MSG: &str = "Default user not specified";
pub const MISSING_DEFAULT_PASSWORD_MSG: &str = "Default password not specified";

#[derive(Error, Debug)]
pub enum PgError {
    #[error("{0}")]
    Driver(#[from] tokio_postgres::Error),

    /// Server certificate rejected during the TLS handshake
    #[error("x509: {0}")]
    Certificate(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("{}", MISSING_DB_ADDRESS_MSG)]
    MissingAddress,

    #[error("{}", MISSING_DB_PORT_MSG)]
    MissingPort,

    #[error("{}", MISSING_DEFAULT_USER_MSG)]
    MissingUser,

    #[error("{}", MISSING_DEFAULT_PASSWORD_MSG)]
    MissingPassword,

    #[error("{}", NO_CONNECTION_AVAILABLE_MSG)]
    NoConnection,

    #[error("Invalid query result: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Query returned no rows: {0}")]
    EmptyResult(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = PgError> = std::result::Result<T, E>;

/// A row of `pg_settings`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgSetting {
    pub name: String,
    pub setting: String,
    pub vartype: String,
}

/// A row of `pg_roles`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgRole {
    #[serde(rename = "rolname")]
    pub name: String,
    #[serde(rename = "rolsuper")]
    pub superuser: bool,
    #[serde(rename = "rolinherit")]
    pub inherit: bool,
    #[serde(rename = "rolcreaterole")]
    pub create_role: bool,
    #[serde(rename = "rolcreatedb")]
    pub create_db: bool,
    #[serde(rename = "rolcanlogin")]
    pub can_login: bool,
    #[serde(rename = "rolreplication")]
    pub replication: bool,
    #[serde(rename = "rolconnlimit")]
    pub conn_limit: i32,
    #[serde(rename = "rolvaliduntil")]
    pub valid_until: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgDatabaseExtension {
    #[serde(rename = "extname")]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgTableColumn {
    pub column_name: String,
    pub data_type: String,
    #[serde(rename = "ordinal_position")]
    pub position: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgCount {
    #[serde(rename = "count")]
    pub num: i64,
}

/// A user table with its columns and row count
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgTable {
    #[serde(rename = "schemaname")]
    pub schema_name: String,
    #[serde(rename = "tablename")]
    pub table_name: String,
    #[serde(rename = "tableowner", default)]
    pub table_owner: String,
    #[serde(skip_deserializing, default)]
    pub columns: Vec<PgTableColumn>,
    #[serde(skip_deserializing, default)]
    pub row_count: PgCount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgDatabase {
    #[serde(rename = "datname")]
    pub name: String,
    #[serde(skip_deserializing, default)]
    pub extensions: Vec<PgDatabaseExtension>,
    #[serde(skip_deserializing, default)]
    pub tables: Vec<PgTable>,
}

impl PgDatabase {
    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e.name == name)
    }
}

/// Snapshot of a server's roles, databases and settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgOutputData {
    pub roles: Vec<PgRole>,
    pub databases: Vec<PgDatabase>,
    pub settings: BTreeMap<String, String>,
}

impl PgOutputData {
    /// Independent copy, unaffected by later changes to `self`
    pub fn copy_data(&self) -> Self {
        self.clone()
    }

    pub fn database(&self, name: &str) -> Option<&PgDatabase> {
        self.databases.iter().find(|db| db.name == name)
    }

    pub fn role(&self, name: &str) -> Option<&PgRole> {
        self.roles.iter().find(|role| role.name == name)
    }
}
