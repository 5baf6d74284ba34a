//! Connections to a deployed PostgreSQL server
//!
//! [`PgData`] keeps one connection per database it has touched. Connections
//! are looked up by database and optionally by user, so a certificate
//! authenticated connection and a password one can coexist.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_postgres::{Client, NoTls};

use super::load::{self, DEFAULT_TABLE_PREFIX, LoadType};
use super::sql;
use super::tls::{self, SslMode, TlsMaterial};
use super::{
    PgDatabase, PgDatabaseExtension, PgError, PgOutputData, PgRole, PgSetting, PgTable,
    PgTableColumn, PgCount, Result,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DATABASE: &str = "postgres";

/// Credentials of one database user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub password: String,
    /// PEM certificate presented when certificate authentication is on
    pub certificate: Option<String>,
    pub key: Option<String>,
}

impl User {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            certificate: None,
            key: None,
        }
    }

    fn client_cert(&self) -> Option<(String, String)> {
        match (&self.certificate, &self.key) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }
}

/// Connection parameters shared by every connection of a [`PgData`]
#[derive(Debug, Clone, Default)]
pub struct PgCommon {
    pub address: String,
    pub port: u16,
    pub ssl_mode: SslMode,
    /// PEM bundle used by the verifying SSL modes
    pub root_cert: Option<String>,
    pub def_user: User,
    pub admin_user: User,
    pub cert_user: User,
    pub use_cert_auth: bool,
}

impl PgCommon {
    fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(PgError::MissingAddress);
        }
        if self.port == 0 {
            return Err(PgError::MissingPort);
        }
        if self.def_user.name.is_empty() {
            return Err(PgError::MissingUser);
        }
        if self.def_user.password.is_empty() {
            return Err(PgError::MissingPassword);
        }
        Ok(())
    }

    /// User new connections authenticate as
    fn connect_user(&self) -> &User {
        if self.use_cert_auth {
            &self.cert_user
        } else {
            &self.def_user
        }
    }
}

/// An open connection to one database
pub struct PgConn {
    pub target_db: String,
    pub user: String,
    client: Client,
}

impl std::fmt::Debug for PgConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConn")
            .field("target_db", &self.target_db)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl PgConn {
    /// Run a read query, returning each row as a JSON value
    pub async fn run(&self, query: &str) -> Result<Vec<serde_json::Value>> {
        let rows = self.client.query(&sql::as_json_rows(query), &[]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, serde_json::Value>(0).map_err(PgError::from))
            .collect()
    }

    /// Run a read query and decode each row into `T`
    pub async fn run_as<T: DeserializeOwned>(&self, query: &str) -> Result<Vec<T>> {
        self.run(query)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(PgError::from))
            .collect()
    }

    async fn run_first<T: DeserializeOwned>(&self, query: &str) -> Result<T> {
        self.run_as(query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PgError::EmptyResult(query.to_string()))
    }

    /// Execute statements that return no rows
    pub async fn exec(&self, query: &str) -> Result<()> {
        self.client.batch_execute(query).await?;
        Ok(())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

#[derive(Deserialize)]
struct Version {
    version: String,
}

#[derive(Deserialize)]
struct ConvertedDate {
    timestamptz: String,
}

/// A server and the connections opened to it
#[derive(Debug)]
pub struct PgData {
    pub data: PgCommon,
    dbs: Vec<PgConn>,
}

impl PgData {
    /// Validate `props` and open the default connection to `postgres`
    pub async fn new(props: PgCommon) -> Result<Self> {
        props.validate()?;
        let mut pg = Self {
            data: props,
            dbs: Vec::new(),
        };
        pg.reconnect().await?;
        Ok(pg)
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.close_connections();
        let user = self.data.connect_user().clone();
        let conn = self.open_connection(DEFAULT_DATABASE, &user).await?;
        self.dbs.push(conn);
        Ok(())
    }

    /// Open a new connection; it is not registered with `self`
    pub async fn open_connection(&self, dbname: &str, user: &User) -> Result<PgConn> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.data.address)
            .port(self.data.port)
            .user(&user.name)
            .dbname(dbname)
            .connect_timeout(CONNECT_TIMEOUT);
        if !user.password.is_empty() {
            config.password(&user.password);
        }

        let material = TlsMaterial {
            root_cert: self.data.root_cert.clone(),
            client_cert: user.client_cert(),
        };
        let client = match tls::build_connector(self.data.ssl_mode, &material)? {
            None => {
                config.ssl_mode(tokio_postgres::config::SslMode::Disable);
                let (client, connection) = config.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::trace!(error = %e, "PostgreSQL connection closed");
                    }
                });
                client
            }
            Some(connector) => {
                config.ssl_mode(tokio_postgres::config::SslMode::Require);
                let (client, connection) = config
                    .connect(connector)
                    .await
                    .map_err(tls::classify_connect_error)?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::trace!(error = %e, "PostgreSQL TLS connection closed");
                    }
                });
                client
            }
        };

        tracing::debug!(
            address = %self.data.address,
            port = self.data.port,
            database = dbname,
            user = %user.name,
            sslmode = %self.data.ssl_mode,
            "PostgreSQL connection established"
        );
        Ok(PgConn {
            target_db: dbname.to_string(),
            user: user.name.clone(),
            client,
        })
    }

    pub fn default_connection(&self) -> Result<&PgConn> {
        self.dbs.first().ok_or(PgError::NoConnection)
    }

    pub fn db_connection(&self, dbname: &str) -> Result<&PgConn> {
        self.db_connection_for_user(dbname, None)
    }

    pub fn db_connection_for_user(&self, dbname: &str, user: Option<&str>) -> Result<&PgConn> {
        self.dbs
            .iter()
            .find(|conn| conn.target_db == dbname && user.is_none_or(|u| conn.user == u))
            .ok_or(PgError::NoConnection)
    }

    /// Registered connection to `dbname`, opening one if needed
    async fn connection_for(&mut self, dbname: &str) -> Result<&mut PgConn> {
        let index = match self.dbs.iter().position(|conn| conn.target_db == dbname) {
            Some(index) => index,
            None => {
                let user = self.data.connect_user().clone();
                let conn = self.open_connection(dbname, &user).await?;
                self.dbs.push(conn);
                self.dbs.len() - 1
            }
        };
        self.dbs.get_mut(index).ok_or(PgError::NoConnection)
    }

    /// Fresh connection to `postgres` as the admin user
    pub async fn get_superuser_connection(&self) -> Result<PgConn> {
        self.open_connection(DEFAULT_DATABASE, &self.data.admin_user)
            .await
    }

    /// Drop every open connection
    pub fn close_connections(&mut self) {
        if !self.dbs.is_empty() {
            tracing::debug!(count = self.dbs.len(), "Closing PostgreSQL connections");
        }
        self.dbs.clear();
    }

    /// Switch SSL mode and reconnect; `root_cert` is read from disk when given
    pub async fn change_ssl_mode(&mut self, mode: SslMode, root_cert: Option<&Path>) -> Result<()> {
        self.data.root_cert = match root_cert {
            Some(path) => Some(tokio::fs::read_to_string(path).await?),
            None => None,
        };
        self.data.ssl_mode = mode;
        self.reconnect().await
    }

    /// Set the identity used for certificate authentication
    pub fn set_cert_user_certificates(&mut self, name: &str, certificate: &str, key: &str) {
        self.data.cert_user = User {
            name: name.to_string(),
            password: String::new(),
            certificate: Some(certificate.to_string()),
            key: Some(key.to_string()),
        };
    }

    /// Toggle certificate authentication and reconnect
    pub async fn use_cert_authentication(&mut self, enabled: bool) -> Result<()> {
        self.data.use_cert_auth = enabled;
        self.reconnect().await
    }

    pub async fn read_all_settings(&self) -> Result<std::collections::BTreeMap<String, String>> {
        let rows: Vec<PgSetting> = self
            .default_connection()?
            .run_as(sql::GET_SETTINGS_QUERY)
            .await?;
        Ok(rows.into_iter().map(|s| (s.name, s.setting)).collect())
    }

    pub async fn list_roles(&self) -> Result<Vec<PgRole>> {
        self.default_connection()?
            .run_as(sql::LIST_ROLES_QUERY)
            .await
    }

    /// Non-template databases with their extensions and tables
    pub async fn list_databases(&mut self) -> Result<Vec<PgDatabase>> {
        let mut databases: Vec<PgDatabase> = self
            .default_connection()?
            .run_as(sql::LIST_DATABASES_QUERY)
            .await?;
        for database in &mut databases {
            database.extensions = self.list_database_extensions(&database.name).await?;
            database.tables = self.list_database_tables(&database.name).await?;
        }
        Ok(databases)
    }

    pub async fn list_database_extensions(&mut self, dbname: &str) -> Result<Vec<PgDatabaseExtension>> {
        self.connection_for(dbname)
            .await?
            .run_as(sql::LIST_DB_EXTENSIONS_QUERY)
            .await
    }

    pub async fn list_database_tables(&mut self, dbname: &str) -> Result<Vec<PgTable>> {
        let conn = self.connection_for(dbname).await?;
        let mut tables: Vec<PgTable> = conn.run_as(sql::LIST_TABLES_QUERY).await?;
        for table in &mut tables {
            table.columns = conn
                .run_as::<PgTableColumn>(&sql::list_table_columns_query(
                    &table.schema_name,
                    &table.table_name,
                ))
                .await?;
            table.row_count = conn
                .run_first::<PgCount>(&sql::count_table_rows_query(
                    &table.schema_name,
                    &table.table_name,
                ))
                .await?;
        }
        Ok(tables)
    }

    /// Let the server normalise a date; used to compare `VALID UNTIL` values
    pub async fn convert_to_postgres_date(&self, input: &str) -> Result<String> {
        let date: ConvertedDate = self
            .default_connection()?
            .run_first(&sql::convert_to_date_query(input))
            .await?;
        Ok(date.timestamptz)
    }

    pub async fn get_postgresql_version(&self) -> Result<String> {
        let version: Version = self
            .default_connection()?
            .run_first(sql::GET_VERSION_QUERY)
            .await?;
        Ok(version.version)
    }

    /// Settings, databases and roles of the server
    pub async fn get_data(&mut self) -> Result<PgOutputData> {
        let settings = self.read_all_settings().await?;
        let databases = self.list_databases().await?;
        let roles = self.list_roles().await?;
        Ok(PgOutputData {
            roles,
            databases,
            settings,
        })
    }

    pub async fn check_role_exist(&self, role: &str) -> Result<bool> {
        let rows = self
            .default_connection()?
            .run(&sql::role_exists_query(role))
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn check_table_exist(&mut self, table: &str, dbname: &str) -> Result<bool> {
        let rows = self
            .connection_for(dbname)
            .await?
            .run(&sql::table_exists_query(table))
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn drop_table(&mut self, dbname: &str, table: &str) -> Result<()> {
        self.connection_for(dbname)
            .await?
            .exec(&sql::drop_table_query(table))
            .await?;
        tracing::info!(database = dbname, table, "Dropped table");
        Ok(())
    }

    pub async fn create_and_populate_tables(&mut self, dbname: &str, load_type: LoadType) -> Result<()> {
        self.create_and_populate_tables_with_prefix(dbname, load_type, DEFAULT_TABLE_PREFIX)
            .await
    }

    pub async fn create_and_populate_tables_with_prefix(
        &mut self,
        dbname: &str,
        load_type: LoadType,
        prefix: &str,
    ) -> Result<()> {
        let conn = self.connection_for(dbname).await?;
        for table in load::sample_load(load_type, prefix) {
            load::load_table(conn.client_mut(), &table).await?;
        }
        tracing::info!(database = dbname, load = ?load_type, prefix, "Populated tables");
        Ok(())
    }
}
