//! SQL text used to inspect a server
//!
//! Read queries are wrapped with [`as_json_rows`] so each result row comes
//! back as a single JSON document.

pub const GET_SETTINGS_QUERY: &str = "SELECT * FROM pg_settings";
pub const LIST_ROLES_QUERY: &str = "SELECT * from pg_roles";
pub const LIST_DATABASES_QUERY: &str = "SELECT datname from pg_database where datistemplate=false";
pub const LIST_DB_EXTENSIONS_QUERY: &str = "SELECT extname from pg_extension";
pub const LIST_TABLES_QUERY: &str = "SELECT * from pg_catalog.pg_tables where schemaname not like 'pg_%' and schemaname != 'information_schema'";
pub const GET_VERSION_QUERY: &str = "SELECT version()";

/// Wrap `query` so every row is returned as one JSON value
pub fn as_json_rows(query: &str) -> String {
    format!("SELECT row_to_json(t) from ({}) as t;", query)
}

/// Quote a SQL identifier (table name, column name, etc.)
///
/// - `my_table` -> `"my_table"`
/// - `table"name` -> `"table""name"`
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal, doubling embedded single quotes
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn list_table_columns_query(schema: &str, table: &str) -> String {
    format!(
        "SELECT column_name, data_type, ordinal_position FROM information_schema.columns WHERE table_schema = {} AND table_name = {} order by ordinal_position asc",
        quote_literal(schema),
        quote_literal(table)
    )
}

pub fn count_table_rows_query(schema: &str, table: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM {}.{}",
        quote_identifier(schema),
        quote_identifier(table)
    )
}

/// Let the server parse `input` as a `timestamptz`
///
/// Surrounding quotes are stripped first so permission strings such as
/// `VALID UNTIL 'May 5 12:00:00 2017 +1'` can be passed through as written.
pub fn convert_to_date_query(input: &str) -> String {
    let trimmed = input.trim_matches(|c| c == '\'' || c == '"');
    format!("SELECT {}::timestamptz", quote_literal(trimmed))
}

pub fn role_exists_query(role: &str) -> String {
    format!("SELECT 1 FROM pg_roles WHERE rolname={}", quote_literal(role))
}

pub fn table_exists_query(table: &str) -> String {
    format!(
        "SELECT 1 FROM pg_catalog.pg_tables WHERE tablename={}",
        quote_literal(table)
    )
}

pub fn drop_table_query(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_identifier(table))
}
