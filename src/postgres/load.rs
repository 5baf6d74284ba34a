//! Sample data loads
//!
//! Each table is created first, then all rows are streamed with a binary
//! `COPY` inside one transaction. A failure at any step drops the
//! transaction, so nothing from that table is committed.

use std::pin::pin;

use tokio_postgres::Client;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};

use super::Result;
use super::sql::quote_identifier;

pub const DEFAULT_TABLE_PREFIX: &str = "pgats_table";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    /// One table, one column, one row
    Test1,
    /// A few tables with enough rows to notice data loss
    Small,
}

impl LoadType {
    fn shape(&self) -> (usize, usize, usize) {
        // (tables, columns, rows)
        match self {
            LoadType::Test1 => (1, 1, 1),
            LoadType::Small => (3, 4, 500),
        }
    }
}

/// A table to create and fill with generated rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleTable {
    pub name: String,
    pub columns: Vec<String>,
    pub num_rows: usize,
}

impl SampleTable {
    pub fn create_statement(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} VARCHAR", quote_identifier(c)))
            .collect();
        format!(
            "CREATE TABLE {} ({})",
            quote_identifier(&self.name),
            columns.join(", ")
        )
    }

    pub fn copy_statement(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_identifier(c)).collect();
        format!(
            "COPY {} ({}) FROM STDIN BINARY",
            quote_identifier(&self.name),
            columns.join(", ")
        )
    }

    /// Values of row `index`, one per column
    pub fn row(&self, index: usize) -> Vec<String> {
        self.columns
            .iter()
            .map(|_| format!("short_string{}", index))
            .collect()
    }
}

/// Tables for `load_type`, named `<prefix>_<n>`
pub fn sample_load(load_type: LoadType, prefix: &str) -> Vec<SampleTable> {
    let (tables, columns, rows) = load_type.shape();
    (0..tables)
        .map(|t| SampleTable {
            name: format!("{}_{}", prefix, t),
            columns: (0..columns).map(|c| format!("column{}", c)).collect(),
            num_rows: rows,
        })
        .collect()
}

/// Create `table` and copy its rows in a single transaction
pub async fn load_table(client: &mut Client, table: &SampleTable) -> Result<u64> {
    client.batch_execute(&table.create_statement()).await?;

    let txn = client.transaction().await?;
    let statement = txn.prepare(&table.copy_statement()).await?;
    let sink = txn.copy_in(&statement).await?;

    let types = vec![Type::VARCHAR; table.columns.len()];
    let mut writer = pin!(BinaryCopyInWriter::new(sink, &types));
    for index in 0..table.num_rows {
        let values = table.row(index);
        let refs: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        writer.as_mut().write(&refs).await?;
    }
    let written = writer.as_mut().finish().await?;

    txn.commit().await?;
    tracing::debug!(table = %table.name, rows = written, "Loaded sample table");
    Ok(written)
}
