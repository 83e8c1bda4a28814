// ABOUTME: Backend-neutral table model shared by the sync engine and every backend
// ABOUTME: Typed values, primary keys, column projection, and the table access traits

pub mod projection;
pub mod value;

use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::BTreeSet;

pub use projection::Projection;
pub use value::{PrimaryKey, Value};

/// Primary-key set of a table at one point in time.
pub type KeySet = BTreeSet<PrimaryKey>;

/// One row, with values in the order of the projection that fetched it.
pub type Row = Vec<Value>;

/// Portable column type, used for schema comparison and destination DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Bytes,
    Timestamp,
    Date,
}

/// A column as declared by a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Comparison operator for filtered reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Equal,
}

impl Comparison {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Equal => "=",
        }
    }
}

/// Read access to the single table a profile replicates.
///
/// A handle is bound to one table on one connection. Methods take `&mut self`
/// because some drivers need exclusive access to their connection.
#[allow(async_fn_in_trait)]
pub trait TableReader {
    /// Whether the bound table exists.
    async fn table_exists(&mut self) -> Result<bool>;

    /// Columns of the bound table, in declaration order.
    async fn columns(&mut self) -> Result<Vec<ColumnDef>>;

    /// Every primary-key value currently in the table, decoded as `key`'s
    /// type so both ends of a replication produce comparable keys.
    async fn fetch_primary_keys(&mut self, key: &ColumnDef) -> Result<KeySet>;

    async fn row_count(&mut self) -> Result<u64>;

    async fn fetch_all_rows(&mut self, projection: &Projection) -> Result<Vec<Row>>;

    /// Rows where `field <op> value`.
    async fn fetch_rows_where(
        &mut self,
        projection: &Projection,
        field: &str,
        op: Comparison,
        value: &Value,
    ) -> Result<Vec<Row>>;

    /// Rows whose primary key is one of `keys`. Missing keys are skipped.
    async fn fetch_rows_by_keys(
        &mut self,
        projection: &Projection,
        keys: &[PrimaryKey],
    ) -> Result<Vec<Row>>;

    /// Largest value of a timestamp-like column, `None` for an empty table
    /// or an all-NULL column.
    async fn max_timestamp(&mut self, field: &str) -> Result<Option<NaiveDateTime>>;
}

/// Write access to the destination table.
///
/// All writes of one run happen between `begin_transaction` and
/// `commit`/`rollback`.
#[allow(async_fn_in_trait)]
pub trait TableWriter: TableReader {
    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Delete the row with the given key. Returns the number of rows removed,
    /// zero when the key is absent.
    async fn delete_by_pk(&mut self, primary_key: &str, key: &PrimaryKey) -> Result<u64>;

    async fn delete_all(&mut self) -> Result<u64>;

    async fn insert_rows(&mut self, projection: &Projection, rows: &[Row]) -> Result<u64>;

    /// Drop the table if present and create it with the given columns.
    async fn recreate_table(&mut self, projection: &Projection) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_sql() {
        assert_eq!(Comparison::Greater.as_sql(), ">");
        assert_eq!(Comparison::GreaterOrEqual.as_sql(), ">=");
        assert_eq!(Comparison::Equal.as_sql(), "=");
    }
}
