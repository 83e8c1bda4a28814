// ABOUTME: SQLite table handle over rusqlite
// ABOUTME: Infers portable column types from declared types and parses timestamps stored as text

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, ToSql};
use std::path::Path;

use crate::table::value::parse_timestamp;
use crate::table::{
    ColumnDef, ColumnType, Comparison, KeySet, PrimaryKey, Projection, Row, TableReader,
    TableWriter, Value,
};
use crate::utils::quote_ident;

/// Older SQLite builds cap bound variables at 999
const KEY_BATCH_SIZE: usize = 500;

pub struct SqliteTable {
    conn: Connection,
    table: String,
}

impl SqliteTable {
    /// Open the database file named by `connection` (a plain path or a
    /// `sqlite://` URL), creating it if needed.
    pub fn open(connection: &str, table: &str) -> Result<Self> {
        let path = database_path(connection);
        let conn = Connection::open_with_flags(
            Path::new(path),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open SQLite database '{}'", path))?;

        tracing::debug!("Opened SQLite database '{}'", path);
        Ok(Self::from_connection(conn, table))
    }

    pub fn from_connection(conn: Connection, table: &str) -> Self {
        Self {
            conn,
            table: table.to_string(),
        }
    }

    fn quoted(&self) -> String {
        quote_ident(&self.table)
    }

    fn select_list(projection: &Projection) -> String {
        projection
            .column_names()
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn query_rows<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
        types: &[ColumnType],
    ) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare query on '{}'", self.table))?;
        let mut rows = stmt
            .query(params)
            .with_context(|| format!("Failed to query '{}'", self.table))?;

        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let values = types
                .iter()
                .enumerate()
                .map(|(idx, column_type)| {
                    let raw: SqliteValue = row.get(idx)?;
                    Ok(convert(raw, *column_type))
                })
                .collect::<rusqlite::Result<Row>>()?;
            result.push(values);
        }
        Ok(result)
    }
}

fn database_path(connection: &str) -> &str {
    connection
        .strip_prefix("sqlite://")
        .or_else(|| connection.strip_prefix("sqlite:"))
        .unwrap_or(connection)
}

fn projection_types(projection: &Projection) -> Vec<ColumnType> {
    projection.columns().iter().map(|c| c.column_type).collect()
}

/// Portable type from a declared SQLite column type, following the
/// affinity rules with date and boolean names recognised first.
fn column_type(declared: &str) -> ColumnType {
    let declared = declared.to_ascii_uppercase();
    if declared.contains("BOOL") {
        ColumnType::Boolean
    } else if declared.contains("TIMESTAMP") || declared.contains("DATETIME") {
        ColumnType::Timestamp
    } else if declared.contains("DATE") {
        ColumnType::Date
    } else if declared.contains("INT") {
        ColumnType::Integer
    } else if declared.contains("CHAR") || declared.contains("CLOB") || declared.contains("TEXT")
    {
        ColumnType::Text
    } else if declared.contains("BLOB") {
        ColumnType::Bytes
    } else if declared.contains("REAL") || declared.contains("FLOA") || declared.contains("DOUB")
    {
        ColumnType::Float
    } else if declared.contains("NUMERIC") || declared.contains("DEC") {
        ColumnType::Decimal
    } else {
        ColumnType::Text
    }
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "INTEGER",
        ColumnType::Float => "REAL",
        ColumnType::Decimal => "NUMERIC",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Text => "TEXT",
        ColumnType::Bytes => "BLOB",
        ColumnType::Timestamp => "TIMESTAMP",
        ColumnType::Date => "DATE",
    }
}

/// Storage class to value, guided by the column's declared type.
fn convert(raw: SqliteValue, column_type: ColumnType) -> Value {
    match (raw, column_type) {
        (SqliteValue::Null, _) => Value::Null,
        (SqliteValue::Integer(i), ColumnType::Boolean) => Value::Bool(i != 0),
        (SqliteValue::Integer(i), _) => Value::Int(i),
        (SqliteValue::Real(f), _) => Value::Float(f),
        (SqliteValue::Text(text), ColumnType::Timestamp) => match parse_timestamp(&text) {
            Some(ts) => Value::Timestamp(ts),
            None => Value::Text(text),
        },
        (SqliteValue::Text(text), ColumnType::Date) => {
            match NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d") {
                Ok(date) => Value::Date(date),
                Err(_) => match parse_timestamp(&text) {
                    Some(ts) => Value::Timestamp(ts),
                    None => Value::Text(text),
                },
            }
        }
        (SqliteValue::Text(text), _) => Value::Text(text),
        (SqliteValue::Blob(bytes), _) => Value::Bytes(bytes),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Timestamp(ts) => ToSqlOutput::Owned(SqliteValue::Text(
                ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            )),
            Value::Date(d) => {
                ToSqlOutput::Owned(SqliteValue::Text(d.format("%Y-%m-%d").to_string()))
            }
        })
    }
}

impl TableReader for SqliteTable {
    async fn table_exists(&mut self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&self.table],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to check whether '{}' exists", self.table))?;
        Ok(count > 0)
    }

    async fn columns(&mut self) -> Result<Vec<ColumnDef>> {
        let sql = format!("PRAGMA table_info({})", self.quoted());
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("Failed to read columns of '{}'", self.table))?;
        let columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let declared: String = row.get(2)?;
                Ok(ColumnDef::new(name, column_type(&declared)))
            })
            .with_context(|| format!("Failed to read columns of '{}'", self.table))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect column definitions")?;
        Ok(columns)
    }

    async fn fetch_primary_keys(&mut self, key: &ColumnDef) -> Result<KeySet> {
        let sql = format!("SELECT {} FROM {}", quote_ident(&key.name), self.quoted());
        let rows = self.query_rows(&sql, [], &[key.column_type])?;
        rows.iter()
            .map(|row| PrimaryKey::from_value(&row[0]))
            .collect()
    }

    async fn row_count(&mut self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.quoted());
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("Failed to count rows in '{}'", self.table))?;
        Ok(count as u64)
    }

    async fn fetch_all_rows(&mut self, projection: &Projection) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT {} FROM {}",
            Self::select_list(projection),
            self.quoted()
        );
        self.query_rows(&sql, [], &projection_types(projection))
    }

    async fn fetch_rows_where(
        &mut self,
        projection: &Projection,
        field: &str,
        op: Comparison,
        value: &Value,
    ) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} {} ?1",
            Self::select_list(projection),
            self.quoted(),
            quote_ident(field),
            op.as_sql()
        );
        self.query_rows(&sql, [value], &projection_types(projection))
    }

    async fn fetch_rows_by_keys(
        &mut self,
        projection: &Projection,
        keys: &[PrimaryKey],
    ) -> Result<Vec<Row>> {
        let types = projection_types(projection);
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(KEY_BATCH_SIZE) {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} IN ({})",
                Self::select_list(projection),
                self.quoted(),
                quote_ident(projection.primary_key()),
                vec!["?"; chunk.len()].join(", ")
            );
            let values: Vec<Value> = chunk.iter().map(PrimaryKey::to_value).collect();
            rows.extend(self.query_rows(&sql, params_from_iter(values.iter()), &types)?);
        }
        Ok(rows)
    }

    async fn max_timestamp(&mut self, field: &str) -> Result<Option<NaiveDateTime>> {
        let sql = format!("SELECT MAX({}) FROM {}", quote_ident(field), self.quoted());
        let rows = self.query_rows(&sql, [], &[ColumnType::Timestamp])?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_timestamp))
    }
}

impl TableWriter for SqliteTable {
    async fn begin_transaction(&mut self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin transaction")
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("Failed to commit transaction")
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn
            .execute_batch("ROLLBACK")
            .context("Failed to roll back transaction")
    }

    async fn delete_by_pk(&mut self, primary_key: &str, key: &PrimaryKey) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            self.quoted(),
            quote_ident(primary_key)
        );
        let deleted = self
            .conn
            .execute(&sql, [key.to_value()])
            .with_context(|| format!("Failed to delete {} from '{}'", key, self.table))?;
        Ok(deleted as u64)
    }

    async fn delete_all(&mut self) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.quoted());
        let deleted = self
            .conn
            .execute(&sql, [])
            .with_context(|| format!("Failed to clear '{}'", self.table))?;
        Ok(deleted as u64)
    }

    async fn insert_rows(&mut self, projection: &Projection, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = projection.column_names().map(quote_ident).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quoted(),
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare insert into '{}'", self.table))?;

        let mut inserted = 0;
        for row in rows {
            inserted += stmt
                .execute(params_from_iter(row.iter()))
                .with_context(|| format!("Failed to insert into '{}'", self.table))?;
        }
        Ok(inserted as u64)
    }

    async fn recreate_table(&mut self, projection: &Projection) -> Result<()> {
        let definitions: Vec<String> = projection
            .columns()
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.column_type)))
            .collect();
        let sql = format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} ({columns}, PRIMARY KEY ({pk}));",
            table = self.quoted(),
            columns = definitions.join(", "),
            pk = quote_ident(projection.primary_key())
        );
        tracing::info!("Recreating destination table '{}'", self.table);
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("Failed to recreate '{}'", self.table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn orders() -> SqliteTable {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                customer VARCHAR(40),
                paid BOOLEAN,
                updated_at DATETIME
            );
            INSERT INTO orders VALUES (1, 'ada', 1, '2024-01-01 10:00:00');
            INSERT INTO orders VALUES (2, 'lin', 0, '2024-01-02 11:30:00');
            INSERT INTO orders VALUES (3, NULL, NULL, NULL);",
        )
        .unwrap();
        SqliteTable::from_connection(conn, "orders")
    }

    async fn projection(table: &mut SqliteTable) -> Projection {
        let columns = table.columns().await.unwrap();
        Projection::new(&columns, None, "id", "updated_at").unwrap()
    }

    #[test]
    fn test_database_path() {
        assert_eq!(database_path("sqlite:///tmp/a.db"), "/tmp/a.db");
        assert_eq!(database_path("sqlite:data.db"), "data.db");
        assert_eq!(database_path("/var/lib/orders.db"), "/var/lib/orders.db");
    }

    #[test]
    fn test_column_type_affinity() {
        assert_eq!(column_type("INTEGER"), ColumnType::Integer);
        assert_eq!(column_type("varchar(40)"), ColumnType::Text);
        assert_eq!(column_type("DATETIME"), ColumnType::Timestamp);
        assert_eq!(column_type("date"), ColumnType::Date);
        assert_eq!(column_type("BOOLEAN"), ColumnType::Boolean);
        assert_eq!(column_type("DOUBLE PRECISION"), ColumnType::Float);
        assert_eq!(column_type("DECIMAL(10,2)"), ColumnType::Decimal);
        assert_eq!(column_type(""), ColumnType::Text);
    }

    #[tokio::test]
    async fn test_reads_typed_rows() {
        let mut table = orders();
        assert!(table.table_exists().await.unwrap());
        let projection = projection(&mut table).await;

        let rows = table.fetch_all_rows(&projection).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0],
            vec![
                Value::Int(1),
                Value::Text("ada".into()),
                Value::Bool(true),
                Value::Timestamp(ts("2024-01-01 10:00:00")),
            ]
        );
        assert_eq!(rows[2][1], Value::Null);
    }

    #[tokio::test]
    async fn test_filtered_reads_and_max() {
        let mut table = orders();
        let projection = projection(&mut table).await;

        let newer = table
            .fetch_rows_where(
                &projection,
                "updated_at",
                Comparison::Greater,
                &Value::Timestamp(ts("2024-01-01 12:00:00")),
            )
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0][0], Value::Int(2));

        let by_key = table
            .fetch_rows_by_keys(&projection, &[PrimaryKey::Int(3), PrimaryKey::Int(99)])
            .await
            .unwrap();
        assert_eq!(by_key.len(), 1);

        assert_eq!(
            table.max_timestamp("updated_at").await.unwrap(),
            Some(ts("2024-01-02 11:30:00"))
        );
    }

    #[tokio::test]
    async fn test_recreate_then_insert_and_rollback() {
        let mut source = orders();
        let projection = projection(&mut source).await;
        let rows = source.fetch_all_rows(&projection).await.unwrap();

        let mut destination =
            SqliteTable::from_connection(Connection::open_in_memory().unwrap(), "orders");
        assert!(!destination.table_exists().await.unwrap());

        destination.begin_transaction().await.unwrap();
        destination.recreate_table(&projection).await.unwrap();
        assert_eq!(destination.insert_rows(&projection, &rows).await.unwrap(), 3);
        destination.commit().await.unwrap();
        assert_eq!(destination.row_count().await.unwrap(), 3);
        assert_eq!(destination.fetch_all_rows(&projection).await.unwrap(), rows);

        destination.begin_transaction().await.unwrap();
        assert_eq!(
            destination
                .delete_by_pk("id", &PrimaryKey::Int(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(destination.delete_all().await.unwrap(), 2);
        destination.rollback().await.unwrap();

        let keys = destination
            .fetch_primary_keys(projection.key_column())
            .await
            .unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_text_keys_match_row_keys() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE codes (code VARCHAR(10) PRIMARY KEY, updated_at DATETIME);
            INSERT INTO codes VALUES ('007', '2024-01-01 00:00:00');
            INSERT INTO codes VALUES ('12', '2024-01-02 00:00:00');",
        )
        .unwrap();
        let mut table = SqliteTable::from_connection(conn, "codes");
        let columns = table.columns().await.unwrap();
        let projection = Projection::new(&columns, None, "code", "updated_at").unwrap();

        let keys = table
            .fetch_primary_keys(projection.key_column())
            .await
            .unwrap();
        let row_keys: KeySet = table
            .fetch_all_rows(&projection)
            .await
            .unwrap()
            .iter()
            .map(|row| projection.key_of(row).unwrap())
            .collect();
        assert_eq!(keys, row_keys);
        assert!(keys.contains(&PrimaryKey::Text("007".into())));
    }
}
