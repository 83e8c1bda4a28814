// ABOUTME: MySQL / MariaDB table handle over mysql_async
// ABOUTME: Uses the binary protocol so values arrive typed, with optional TLS root certificates

use anyhow::{bail, Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Params, SslOpts, Value as MyValue};

use super::split_qualified;
use crate::config::SslConfig;
use crate::table::value::parse_timestamp;
use crate::table::{
    ColumnDef, ColumnType, Comparison, KeySet, PrimaryKey, Projection, Row, TableReader,
    TableWriter, Value,
};
use crate::utils::quote_mysql_ident;

/// MySQL caps placeholders per prepared statement at 65535
const MAX_PARAMS: usize = 60000;
const KEY_BATCH_SIZE: usize = 1000;

pub struct MySqlTable {
    conn: Conn,
    database: Option<String>,
    table: String,
    /// Set once `recreate_table` committed DDL inside the open transaction
    recreated: bool,
}

impl MySqlTable {
    /// Connect and bind to `table`, which may be written `database.table`
    /// (otherwise the connection's default database is used).
    pub async fn connect(connection: &str, ssl: &SslConfig, table: &str) -> Result<Self> {
        let url = match connection.strip_prefix("mariadb://") {
            Some(rest) => format!("mysql://{}", rest),
            None => connection.to_string(),
        };
        let opts = Opts::from_url(&url).context("Invalid MySQL connection string")?;
        let mut builder = OptsBuilder::from_opts(opts);

        if ssl.required {
            if ssl.cert.is_some() || ssl.key.is_some() {
                bail!("MySQL client certificates are not supported; configure only ssl.ca");
            }
            let mut ssl_opts = SslOpts::default();
            if let Some(ca) = &ssl.ca {
                ssl_opts = ssl_opts.with_root_certs(vec![ca.clone().into()]);
            }
            builder = builder.ssl_opts(ssl_opts);
        }

        let conn = Conn::new(builder)
            .await
            .context("Failed to connect to MySQL")?;

        let (database, name) = split_qualified(table);
        Ok(Self {
            conn,
            database: database.map(str::to_string),
            table: name.to_string(),
            recreated: false,
        })
    }

    fn qualified(&self) -> String {
        match &self.database {
            Some(db) => format!("{}.{}", quote_mysql_ident(db), quote_mysql_ident(&self.table)),
            None => quote_mysql_ident(&self.table),
        }
    }

    /// Schema filter for information_schema lookups.
    fn schema_clause(&self) -> (&'static str, Params) {
        match &self.database {
            Some(db) => (
                "table_schema = ? AND table_name = ?",
                Params::Positional(vec![db.as_str().into(), self.table.as_str().into()]),
            ),
            None => (
                "table_schema = DATABASE() AND table_name = ?",
                Params::Positional(vec![self.table.as_str().into()]),
            ),
        }
    }

    fn select_list(projection: &Projection) -> String {
        projection
            .column_names()
            .map(quote_mysql_ident)
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn query_rows(
        &mut self,
        sql: &str,
        params: Params,
        types: &[ColumnType],
    ) -> Result<Vec<Row>> {
        let rows: Vec<mysql_async::Row> = self
            .conn
            .exec(sql, params)
            .await
            .with_context(|| format!("Failed to read from {}", self.table))?;
        rows.into_iter()
            .map(|row| {
                row.unwrap()
                    .into_iter()
                    .zip(types)
                    .map(|(raw, column_type)| convert(raw, *column_type))
                    .collect::<Result<Row>>()
            })
            .collect()
    }

    async fn execute(&mut self, sql: &str, params: Params) -> Result<u64> {
        self.conn
            .exec_drop(sql, params)
            .await
            .with_context(|| format!("Failed to write to {}", self.table))?;
        Ok(self.conn.affected_rows())
    }
}

fn projection_types(projection: &Projection) -> Vec<ColumnType> {
    projection.columns().iter().map(|c| c.column_type).collect()
}

fn column_type(data_type: &str) -> ColumnType {
    match data_type.to_ascii_lowercase().as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
            ColumnType::Integer
        }
        "float" | "double" | "real" => ColumnType::Float,
        "decimal" | "numeric" => ColumnType::Decimal,
        "bit" | "bool" | "boolean" => ColumnType::Boolean,
        "datetime" | "timestamp" => ColumnType::Timestamp,
        "date" => ColumnType::Date,
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            ColumnType::Bytes
        }
        _ => ColumnType::Text,
    }
}

fn sql_type(column_type: ColumnType, is_key: bool) -> &'static str {
    match column_type {
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE",
        ColumnType::Decimal => "DECIMAL(38,10)",
        ColumnType::Boolean => "BOOLEAN",
        // TEXT cannot be part of a key without a prefix length
        ColumnType::Text if is_key => "VARCHAR(255)",
        ColumnType::Text => "LONGTEXT",
        ColumnType::Bytes if is_key => "VARBINARY(255)",
        ColumnType::Bytes => "LONGBLOB",
        ColumnType::Timestamp => "DATETIME(6)",
        ColumnType::Date => "DATE",
    }
}

fn date_value(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> Result<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year.into(), month.into(), day.into())
        .and_then(|date| {
            date.and_hms_micro_opt(hour.into(), minute.into(), second.into(), micros)
        })
        .with_context(|| {
            format!(
                "Invalid MySQL date {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            )
        })
}

fn convert(raw: MyValue, column_type: ColumnType) -> Result<Value> {
    Ok(match raw {
        MyValue::NULL => Value::Null,
        MyValue::Int(i) if column_type == ColumnType::Boolean => Value::Bool(i != 0),
        MyValue::Int(i) => Value::Int(i),
        MyValue::UInt(u) => Value::Int(i64::try_from(u).context("Unsigned value exceeds i64")?),
        MyValue::Float(f) => Value::Float(f.into()),
        MyValue::Double(f) => Value::Float(f),
        MyValue::Date(0, 0, 0, _, _, _, _) => Value::Null,
        MyValue::Date(year, month, day, hour, minute, second, micros) => {
            let ts = date_value(year, month, day, hour, minute, second, micros)?;
            if column_type == ColumnType::Date {
                Value::Date(ts.date())
            } else {
                Value::Timestamp(ts)
            }
        }
        MyValue::Time(negative, days, hours, minutes, seconds, micros) => Value::Text(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if negative { "-" } else { "" },
            u32::from(hours) + days * 24,
            minutes,
            seconds,
            micros
        )),
        MyValue::Bytes(bytes) => match column_type {
            ColumnType::Bytes => Value::Bytes(bytes),
            ColumnType::Boolean if bytes.len() == 1 && bytes[0] <= 1 => {
                Value::Bool(bytes[0] == 1)
            }
            _ => match String::from_utf8(bytes) {
                Ok(text) => match column_type {
                    ColumnType::Timestamp => parse_timestamp(&text)
                        .map(Value::Timestamp)
                        .unwrap_or(Value::Text(text)),
                    ColumnType::Integer => text
                        .trim()
                        .parse()
                        .map(Value::Int)
                        .unwrap_or(Value::Text(text)),
                    _ => Value::Text(text),
                },
                Err(e) => Value::Bytes(e.into_bytes()),
            },
        },
    })
}

fn to_mysql(value: &Value) -> MyValue {
    match value {
        Value::Null => MyValue::NULL,
        Value::Bool(b) => MyValue::Int(i64::from(*b)),
        Value::Int(i) => MyValue::Int(*i),
        Value::Float(f) => MyValue::Double(*f),
        Value::Text(s) => MyValue::Bytes(s.as_bytes().to_vec()),
        Value::Bytes(b) => MyValue::Bytes(b.clone()),
        Value::Timestamp(ts) => MyValue::Date(
            ts.year() as u16,
            ts.month() as u8,
            ts.day() as u8,
            ts.hour() as u8,
            ts.minute() as u8,
            ts.second() as u8,
            ts.nanosecond() / 1_000,
        ),
        Value::Date(d) => {
            MyValue::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
    }
}

fn positional<'a>(values: impl IntoIterator<Item = &'a Value>) -> Params {
    let values: Vec<MyValue> = values.into_iter().map(to_mysql).collect();
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values)
    }
}

fn build_insert_query(qualified: &str, columns: &[String], num_rows: usize) -> String {
    let row = format!("({})", vec!["?"; columns.len()].join(", "));
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified,
        columns.join(", "),
        vec![row; num_rows].join(", ")
    )
}

impl TableReader for MySqlTable {
    async fn table_exists(&mut self) -> Result<bool> {
        let (clause, params) = self.schema_clause();
        let sql = format!("SELECT COUNT(*) FROM information_schema.tables WHERE {}", clause);
        let count: Option<i64> = self
            .conn
            .exec_first(sql, params)
            .await
            .with_context(|| format!("Failed to check whether {} exists", self.table))?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn columns(&mut self) -> Result<Vec<ColumnDef>> {
        let (clause, params) = self.schema_clause();
        let sql = format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE {} ORDER BY ordinal_position",
            clause
        );
        let rows: Vec<(String, String)> = self
            .conn
            .exec(sql, params)
            .await
            .with_context(|| format!("Failed to get columns for {}", self.table))?;
        Ok(rows
            .into_iter()
            .map(|(name, data_type)| ColumnDef::new(name, column_type(&data_type)))
            .collect())
    }

    async fn fetch_primary_keys(&mut self, key: &ColumnDef) -> Result<KeySet> {
        let sql = format!(
            "SELECT {} FROM {}",
            quote_mysql_ident(&key.name),
            self.qualified()
        );
        let rows = self
            .query_rows(&sql, Params::Empty, &[key.column_type])
            .await?;
        rows.iter()
            .map(|row| PrimaryKey::from_value(&row[0]))
            .collect()
    }

    async fn row_count(&mut self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.qualified());
        let count: Option<u64> = self
            .conn
            .exec_first(sql, ())
            .await
            .with_context(|| format!("Failed to count rows in {}", self.table))?;
        Ok(count.unwrap_or(0))
    }

    async fn fetch_all_rows(&mut self, projection: &Projection) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT {} FROM {}",
            Self::select_list(projection),
            self.qualified()
        );
        self.query_rows(&sql, Params::Empty, &projection_types(projection))
            .await
    }

    async fn fetch_rows_where(
        &mut self,
        projection: &Projection,
        field: &str,
        op: Comparison,
        value: &Value,
    ) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} {} ?",
            Self::select_list(projection),
            self.qualified(),
            quote_mysql_ident(field),
            op.as_sql()
        );
        self.query_rows(&sql, positional([value]), &projection_types(projection))
            .await
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
                self.qualified(),
                quote_mysql_ident(projection.primary_key()),
                vec!["?"; chunk.len()].join(", ")
            );
            let values: Vec<Value> = chunk.iter().map(PrimaryKey::to_value).collect();
            rows.extend(self.query_rows(&sql, positional(&values), &types).await?);
        }
        Ok(rows)
    }

    async fn max_timestamp(&mut self, field: &str) -> Result<Option<NaiveDateTime>> {
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            quote_mysql_ident(field),
            self.qualified()
        );
        let rows = self
            .query_rows(&sql, Params::Empty, &[ColumnType::Timestamp])
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_timestamp))
    }
}

impl TableWriter for MySqlTable {
    async fn begin_transaction(&mut self) -> Result<()> {
        self.recreated = false;
        self.conn
            .query_drop("START TRANSACTION")
            .await
            .context("Failed to begin transaction")
    }

    async fn commit(&mut self) -> Result<()> {
        self.recreated = false;
        self.conn
            .query_drop("COMMIT")
            .await
            .context("Failed to commit transaction")
    }

    async fn rollback(&mut self) -> Result<()> {
        if std::mem::take(&mut self.recreated) {
            tracing::warn!(
                "Recreated table {} stays empty after rollback until the next run",
                self.qualified()
            );
        }
        self.conn
            .query_drop("ROLLBACK")
            .await
            .context("Failed to roll back transaction")
    }

    async fn delete_by_pk(&mut self, primary_key: &str, key: &PrimaryKey) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.qualified(),
            quote_mysql_ident(primary_key)
        );
        self.execute(&sql, positional([&key.to_value()])).await
    }

    async fn delete_all(&mut self) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.qualified());
        self.execute(&sql, Params::Empty).await
    }

    async fn insert_rows(&mut self, projection: &Projection, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = projection.column_names().map(quote_mysql_ident).collect();
        let batch_size = std::cmp::max(1, MAX_PARAMS / columns.len().max(1));
        let qualified = self.qualified();

        let mut inserted = 0;
        for chunk in rows.chunks(batch_size) {
            let sql = build_insert_query(&qualified, &columns, chunk.len());
            inserted += self.execute(&sql, positional(chunk.iter().flatten())).await?;
        }
        Ok(inserted)
    }

    /// DDL commits implicitly in MySQL, so a recreated table survives a
    /// later rollback of the row changes.
    async fn recreate_table(&mut self, projection: &Projection) -> Result<()> {
        let qualified = self.qualified();
        let primary_key = projection.primary_key();
        let definitions: Vec<String> = projection
            .columns()
            .iter()
            .map(|c| {
                format!(
                    "{} {}",
                    quote_mysql_ident(&c.name),
                    sql_type(c.column_type, c.name == primary_key)
                )
            })
            .collect();

        tracing::info!("Recreating destination table {}", qualified);
        self.conn
            .query_drop(format!("DROP TABLE IF EXISTS {}", qualified))
            .await
            .with_context(|| format!("Failed to drop {}", qualified))?;
        self.conn
            .query_drop(format!(
                "CREATE TABLE {} ({}, PRIMARY KEY ({}))",
                qualified,
                definitions.join(", "),
                quote_mysql_ident(primary_key)
            ))
            .await
            .with_context(|| format!("Failed to create {}", qualified))?;
        self.begin_transaction().await?;
        self.recreated = true;
        Ok(())
    }
}
