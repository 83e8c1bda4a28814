// ABOUTME: PostgreSQL table handle over tokio-postgres, with optional TLS via native-tls
// ABOUTME: Maps column types to portable values and batches inserts under the parameter limit

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres_native_tls::MakeTlsConnector;
use rust_decimal::Decimal;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};

use super::split_qualified;
use crate::config::SslConfig;
use crate::table::{
    ColumnDef, ColumnType, Comparison, KeySet, PrimaryKey, Projection, Row, TableReader,
    TableWriter, Value,
};
use crate::table::value::{instant_at, parse_timestamp, wall_clock};
use crate::utils::quote_ident;

/// PostgreSQL caps bind parameters per statement at 65535
const MAX_PARAMS: usize = 65000;
const KEY_BATCH_SIZE: usize = 1000;

pub struct PostgresTable {
    client: Client,
    schema: String,
    table: String,
}

impl PostgresTable {
    /// Connect and bind to `table`, which may be written `schema.table`
    /// (schema defaults to `public`).
    pub async fn connect(connection: &str, ssl: &SslConfig, table: &str) -> Result<Self> {
        let client = if ssl.required {
            let connector = build_tls_connector(ssl)?;
            let (client, conn) =
                tokio_postgres::connect(connection, MakeTlsConnector::new(connector))
                    .await
                    .context("Failed to connect to PostgreSQL over TLS")?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            client
        } else {
            let (client, conn) = tokio_postgres::connect(connection, NoTls)
                .await
                .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::error!("PostgreSQL connection error: {}", e);
                }
            });
            client
        };

        Ok(Self::from_client(client, table))
    }

    pub fn from_client(client: Client, table: &str) -> Self {
        let (schema, name) = split_qualified(table);
        Self {
            client,
            schema: schema.unwrap_or("public").to_string(),
            table: name.to_string(),
        }
    }

    fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    fn select_list(projection: &Projection) -> String {
        projection
            .column_names()
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn query_rows(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        let rows = self
            .client
            .query(sql, params)
            .await
            .with_context(|| format!("Failed to read from {}", self.qualified()))?;
        rows.iter().map(read_row).collect()
    }
}

fn build_tls_connector(ssl: &SslConfig) -> Result<native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(ca) = &ssl.ca {
        let pem = std::fs::read(ca)
            .with_context(|| format!("Failed to read CA certificate {}", ca.display()))?;
        let certificate = native_tls::Certificate::from_pem(&pem)
            .with_context(|| format!("Invalid CA certificate {}", ca.display()))?;
        builder.add_root_certificate(certificate);
    }
    if let (Some(cert), Some(key)) = (&ssl.cert, &ssl.key) {
        let cert_pem = std::fs::read(cert)
            .with_context(|| format!("Failed to read client certificate {}", cert.display()))?;
        let key_pem = std::fs::read(key)
            .with_context(|| format!("Failed to read client key {}", key.display()))?;
        let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
            .context("Client key must be a PKCS#8 PEM matching the client certificate")?;
        builder.identity(identity);
    }
    builder.build().context("Failed to build TLS connector")
}

fn column_type(data_type: &str) -> ColumnType {
    match data_type {
        "smallint" | "integer" | "bigint" => ColumnType::Integer,
        "real" | "double precision" => ColumnType::Float,
        "numeric" | "decimal" => ColumnType::Decimal,
        "boolean" => ColumnType::Boolean,
        "bytea" => ColumnType::Bytes,
        "timestamp without time zone" | "timestamp with time zone" => ColumnType::Timestamp,
        "date" => ColumnType::Date,
        _ => ColumnType::Text,
    }
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Decimal => "NUMERIC",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Text => "TEXT",
        ColumnType::Bytes => "BYTEA",
        ColumnType::Timestamp => "TIMESTAMP",
        ColumnType::Date => "DATE",
    }
}

fn read_row(row: &tokio_postgres::Row) -> Result<Row> {
    (0..row.len()).map(|idx| read_value(row, idx)).collect()
}

fn read_value(row: &tokio_postgres::Row, idx: usize) -> Result<Value> {
    let column = &row.columns()[idx];
    let value = match *column.type_() {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| Value::Int(v.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map(|v| Value::Text(v.to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        }
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::Timestamp(wall_clock(v, &Local))),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| Value::Text(v.to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| Value::Text(v.to_string())),
        ref other => bail!(
            "Column '{}' has unsupported PostgreSQL type {}",
            column.name(),
            other
        ),
    };
    Ok(value.unwrap_or(Value::Null))
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::INT2 | Type::INT4 | Type::INT8 => Value::Int(i64::from(*b)).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => b.to_string().to_sql(ty, out),
                _ => b.to_sql(ty, out),
            },
            Value::Int(i) => match *ty {
                Type::BOOL => (*i != 0).to_sql(ty, out),
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => i.to_string().to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => f.to_string().to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Text(s) => match *ty {
                Type::INT2 | Type::INT4 | Type::INT8 => {
                    Value::Int(s.trim().parse()?).to_sql(ty, out)
                }
                Type::FLOAT4 | Type::FLOAT8 => Value::Float(s.trim().parse()?).to_sql(ty, out),
                Type::NUMERIC => s.trim().parse::<Decimal>()?.to_sql(ty, out),
                Type::BOOL => match s.trim().to_ascii_lowercase().as_str() {
                    "t" | "true" | "1" | "yes" => true.to_sql(ty, out),
                    "f" | "false" | "0" | "no" => false.to_sql(ty, out),
                    other => Err(format!("'{}' is not a boolean", other).into()),
                },
                Type::UUID => uuid::Uuid::parse_str(s.trim())?.to_sql(ty, out),
                Type::JSON | Type::JSONB => {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out)
                }
                Type::TIMESTAMP | Type::TIMESTAMPTZ | Type::DATE => {
                    match parse_timestamp(s) {
                        Some(ts) => Value::Timestamp(ts).to_sql(ty, out),
                        None => Err(format!("'{}' is not a timestamp", s).into()),
                    }
                }
                _ => s.to_sql(ty, out),
            },
            Value::Bytes(b) => b.to_sql(ty, out),
            Value::Timestamp(ts) => match *ty {
                Type::TIMESTAMPTZ => instant_at(*ts, &Local).to_sql(ty, out),
                Type::DATE => ts.date().to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => ts
                    .format("%Y-%m-%d %H:%M:%S%.f")
                    .to_string()
                    .to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            Value::Date(d) => match *ty {
                Type::TIMESTAMP | Type::TIMESTAMPTZ => {
                    Value::Timestamp(d.and_time(NaiveTime::default())).to_sql(ty, out)
                }
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => {
                    d.format("%Y-%m-%d").to_string().to_sql(ty, out)
                }
                _ => d.to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// INSERT INTO "s"."t" ("a", "b") VALUES ($1, $2), ($3, $4), ...
fn build_insert_query(qualified: &str, columns: &[&str], num_rows: usize) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified,
        quoted.join(", "),
        value_rows.join(", ")
    )
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

impl TableReader for PostgresTable {
    async fn table_exists(&mut self) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM information_schema.tables
                    WHERE table_schema = $1 AND table_name = $2
                )",
                &[&self.schema, &self.table],
            )
            .await
            .with_context(|| format!("Failed to check whether {} exists", self.qualified()))?;
        Ok(row.get(0))
    }

    async fn columns(&mut self) -> Result<Vec<ColumnDef>> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type
                 FROM information_schema.columns
                 WHERE table_schema = $1 AND table_name = $2
                 ORDER BY ordinal_position",
                &[&self.schema, &self.table],
            )
            .await
            .with_context(|| format!("Failed to get columns for {}", self.qualified()))?;

        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                ColumnDef::new(name, column_type(&data_type))
            })
            .collect())
    }

    async fn fetch_primary_keys(&mut self, key: &ColumnDef) -> Result<KeySet> {
        let sql = format!("SELECT {} FROM {}", quote_ident(&key.name), self.qualified());
        let rows = self.query_rows(&sql, &[]).await?;
        rows.iter()
            .map(|row| PrimaryKey::from_value(&row[0]))
            .collect()
    }

    async fn row_count(&mut self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.qualified());
        let row = self
            .client
            .query_one(&sql, &[])
            .await
            .with_context(|| format!("Failed to count rows in {}", self.qualified()))?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn fetch_all_rows(&mut self, projection: &Projection) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT {} FROM {}",
            Self::select_list(projection),
            self.qualified()
        );
        self.query_rows(&sql, &[]).await
    }

    async fn fetch_rows_where(
        &mut self,
        projection: &Projection,
        field: &str,
        op: Comparison,
        value: &Value,
    ) -> Result<Vec<Row>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} {} $1",
            Self::select_list(projection),
            self.qualified(),
            quote_ident(field),
            op.as_sql()
        );
        self.query_rows(&sql, &[value]).await
    }

    async fn fetch_rows_by_keys(
        &mut self,
        projection: &Projection,
        keys: &[PrimaryKey],
    ) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(KEY_BATCH_SIZE) {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} IN ({})",
                Self::select_list(projection),
                self.qualified(),
                quote_ident(projection.primary_key()),
                placeholders(chunk.len())
            );
            let values: Vec<Value> = chunk.iter().map(PrimaryKey::to_value).collect();
            let params: Vec<&(dyn ToSql + Sync)> =
                values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            rows.extend(self.query_rows(&sql, &params).await?);
        }
        Ok(rows)
    }

    async fn max_timestamp(&mut self, field: &str) -> Result<Option<NaiveDateTime>> {
        let sql = format!("SELECT MAX({}) FROM {}", quote_ident(field), self.qualified());
        let rows = self.query_rows(&sql, &[]).await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_timestamp))
    }
}

impl TableWriter for PostgresTable {
    async fn begin_transaction(&mut self) -> Result<()> {
        self.client
            .batch_execute("BEGIN")
            .await
            .context("Failed to begin transaction")
    }

    async fn commit(&mut self) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .context("Failed to commit transaction")
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .context("Failed to roll back transaction")
    }

    async fn delete_by_pk(&mut self, primary_key: &str, key: &PrimaryKey) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            self.qualified(),
            quote_ident(primary_key)
        );
        let value = key.to_value();
        self.client
            .execute(&sql, &[&value])
            .await
            .with_context(|| format!("Failed to delete {} from {}", key, self.qualified()))
    }

    async fn delete_all(&mut self) -> Result<u64> {
        let sql = format!("DELETE FROM {}", self.qualified());
        self.client
            .execute(&sql, &[])
            .await
            .with_context(|| format!("Failed to clear {}", self.qualified()))
    }

    async fn insert_rows(&mut self, projection: &Projection, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns: Vec<&str> = projection.column_names().collect();
        let batch_size = std::cmp::max(1, MAX_PARAMS / columns.len().max(1));
        let qualified = self.qualified();

        let mut inserted = 0;
        for chunk in rows.chunks(batch_size) {
            let sql = build_insert_query(&qualified, &columns, chunk.len());
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|v| v as &(dyn ToSql + Sync)))
                .collect();
            inserted += self
                .client
                .execute(&sql, &params)
                .await
                .with_context(|| format!("Failed to insert batch into {}", qualified))?;
        }
        Ok(inserted)
    }

    async fn recreate_table(&mut self, projection: &Projection) -> Result<()> {
        let qualified = self.qualified();
        let definitions: Vec<String> = projection
            .columns()
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.column_type)))
            .collect();
        let sql = format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} ({columns}, PRIMARY KEY ({pk}))",
            table = qualified,
            columns = definitions.join(", "),
            pk = quote_ident(projection.primary_key())
        );
        tracing::info!("Recreating destination table {}", qualified);
        self.client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("Failed to recreate {}", qualified))
    }
}
