//! PostgreSQL backend over `tokio-postgres`.
//!
//! Every job gets its own client. The connection task is spawned next to it
//! and aborted when the session is discarded or dropped.

use std::error::Error as StdError;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{CancelToken, Client, NoTls, Statement};
use tracing::{debug, warn};

use super::store::{RowSet, StoreDriver, StoreError, StoreSession};
use crate::core::protocol::{ColumnInfo, DatasourceInfo, Row, Value};

type BoxError = Box<dyn StdError + Sync + Send>;

const APPLICATION_NAME: &str = "query-agent";

const NULLABILITY_SQL: &str =
    "SELECT NOT attnotnull FROM pg_catalog.pg_attribute WHERE attrelid = $1 AND attnum = $2";

pub struct PostgresDriver;

#[async_trait]
impl StoreDriver for PostgresDriver {
    fn store_type(&self) -> &'static str {
        "postgres"
    }

    async fn open(&self, datasource: &DatasourceInfo) -> Result<Box<dyn StoreSession>, StoreError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&datasource.host)
            .port(datasource.port)
            .user(&datasource.username)
            .password(&datasource.password)
            .application_name(APPLICATION_NAME);
        if let Some(db) = datasource.database() {
            config.dbname(db);
        }

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| StoreError::Connect(describe(&e)))?;

        let endpoint = datasource.endpoint();
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Postgres connection to {} ended: {}", endpoint, e);
            }
        });

        let cancel = client.cancel_token();
        Ok(Box::new(PostgresSession {
            client,
            cancel,
            connection,
        }))
    }
}

struct PostgresSession {
    client: Client,
    cancel: CancelToken,
    connection: JoinHandle<()>,
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl StoreSession for PostgresSession {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Probe(describe(&e)))
    }

    async fn fetch(&mut self, statement: &str) -> Result<RowSet, StoreError> {
        let prepared = self
            .client
            .prepare(statement)
            .await
            .map_err(|e| StoreError::Query(describe(&e)))?;
        let rows = self
            .client
            .query(&prepared, &[])
            .await
            .map_err(|e| StoreError::Query(describe(&e)))?;

        let columns = self.describe_columns(&prepared).await;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut cells = Row::with_capacity(columns.len());
            for (idx, column) in prepared.columns().iter().enumerate() {
                let value = decode_cell(row, idx, column.type_()).map_err(|e| StoreError::Column {
                    name: column.name().to_string(),
                    reason: e.to_string(),
                })?;
                cells.push(column.name(), value);
            }
            out.push(cells);
        }

        Ok(RowSet { columns, rows: out })
    }

    async fn count(&mut self, statement: &str) -> Result<u64, StoreError> {
        let row = self
            .client
            .query_one(statement, &[])
            .await
            .map_err(|e| StoreError::Query(describe(&e)))?;
        let total: i64 = row.try_get(0).map_err(|e| StoreError::Query(describe(&e)))?;
        Ok(total.max(0) as u64)
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| StoreError::Begin(describe(&e)))
    }

    async fn execute(
        &mut self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<Option<u64>, StoreError> {
        let prepared = self
            .client
            .prepare(statement)
            .await
            .map_err(|e| StoreError::Execute(describe(&e)))?;

        let expected = prepared.params();
        if expected.len() != params.len() {
            return Err(StoreError::Execute(format!(
                "statement expects {} parameters but {} were supplied",
                expected.len(),
                params.len()
            )));
        }

        let bound = expected
            .iter()
            .zip(params)
            .enumerate()
            .map(|(i, (ty, value))| bind_param(i + 1, ty, value))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(PgParam::as_tosql).collect();

        let affected = self
            .client
            .execute(&prepared, &refs)
            .await
            .map_err(|e| StoreError::Execute(describe(&e)))?;
        Ok(Some(affected))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| StoreError::Commit(describe(&e)))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| StoreError::Rollback(describe(&e)))
    }

    async fn cancel(&mut self) -> Result<(), StoreError> {
        self.cancel
            .cancel_query(NoTls)
            .await
            .map_err(|e| StoreError::Cancel(describe(&e)))
    }

    fn discard(&mut self) {
        // The server rolls back any open transaction when the socket closes.
        self.connection.abort();
    }
}

impl PostgresSession {
    /// Column descriptors. Nullability comes from `pg_attribute` for columns
    /// that map to a table column; anything else is reported nullable.
    async fn describe_columns(&self, statement: &Statement) -> Vec<ColumnInfo> {
        let mut columns = Vec::with_capacity(statement.columns().len());
        for column in statement.columns() {
            let nullable = match (column.table_oid(), column.column_id()) {
                (Some(table), Some(attnum)) => {
                    match self.client.query_opt(NULLABILITY_SQL, &[&table, &attnum]).await {
                        Ok(Some(row)) => row.try_get::<_, bool>(0).unwrap_or(true),
                        Ok(None) => true,
                        Err(e) => {
                            warn!("Nullability lookup for {} failed: {}", column.name(), describe(&e));
                            true
                        }
                    }
                }
                _ => true,
            };
            columns.push(ColumnInfo {
                name: column.name().to_string(),
                type_name: column.type_().name().to_uppercase(),
                nullable,
            });
        }
        columns
    }
}

fn describe(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => format!("{}: {} (SQLSTATE {})", db.severity(), db.message(), db.code().code()),
        None => e.to_string(),
    }
}

fn decode_cell(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value, tokio_postgres::Error> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Boolean),
        Type::CHAR => row
            .try_get::<_, Option<i8>>(idx)?
            .map(|v| Value::Integer(v as i64)),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| Value::Integer(v as i64)),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| Value::Integer(v as i64)),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|v| Value::Integer(v as i64)),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| Value::Float(v as f64)),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        // NaN, infinities and more than 28 significant digits do not fit a
        // Decimal; those columns need a ::text cast in the statement.
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Binary),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::Timestamp(v.naive_utc())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| Value::String(v.to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::String)
        }
        _ => row
            .try_get::<_, Option<RawText>>(idx)?
            .map(|v| Value::String(v.0)),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Any column type, read as its raw bytes rendered as text.
struct RawText(String);

impl<'a> FromSql<'a> for RawText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Typed NULL accepted for any parameter type.
#[derive(Debug)]
struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(&self, _: &Type, _: &mut BytesMut) -> Result<IsNull, BoxError> {
        Ok(IsNull::Yes)
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[derive(Debug)]
enum PgParam {
    Null(SqlNull),
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(uuid::Uuid),
}

impl PgParam {
    fn as_tosql(&self) -> &(dyn ToSql + Sync) {
        match self {
            PgParam::Null(value) => value,
            PgParam::Bool(value) => value,
            PgParam::Int2(value) => value,
            PgParam::Int4(value) => value,
            PgParam::Int8(value) => value,
            PgParam::Float4(value) => value,
            PgParam::Float8(value) => value,
            PgParam::Numeric(value) => value,
            PgParam::Text(value) => value,
            PgParam::Bytes(value) => value,
            PgParam::Json(value) => value,
            PgParam::Timestamp(value) => value,
            PgParam::TimestampTz(value) => value,
            PgParam::Date(value) => value,
            PgParam::Uuid(value) => value,
        }
    }
}

/// Converts one JSON parameter to the type the prepared statement expects.
fn bind_param(index: usize, ty: &Type, value: &serde_json::Value) -> Result<PgParam, StoreError> {
    use serde_json::Value as Json;

    let invalid = |reason: String| StoreError::Parameter { index, reason };
    let mismatch = || invalid(format!("cannot bind {value} as {}", ty.name()));

    if value.is_null() {
        return Ok(PgParam::Null(SqlNull));
    }
    let text = || match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    };
    let integer = || -> Option<i64> {
        match value {
            Json::Number(n) => n.as_i64(),
            Json::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };
    let float = || -> Option<f64> {
        match value {
            Json::Number(n) => n.as_f64(),
            Json::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };

    let param = match *ty {
        Type::BOOL => match value {
            Json::Bool(b) => PgParam::Bool(*b),
            Json::String(s) => PgParam::Bool(s.trim().parse().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        },
        Type::INT2 => {
            let v = integer().ok_or_else(mismatch)?;
            PgParam::Int2(i16::try_from(v).map_err(|_| invalid(format!("{v} out of range for int2")))?)
        }
        Type::INT4 => {
            let v = integer().ok_or_else(mismatch)?;
            PgParam::Int4(i32::try_from(v).map_err(|_| invalid(format!("{v} out of range for int4")))?)
        }
        Type::INT8 => PgParam::Int8(integer().ok_or_else(mismatch)?),
        Type::FLOAT4 => PgParam::Float4(float().ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => PgParam::Float8(float().ok_or_else(mismatch)?),
        Type::NUMERIC => PgParam::Numeric(
            text()
                .trim()
                .parse::<Decimal>()
                .map_err(|e| invalid(format!("'{}' is not a decimal number: {e}", text())))?,
        ),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => PgParam::Text(text()),
        Type::BYTEA => PgParam::Bytes(text().into_bytes()),
        Type::JSON | Type::JSONB => PgParam::Json(value.clone()),
        Type::TIMESTAMP => PgParam::Timestamp(parse_timestamp(&text()).ok_or_else(mismatch)?),
        Type::TIMESTAMPTZ => PgParam::TimestampTz(
            DateTime::parse_from_rfc3339(text().trim())
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| parse_timestamp(&text()).map(|naive| naive.and_utc()).ok_or(()))
                .map_err(|_| mismatch())?,
        ),
        Type::DATE => PgParam::Date(
            NaiveDate::parse_from_str(text().trim(), "%Y-%m-%d").map_err(|_| mismatch())?,
        ),
        Type::UUID => PgParam::Uuid(uuid::Uuid::parse_str(text().trim()).map_err(|_| mismatch())?),
        _ => {
            return Err(invalid(format!(
                "unsupported parameter type {}, cast the placeholder to text",
                ty.name()
            )));
        }
    };
    Ok(param)
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    let text = text.trim();
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}
