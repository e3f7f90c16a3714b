//! SAP HANA backend over `hdbconnect_async`.
//!
//! Every job opens its own connection. HANA has no session-level cancel
//! request here, so a timed-out statement is abandoned with the socket.

use async_trait::async_trait;
use hdbconnect_async::{ConnectParams, Connection, HdbError, HdbValue};
use tracing::debug;

use super::store::{RowSet, StoreDriver, StoreError, StoreSession};
use crate::core::protocol::{ColumnInfo, DatasourceInfo, Row, Value};

pub struct SapDriver;

#[async_trait]
impl StoreDriver for SapDriver {
    fn store_type(&self) -> &'static str {
        "sap"
    }

    async fn open(&self, datasource: &DatasourceInfo) -> Result<Box<dyn StoreSession>, StoreError> {
        let mut builder = ConnectParams::builder();
        builder
            .hostname(datasource.host.as_str())
            .port(datasource.port)
            .dbuser(datasource.username.as_str())
            .password(datasource.password.as_str());
        // Multitenant systems route by tenant name.
        if let Some(db) = datasource.database() {
            builder.dbname(db);
        }
        let params = builder.build().map_err(|e| StoreError::Connect(describe(&e)))?;

        let connection = Connection::new(params)
            .await
            .map_err(|e| StoreError::Connect(describe(&e)))?;
        debug!("Opened HANA session to {}", datasource.endpoint());
        Ok(Box::new(SapSession {
            connection: Some(connection),
        }))
    }
}

struct SapSession {
    connection: Option<Connection>,
}

impl SapSession {
    fn connection(&mut self) -> Result<&mut Connection, StoreError> {
        self.connection
            .as_mut()
            .ok_or_else(|| StoreError::Query("session was discarded".into()))
    }
}

#[async_trait]
impl StoreSession for SapSession {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.connection()?
            .query("SELECT 1 FROM DUMMY")
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Probe(describe(&e)))
    }

    async fn fetch(&mut self, statement: &str) -> Result<RowSet, StoreError> {
        let result_set = self
            .connection()?
            .query(statement)
            .await
            .map_err(|e| StoreError::Query(describe(&e)))?;

        let metadata = result_set.metadata();
        let columns: Vec<ColumnInfo> = metadata
            .iter()
            .map(|field| ColumnInfo {
                name: field.displayname().to_string(),
                type_name: format!("{:?}", field.type_id()),
                nullable: field.is_nullable(),
            })
            .collect();

        let rows = result_set
            .into_rows()
            .await
            .map_err(|e| StoreError::Query(describe(&e)))?;
        let mut out = Vec::new();
        for mut row in rows {
            let mut cells = Row::with_capacity(columns.len());
            for column in &columns {
                let value = row.next_value().ok_or_else(|| StoreError::Column {
                    name: column.name.clone(),
                    reason: "row ended early".into(),
                })?;
                cells.push(&column.name, cell_value(value));
            }
            out.push(cells);
        }

        Ok(RowSet { columns, rows: out })
    }

    async fn count(&mut self, statement: &str) -> Result<u64, StoreError> {
        let result_set = self
            .connection()?
            .query(statement)
            .await
            .map_err(|e| StoreError::Query(describe(&e)))?;
        let mut rows = result_set
            .into_rows()
            .await
            .map_err(|e| StoreError::Query(describe(&e)))?;
        rows.next()
            .and_then(|mut row| row.next_value())
            .and_then(count_value)
            .ok_or_else(|| StoreError::Query("count returned no integer".into()))
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        // hdbconnect_async 0.28: set_auto_commit is infallible (returns ()).
        self.connection()?.set_auto_commit(false).await;
        Ok(())
    }

    async fn execute(
        &mut self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<Option<u64>, StoreError> {
        let connection = self.connection()?;
        if params.is_empty() {
            let affected = connection
                .dml(statement)
                .await
                .map_err(|e| StoreError::Execute(describe(&e)))?;
            return Ok(Some(affected as u64));
        }

        let mut prepared = connection
            .prepare(statement)
            .await
            .map_err(|e| StoreError::Execute(describe(&e)))?;
        let values = params.iter().map(param_value).collect();
        let response = prepared
            .execute_row(values)
            .await
            .map_err(|e| StoreError::Execute(describe(&e)))?;
        let affected = response
            .into_affected_rows()
            .map_err(|e| StoreError::Execute(describe(&e)))?;
        Ok(Some(affected.iter().sum::<usize>() as u64))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.connection()?
            .commit()
            .await
            .map_err(|e| StoreError::Commit(describe(&e)))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.connection()?
            .rollback()
            .await
            .map_err(|e| StoreError::Rollback(describe(&e)))
    }

    fn discard(&mut self) {
        // The server rolls back open work when the connection goes away.
        self.connection.take();
    }
}

fn cell_value(value: HdbValue<'static>) -> Value {
    match value {
        HdbValue::NULL => Value::Null,
        HdbValue::TINYINT(v) => Value::Integer(i64::from(v)),
        HdbValue::SMALLINT(v) => Value::Integer(i64::from(v)),
        HdbValue::INT(v) => Value::Integer(i64::from(v)),
        HdbValue::BIGINT(v) => Value::Integer(v),
        HdbValue::REAL(v) => Value::Float(f64::from(v)),
        HdbValue::DOUBLE(v) => Value::Float(v),
        HdbValue::BOOLEAN(v) => Value::Boolean(v),
        HdbValue::STRING(v) => Value::String(v),
        HdbValue::BINARY(v) => Value::Binary(v),
        // DECIMAL keeps its exact digits; dates render in HANA's format.
        other => Value::String(other.to_string()),
    }
}

fn count_value(value: HdbValue<'static>) -> Option<u64> {
    match value {
        HdbValue::BIGINT(n) => u64::try_from(n).ok(),
        HdbValue::INT(n) => u64::try_from(n).ok(),
        other => other.to_string().parse().ok(),
    }
}

fn param_value(value: &serde_json::Value) -> HdbValue<'static> {
    match value {
        serde_json::Value::Null => HdbValue::NULL,
        serde_json::Value::Bool(b) => HdbValue::BOOLEAN(*b),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => HdbValue::BIGINT(i),
            (None, Some(f)) => HdbValue::DOUBLE(f),
            (None, None) => HdbValue::STRING(n.to_string()),
        },
        serde_json::Value::String(s) => HdbValue::STRING(s.clone()),
        nested => HdbValue::STRING(nested.to_string()),
    }
}

fn describe(e: &HdbError) -> String {
    e.to_string()
}
