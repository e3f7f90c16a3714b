//! Backend-facing seam of the executor: one driver per store type, one
//! ephemeral session per job.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::core::protocol::{ColumnInfo, DatasourceInfo, Row};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Connection failed: {0}")]
    Probe(String),
    #[error("Query failed: {0}")]
    Query(String),
    #[error("Failed to get column {name}: {reason}")]
    Column { name: String, reason: String },
    #[error("Failed to begin transaction: {0}")]
    Begin(String),
    #[error("{0}")]
    Execute(String),
    #[error("Failed to commit transaction: {0}")]
    Commit(String),
    #[error("Failed to rollback transaction: {0}")]
    Rollback(String),
    #[error("Failed to cancel statement: {0}")]
    Cancel(String),
    #[error("invalid parameter ${index}: {reason}")]
    Parameter { index: usize, reason: String },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Columns and materialized rows of one read.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl RowSet {
    /// Renames repeated column labels (`a`, `a` becomes `a`, `a_2`) so every
    /// row serializes to an object with distinct keys.
    pub fn disambiguate(&mut self) {
        let mut seen = HashSet::with_capacity(self.columns.len());
        let mut renamed = false;
        let labels: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut label = column.name.clone();
                let mut n = 2;
                while !seen.insert(label.clone()) {
                    label = format!("{}_{}", column.name, n);
                    n += 1;
                    renamed = true;
                }
                label
            })
            .collect();
        if !renamed {
            return;
        }

        for (column, label) in self.columns.iter_mut().zip(&labels) {
            column.name.clone_from(label);
        }
        for row in &mut self.rows {
            row.relabel(&labels);
        }
    }
}

/// A live connection to a target store, owned by exactly one job.
///
/// Dropping the session releases the connection. A session dropped with a
/// transaction still open must leave the store to roll it back.
#[async_trait]
pub trait StoreSession: Send {
    /// Liveness probe run right after connecting.
    async fn ping(&mut self) -> Result<(), StoreError>;

    async fn fetch(&mut self, statement: &str) -> Result<RowSet, StoreError>;

    async fn count(&mut self, statement: &str) -> Result<u64, StoreError>;

    async fn begin(&mut self) -> Result<(), StoreError>;

    /// Runs one statement with positional parameters. `None` when the store
    /// cannot report how many rows were affected.
    async fn execute(
        &mut self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<Option<u64>, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Asks the store to stop the statement this session last started.
    /// Called after a timeout dropped the in-flight call on our side.
    async fn cancel(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Abandons the session without awaiting the store, e.g. after a
    /// cancelled or panicked operation left it in an unknown state.
    fn discard(&mut self);
}

/// Opens sessions for one store type and shapes its SQL wrappers.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    fn store_type(&self) -> &'static str;

    async fn open(&self, datasource: &DatasourceInfo) -> Result<Box<dyn StoreSession>, StoreError>;

    fn paginate(&self, statement: &str, limit: u64, offset: u64) -> String {
        format!(
            "SELECT * FROM ({}) AS subquery LIMIT {} OFFSET {}",
            strip_terminator(statement),
            limit,
            offset
        )
    }

    fn count_statement(&self, statement: &str) -> String {
        format!(
            "SELECT COUNT(*) FROM ({}) AS subquery",
            strip_terminator(statement)
        )
    }
}

/// Trailing whitespace and `;` would break the sub-select wrapper.
fn strip_terminator(statement: &str) -> &str {
    statement.trim_end().trim_end_matches(';').trim_end()
}

/// Bounds one store operation by the query timeout.
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            after: limit,
        }),
    }
}

/// Open transaction on a borrowed session. Any exit other than a successful
/// `commit` or `rollback` discards the session on drop.
pub struct Transaction<'s> {
    session: &'s mut dyn StoreSession,
    timeout: Duration,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub async fn begin(session: &'s mut dyn StoreSession, timeout: Duration) -> Result<Self, StoreError> {
        bounded("begin", timeout, session.begin()).await?;
        Ok(Self {
            session,
            timeout,
            finished: false,
        })
    }

    pub fn session(&mut self) -> &mut dyn StoreSession {
        &mut *self.session
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        bounded("commit", self.timeout, self.session.commit()).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), StoreError> {
        bounded("rollback", self.timeout, self.session.rollback()).await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Transaction left open, discarding session");
            self.session.discard();
        }
    }
}
