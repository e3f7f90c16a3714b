pub mod pipeline;
pub mod postgres;
pub mod sap;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::config::LimitsConfig;
use crate::core::protocol::{DatasourceInfo, QueryKind, QueryResult, codes};

pub use pipeline::{PageWindow, SqlExecutor};
pub use postgres::PostgresDriver;
pub use sap::SapDriver;
pub use store::{RowSet, StoreDriver, StoreError, StoreSession, Transaction};

/// Faults that keep a job from producing a `query_result` at all.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Unsupported datasource type: {0}")]
    UnsupportedStoreType(String),
    #[error("Invalid query type '{0}': must be select, insert, update, or delete")]
    InvalidQueryKind(String),
    #[error("DML operations are not supported for {0}")]
    MutationNotSupported(String),
}

impl ExecutorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedStoreType(_) => codes::UNSUPPORTED_DATASOURCE,
            Self::InvalidQueryKind(_) => codes::INVALID_QUERY_TYPE,
            Self::MutationNotSupported(_) => codes::DML_NOT_SUPPORTED,
        }
    }
}

/// Runs jobs against one kind of target store.
#[async_trait]
pub trait Executor: Send + Sync {
    fn store_type(&self) -> &'static str;

    fn supports_mutation(&self) -> bool {
        false
    }

    async fn execute_read(
        &self,
        datasource: &DatasourceInfo,
        statement: &str,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> QueryResult;

    async fn execute_mutation(
        &self,
        _datasource: &DatasourceInfo,
        _kind: QueryKind,
        _statement: &str,
        _params: &[serde_json::Value],
    ) -> Result<QueryResult, ExecutorError> {
        Err(ExecutorError::MutationNotSupported(self.store_type().to_string()))
    }
}

/// Maps store type tags to executors. Holds no connections.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Registry with every built-in backend.
    pub fn new(limits: &LimitsConfig) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SqlExecutor::new(
            Arc::new(PostgresDriver),
            limits.clone(),
        )));
        registry.register(Arc::new(SqlExecutor::new(
            Arc::new(SapDriver),
            limits.clone(),
        )));
        registry
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors
            .insert(executor.store_type().to_ascii_lowercase(), executor);
    }

    pub fn resolve(&self, store_type: &str) -> Result<Arc<dyn Executor>, ExecutorError> {
        self.executors
            .get(&store_type.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ExecutorError::UnsupportedStoreType(store_type.to_string()))
    }

    pub fn store_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
