use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::connection::{JobHandler, Outbox};
use crate::core::executor::{Executor, ExecutorError, ExecutorRegistry};
use crate::core::protocol::{QueryKind, QueryRequest, QueryResult};

/// Turns admitted `query_request`s into results using the executor registry.
pub struct QueryService {
    registry: Arc<ExecutorRegistry>,
}

impl QueryService {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self { registry }
    }

    /// Runs one request. `Err` means no result can be attributed and an
    /// `error` envelope with the error's code is sent instead.
    pub async fn execute(&self, request: &QueryRequest) -> Result<QueryResult, ExecutorError> {
        let executor = self.registry.resolve(&request.datasource.store_type)?;
        let kind = request.kind().ok_or_else(|| {
            ExecutorError::InvalidQueryKind(request.query_type.clone().unwrap_or_default())
        })?;

        let mut result = if kind.is_mutation() {
            if !executor.supports_mutation() {
                return Err(ExecutorError::MutationNotSupported(
                    executor.store_type().to_string(),
                ));
            }
            executor
                .execute_mutation(&request.datasource, kind, &request.query, request.params())
                .await?
        } else {
            executor
                .execute_read(&request.datasource, &request.query, request.page, request.limit)
                .await
        };

        result.request_id = request.request_id.clone();
        Ok(result)
    }
}

#[async_trait]
impl JobHandler for QueryService {
    async fn handle(&self, request: QueryRequest, outbox: Outbox) {
        info!(
            "[{}] Processing {} request for {} datasource {}",
            request.request_id,
            request.query_type.as_deref().unwrap_or(QueryKind::Select.as_str()),
            request.datasource.store_type,
            request.datasource.endpoint()
        );

        match self.execute(&request).await {
            Ok(result) => {
                let (kind, elapsed, success) =
                    (result.query_type, result.execution_time_ms, result.success);
                let rows = result.data.as_ref().map_or(0, Vec::len);
                let affected = result.affected_rows.unwrap_or(0);
                outbox.send_result(result).await;

                if !success {
                    warn!("[{}] {} failed after {}ms", request.request_id, kind, elapsed);
                } else if kind.is_mutation() {
                    info!(
                        "[{}] {} completed in {}ms, {} rows affected",
                        request.request_id, kind, elapsed, affected
                    );
                } else {
                    info!(
                        "[{}] Query completed in {}ms, {} rows returned",
                        request.request_id, elapsed, rows
                    );
                }
            }
            Err(e) => {
                warn!("[{}] Rejected: {}", request.request_id, e);
                outbox
                    .send_error(Some(&request.request_id), e.code(), &e.to_string())
                    .await;
            }
        }
    }
}
