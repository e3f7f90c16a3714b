//! Read and mutation pipelines shared by every SQL backend.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{error, info, warn};

use super::store::{RowSet, StoreDriver, StoreError, StoreSession, Transaction, bounded};
use super::{Executor, ExecutorError};
use crate::core::config::LimitsConfig;
use crate::core::panic_message;
use crate::core::protocol::{DatasourceInfo, Pagination, QueryKind, QueryResult};

/// Effective page and limit of a read after clamping the caller's hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub page: u64,
    pub limit: u64,
}

impl PageWindow {
    /// `limit` outside `(0, max_rows]` becomes `max_rows`; `page` below 1
    /// becomes 1.
    pub fn normalize(page: Option<i64>, limit: Option<i64>, max_rows: u64) -> Self {
        let limit = match limit {
            Some(l) if l > 0 && (l as u64) <= max_rows => l as u64,
            _ => max_rows,
        };
        let page = match page {
            Some(p) if p > 0 => p as u64,
            _ => 1,
        };
        Self { page, limit }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    pub fn total_pages(&self, total_rows: u64) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        total_rows.div_ceil(self.limit)
    }

    pub fn pagination(&self, total_rows: u64) -> Pagination {
        Pagination {
            page: self.page,
            limit: self.limit,
            total_rows,
            total_pages: self.total_pages(total_rows),
        }
    }
}

/// Executor for any SQL store reachable through a [`StoreDriver`]. Opens a
/// fresh session per job and never keeps it past the job.
pub struct SqlExecutor {
    driver: Arc<dyn StoreDriver>,
    limits: LimitsConfig,
}

impl SqlExecutor {
    pub fn new(driver: Arc<dyn StoreDriver>, limits: LimitsConfig) -> Self {
        Self { driver, limits }
    }

    async fn open(&self, datasource: &DatasourceInfo) -> Result<Box<dyn StoreSession>, StoreError> {
        let timeout = self.limits.query_timeout;
        let mut session = bounded("connect", timeout, self.driver.open(datasource)).await?;
        bounded("ping", timeout, session.ping()).await?;
        Ok(session)
    }

    async fn read(
        &self,
        datasource: &DatasourceInfo,
        statement: &str,
        window: PageWindow,
    ) -> Result<(RowSet, u64), StoreError> {
        let timeout = self.limits.query_timeout;
        let mut session = self.open(datasource).await?;

        let paged = self.driver.paginate(statement, window.limit, window.offset());
        let mut set = match bounded("query", timeout, session.fetch(&paged)).await {
            Err(e @ StoreError::Timeout { .. }) => {
                interrupt(session.as_mut(), timeout).await;
                return Err(e);
            }
            other => other?,
        };
        set.disambiguate();

        let counted = self.driver.count_statement(statement);
        let total_rows = match bounded("count", timeout, session.count(&counted)).await {
            Ok(total) => total,
            Err(e) => {
                if matches!(e, StoreError::Timeout { .. }) {
                    interrupt(session.as_mut(), timeout).await;
                }
                warn!(
                    "Count query failed on {}, using page row count: {}",
                    datasource.endpoint(),
                    e
                );
                set.rows.len() as u64
            }
        };
        Ok((set, total_rows))
    }

    async fn mutate(
        &self,
        datasource: &DatasourceInfo,
        kind: QueryKind,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<u64, StoreError> {
        let timeout = self.limits.query_timeout;
        let mut session = self.open(datasource).await?;
        let mut tx = Transaction::begin(session.as_mut(), timeout).await?;

        let attempt = AssertUnwindSafe(tx.session().execute(statement, params)).catch_unwind();
        let affected = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(Ok(affected))) => affected,
            Ok(Ok(Err(e))) => return Err(abort(tx, kind, e.to_string()).await),
            Ok(Err(panic)) => {
                let cause = format!("panic: {}", panic_message(panic.as_ref()));
                return Err(abort(tx, kind, cause).await);
            }
            Err(_) => {
                interrupt(tx.session(), timeout).await;
                let cause = StoreError::Timeout {
                    operation: "execute",
                    after: timeout,
                };
                return Err(abort(tx, kind, cause.to_string()).await);
            }
        };

        let affected = affected.unwrap_or_else(|| {
            warn!("Could not determine affected rows for {}, reporting 0", kind);
            0
        });

        tx.commit().await?;
        Ok(affected)
    }
}

/// Asks the store to stop a statement whose call already timed out here.
async fn interrupt(session: &mut dyn StoreSession, timeout: Duration) {
    if let Err(e) = bounded("cancel", timeout, session.cancel()).await {
        warn!("Could not cancel timed-out statement: {}", e);
    }
}

/// Rolls back after a failed statement. A rollback failure is logged and the
/// original cause is what the caller sees.
async fn abort(tx: Transaction<'_>, kind: QueryKind, cause: String) -> StoreError {
    if let Err(e) = tx.rollback().await {
        error!("Rollback after failed {} also failed: {}", kind, e);
    }
    StoreError::Execute(format!("{kind} failed: {cause} (transaction rolled back)"))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[async_trait]
impl Executor for SqlExecutor {
    fn store_type(&self) -> &'static str {
        self.driver.store_type()
    }

    fn supports_mutation(&self) -> bool {
        true
    }

    async fn execute_read(
        &self,
        datasource: &DatasourceInfo,
        statement: &str,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> QueryResult {
        let started = Instant::now();
        let window = PageWindow::normalize(page, limit, self.limits.max_rows);

        match self.read(datasource, statement, window).await {
            Ok((set, total_rows)) => {
                info!(
                    "Read on {} returned {} rows (page {}, limit {}, total {})",
                    datasource.endpoint(),
                    set.rows.len(),
                    window.page,
                    window.limit,
                    total_rows
                );
                QueryResult {
                    success: true,
                    query_type: QueryKind::Select,
                    data: Some(set.rows),
                    columns: Some(set.columns),
                    pagination: Some(window.pagination(total_rows)),
                    execution_time_ms: elapsed_ms(started),
                    ..QueryResult::default()
                }
            }
            Err(e) => {
                warn!("Read on {} failed: {}", datasource.endpoint(), e);
                QueryResult::failed(QueryKind::Select, e, elapsed_ms(started))
            }
        }
    }

    async fn execute_mutation(
        &self,
        datasource: &DatasourceInfo,
        kind: QueryKind,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<QueryResult, ExecutorError> {
        let started = Instant::now();

        let result = match self.mutate(datasource, kind, statement, params).await {
            Ok(affected) => {
                info!(
                    "{} on {} affected {} rows",
                    kind,
                    datasource.endpoint(),
                    affected
                );
                QueryResult {
                    success: true,
                    query_type: kind,
                    affected_rows: Some(affected),
                    execution_time_ms: elapsed_ms(started),
                    ..QueryResult::default()
                }
            }
            Err(e) => {
                warn!("{} on {} failed: {}", kind, datasource.endpoint(), e);
                QueryResult::failed(kind, e, elapsed_ms(started))
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped_to_max_rows() {
        assert_eq!(PageWindow::normalize(None, None, 500).limit, 500);
        assert_eq!(PageWindow::normalize(None, Some(0), 500).limit, 500);
        assert_eq!(PageWindow::normalize(None, Some(-3), 500).limit, 500);
        assert_eq!(PageWindow::normalize(None, Some(501), 500).limit, 500);
        assert_eq!(PageWindow::normalize(None, Some(500), 500).limit, 500);
        assert_eq!(PageWindow::normalize(None, Some(20), 500).limit, 20);
    }

    #[test]
    fn page_starts_at_one() {
        let window = PageWindow::normalize(Some(0), Some(10), 100);
        assert_eq!(window.page, 1);
        assert_eq!(window.offset(), 0);

        let window = PageWindow::normalize(Some(-7), Some(10), 100);
        assert_eq!(window.page, 1);

        let window = PageWindow::normalize(Some(4), Some(25), 100);
        assert_eq!(window.offset(), 75);
    }

    #[test]
    fn total_pages_rounds_up() {
        let window = PageWindow { page: 1, limit: 10 };
        assert_eq!(window.total_pages(0), 0);
        assert_eq!(window.total_pages(1), 1);
        assert_eq!(window.total_pages(10), 1);
        assert_eq!(window.total_pages(11), 2);

        let p = window.pagination(95);
        assert_eq!((p.page, p.limit, p.total_rows, p.total_pages), (1, 10, 95, 10));
    }
}
