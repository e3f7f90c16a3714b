#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use query_agent::core::config::{
    AgentIdentity, Config, CoordinatorConfig, LimitsConfig, LoggingConfig,
};
use query_agent::core::connection::transport::Link;
use query_agent::core::connection::{Dialer, FrameSink, FrameSource, TransportError};
use query_agent::core::executor::{RowSet, StoreDriver, StoreError, StoreSession};
use query_agent::core::protocol::{ColumnInfo, DatasourceInfo, Row, Value};
use rusqlite::types::ValueRef;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

// ---------------------------------------------------------------------------
// SQLite-backed store driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SqliteOptions {
    pub fail_count: bool,
    pub panic_on_execute: bool,
    pub unknown_affected: bool,
    pub execute_delay: Option<Duration>,
    pub fetch_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct SqliteStats {
    pub opens: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub discards: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl SqliteStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn discards(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

/// Store driver over a SQLite file named by the datasource's database field.
pub struct SqliteDriver {
    pub options: SqliteOptions,
    pub stats: Arc<SqliteStats>,
}

impl SqliteDriver {
    pub fn new(options: SqliteOptions) -> Self {
        Self {
            options,
            stats: Arc::new(SqliteStats::default()),
        }
    }
}

#[async_trait]
impl StoreDriver for SqliteDriver {
    fn store_type(&self) -> &'static str {
        "sqlite"
    }

    async fn open(&self, datasource: &DatasourceInfo) -> Result<Box<dyn StoreSession>, StoreError> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let path = datasource
            .database()
            .ok_or_else(|| StoreError::Connect("no database file".into()))?;
        let conn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
        )
        .map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(Box::new(SqliteSession {
            conn,
            options: self.options.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct SqliteSession {
    conn: rusqlite::Connection,
    options: SqliteOptions,
    stats: Arc<SqliteStats>,
}

impl SqliteSession {
    fn fetch_now(&self, statement: &str) -> Result<RowSet, StoreError> {
        let query_err = |e: rusqlite::Error| StoreError::Query(e.to_string());
        let mut stmt = self.conn.prepare(statement).map_err(query_err)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query([]).map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(query_err)? {
            let mut cells = Row::with_capacity(names.len());
            for (i, name) in names.iter().enumerate() {
                let value = match row.get_ref(i).map_err(query_err)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) => Value::Integer(v),
                    ValueRef::Real(v) => Value::Float(v),
                    ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => Value::Binary(b.to_vec()),
                };
                cells.push(name.clone(), value);
            }
            out.push(cells);
        }

        let columns = names
            .iter()
            .map(|name| ColumnInfo {
                name: name.clone(),
                type_name: out
                    .first()
                    .and_then(|row: &Row| row.get(name))
                    .map_or("NULL", Value::type_name)
                    .to_string(),
                nullable: true,
            })
            .collect();
        Ok(RowSet { columns, rows: out })
    }

    fn execute_now(&self, statement: &str, params: &[serde_json::Value]) -> Result<usize, StoreError> {
        let values: Vec<rusqlite::types::Value> = params.iter().map(to_sqlite).collect();
        self.conn
            .execute(statement, rusqlite::params_from_iter(values))
            .map_err(|e| StoreError::Execute(e.to_string()))
    }
}

fn to_sqlite(value: &serde_json::Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        serde_json::Value::Null => Sql::Null,
        serde_json::Value::Bool(b) => Sql::Integer(*b as i64),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Sql::Integer(i),
            None => Sql::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

#[async_trait]
impl StoreSession for SqliteSession {
    async fn ping(&mut self) -> Result<(), StoreError> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(|e| StoreError::Probe(e.to_string()))
    }

    async fn fetch(&mut self, statement: &str) -> Result<RowSet, StoreError> {
        if let Some(delay) = self.options.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.fetch_now(statement)
    }

    async fn count(&mut self, statement: &str) -> Result<u64, StoreError> {
        if self.options.fail_count {
            return Err(StoreError::Query("count unavailable".into()));
        }
        self.conn
            .query_row(statement, [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("BEGIN")
            .map_err(|e| StoreError::Begin(e.to_string()))
    }

    async fn execute(
        &mut self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<Option<u64>, StoreError> {
        if let Some(delay) = self.options.execute_delay {
            tokio::time::sleep(delay).await;
        }
        let affected = self.execute_now(statement, params)?;
        if self.options.panic_on_execute {
            panic!("simulated driver fault after writing {affected} rows");
        }
        if self.options.unknown_affected {
            return Ok(None);
        }
        Ok(Some(affected as u64))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| StoreError::Commit(e.to_string()))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| StoreError::Rollback(e.to_string()))
    }

    async fn cancel(&mut self) -> Result<(), StoreError> {
        self.stats.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn discard(&mut self) {
        self.stats.discards.fetch_add(1, Ordering::SeqCst);
        let _ = self.conn.execute_batch("ROLLBACK");
    }
}

/// Throwaway SQLite file with an `items(id, name, qty, payload)` table.
pub struct SqliteFixture {
    _dir: TempDir,
    pub path: PathBuf,
}

impl SqliteFixture {
    pub fn with_items(count: i64) -> TestResult<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("items.db");
        let conn = rusqlite::Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, qty INTEGER, payload BLOB);",
        )?;
        for id in 1..=count {
            conn.execute(
                "INSERT INTO items (id, name, qty, payload) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, format!("item-{id}"), id * 10, b"blob".to_vec()],
            )?;
        }
        Ok(Self { _dir: dir, path })
    }

    pub fn datasource(&self) -> DatasourceInfo {
        datasource_for(&self.path)
    }

    pub fn query_i64(&self, sql: &str) -> TestResult<i64> {
        let conn = rusqlite::Connection::open(&self.path)?;
        Ok(conn.query_row(sql, [], |row| row.get(0))?)
    }

    pub fn query_text(&self, sql: &str) -> TestResult<String> {
        let conn = rusqlite::Connection::open(&self.path)?;
        Ok(conn.query_row(sql, [], |row| row.get(0))?)
    }
}

pub fn datasource_for(path: &Path) -> DatasourceInfo {
    DatasourceInfo {
        id: serde_json::json!(7),
        store_type: "sqlite".into(),
        host: "localhost".into(),
        port: 0,
        database_name: Some(path.display().to_string()),
        database: None,
        username: "tester".into(),
        password: "secret".into(),
    }
}

pub fn limits(max_rows: u64, query_timeout: Duration) -> LimitsConfig {
    LimitsConfig {
        max_rows,
        query_timeout,
        max_concurrent_queries: 10,
    }
}

// ---------------------------------------------------------------------------
// In-memory coordinator transport
// ---------------------------------------------------------------------------

/// Coordinator side of one in-memory connection.
pub struct Peer {
    /// Frames to deliver to the agent. Dropping it ends the agent's stream.
    pub to_agent: mpsc::UnboundedSender<String>,
    /// Complete frames written by the agent, in write order.
    pub from_agent: mpsc::UnboundedReceiver<String>,
    /// Raw bytes as written by the agent's sink, frames separated by '\n'.
    pub wire: Arc<Mutex<Vec<u8>>>,
}

impl Peer {
    pub fn send(&self, frame: &str) {
        let _ = self.to_agent.send(frame.to_string());
    }

    /// Next agent frame that is not a heartbeat, parsed as JSON.
    pub async fn next_json(&mut self) -> TestResult<serde_json::Value> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.from_agent.recv())
                .await?
                .ok_or("agent closed the connection")?;
            let json: serde_json::Value = serde_json::from_str(&frame)?;
            if json["type"] != "heartbeat" {
                return Ok(json);
            }
        }
    }

    pub fn wire_frames(&self) -> Vec<String> {
        let wire = self.wire.lock().unwrap();
        String::from_utf8_lossy(&wire)
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Dialer that refuses the first `refusals` attempts and hands every
/// accepted connection's coordinator side to the test.
pub struct MemoryDialer {
    refusals: AtomicUsize,
    chunk: usize,
    chunk_delay: Option<Duration>,
    stall_after: Option<usize>,
    attempts: Mutex<Vec<Instant>>,
    peers: mpsc::UnboundedSender<Peer>,
}

impl MemoryDialer {
    pub fn new(refusals: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        Self::with_slow_writer(refusals, usize::MAX, None)
    }

    /// Every frame is written `chunk` bytes at a time with `delay` between
    /// chunks, so unserialized writers would interleave on the wire.
    pub fn with_slow_writer(
        refusals: usize,
        chunk: usize,
        delay: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            refusals: AtomicUsize::new(refusals),
            chunk: chunk.max(1),
            chunk_delay: delay,
            stall_after: None,
            attempts: Mutex::new(Vec::new()),
            peers,
        });
        (dialer, rx)
    }

    /// Every connection writes `frames` frames, then blocks forever on the
    /// next write and on close, like a peer that stopped reading.
    pub fn with_stalled_writer(frames: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            refusals: AtomicUsize::new(0),
            chunk: usize::MAX,
            chunk_delay: None,
            stall_after: Some(frames),
            attempts: Mutex::new(Vec::new()),
            peers,
        });
        (dialer, rx)
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, url: &str) -> Result<Link, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Dial {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }

        let (to_agent, inbound) = mpsc::unbounded_channel();
        let (outbound, from_agent) = mpsc::unbounded_channel();
        let wire = Arc::new(Mutex::new(Vec::new()));

        let sink = MemorySink {
            outbound: Some(outbound),
            wire: Arc::clone(&wire),
            chunk: self.chunk,
            delay: self.chunk_delay,
            stall_after: self.stall_after,
            written: 0,
        };
        let source = MemorySource { inbound };
        let _ = self.peers.send(Peer {
            to_agent,
            from_agent,
            wire,
        });
        Ok((Box::new(sink), Box::new(source)))
    }
}

struct MemorySink {
    outbound: Option<mpsc::UnboundedSender<String>>,
    wire: Arc<Mutex<Vec<u8>>>,
    chunk: usize,
    delay: Option<Duration>,
    stall_after: Option<usize>,
    written: usize,
}

impl MemorySink {
    fn stalled(&self) -> bool {
        self.stall_after.is_some_and(|limit| self.written >= limit)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.outbound.is_none() {
            return Err(TransportError::Closed);
        }
        if self.stalled() {
            std::future::pending::<()>().await;
        }
        self.written += 1;
        for piece in frame.as_bytes().chunks(self.chunk) {
            self.wire.lock().unwrap().extend_from_slice(piece);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }
        self.wire.lock().unwrap().push(b'\n');

        match &self.outbound {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| TransportError::Send("peer gone".into())),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.stalled() {
            std::future::pending::<()>().await;
        }
        self.outbound = None;
        Ok(())
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }
}

pub fn agent_config(
    url: &str,
    reconnect_interval: Duration,
    max_concurrent_queries: usize,
) -> Config {
    Config {
        agent: AgentIdentity {
            id: "agent-test".into(),
            name: "Test Agent".into(),
            token: "token-123".into(),
        },
        coordinator: CoordinatorConfig {
            url: url.into(),
            reconnect_interval,
            heartbeat_interval: Duration::from_secs(3600),
            write_timeout: Duration::from_secs(10),
        },
        limits: LimitsConfig {
            max_rows: 1000,
            query_timeout: Duration::from_secs(30),
            max_concurrent_queries,
        },
        logging: LoggingConfig::default(),
    }
}

pub fn query_request(request_id: &str, store_type: &str, database: &str, query: &str) -> String {
    serde_json::json!({
        "type": "query_request",
        "request_id": request_id,
        "datasource": {
            "id": 42,
            "type": store_type,
            "host": "localhost",
            "port": 0,
            "database_name": database,
            "username": "tester",
            "password": "secret"
        },
        "query": query,
        "page": 1,
        "limit": 100
    })
    .to_string()
}
