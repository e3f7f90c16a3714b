//! Coordinator wire protocol: JSON envelopes tagged by a `type` field.
//!
//! Inbound frames are decoded in two steps. The `type` header is read first
//! so a frame with a malformed payload can still be attributed and logged.

mod value;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use value::{Row, Value};

/// Value sent as `agent_type` in the registration frame.
pub const AGENT_TYPE: &str = "query";

/// Machine-readable codes carried by `error` envelopes.
pub mod codes {
    pub const UNSUPPORTED_DATASOURCE: &str = "UNSUPPORTED_DATASOURCE";
    pub const INVALID_QUERY_TYPE: &str = "INVALID_QUERY_TYPE";
    pub const DML_NOT_SUPPORTED: &str = "DML_NOT_SUPPORTED";
    pub const AGENT_BUSY: &str = "AGENT_BUSY";
    pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Header {
    #[serde(rename = "type", default)]
    kind: String,
}

/// Messages the coordinator sends to the agent.
#[derive(Debug)]
pub enum CoordinatorMessage {
    Registered(RegisteredMessage),
    QueryRequest(QueryRequest),
    Ping,
    Pong,
    Unknown(String),
}

impl CoordinatorMessage {
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let header: Header = serde_json::from_str(frame).map_err(DecodeError::Envelope)?;
        let payload = |source| DecodeError::Payload {
            kind: header.kind.clone(),
            source,
        };
        let message = match header.kind.as_str() {
            "registered" => Self::Registered(serde_json::from_str(frame).map_err(payload)?),
            "query_request" => Self::QueryRequest(serde_json::from_str(frame).map_err(payload)?),
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => Self::Unknown(other.to_string()),
        };
        Ok(message)
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Registered(_) => "registered",
            Self::QueryRequest(_) => "query_request",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown(kind) => kind,
        }
    }
}

/// Messages the agent sends to the coordinator.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Register(RegisterMessage),
    Heartbeat(HeartbeatMessage),
    QueryResult(QueryResult),
    Error(ErrorMessage),
    Pong,
}

impl AgentMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Heartbeat(_) => "heartbeat",
            Self::QueryResult(_) => "query_result",
            Self::Error(_) => "error",
            Self::Pong => "pong",
        }
    }
}

#[derive(Clone, Serialize)]
pub struct RegisterMessage {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_type: String,
    pub token: String,
}

impl fmt::Debug for RegisterMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterMessage")
            .field("agent_id", &self.agent_id)
            .field("agent_name", &self.agent_name)
            .field("agent_type", &self.agent_type)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredMessage {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl RegisteredMessage {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatMessage {
    pub agent_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub code: String,
    pub message: String,
}

/// Kind of job carried by a `query_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
}

impl QueryKind {
    /// Parses the wire tag. An empty tag means `select`; `read` is an alias.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "" | "select" | "read" => Some(Self::Select),
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Select)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job description of the store a query runs against. Never cached.
#[derive(Clone, Default, Deserialize)]
pub struct DatasourceInfo {
    /// Coordinator-side identifier. Numeric on current coordinators, kept
    /// as raw JSON so string ids decode too.
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(rename = "type", default)]
    pub store_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl DatasourceInfo {
    /// Database qualifier, preferring `database_name` over `database`.
    pub fn database(&self) -> Option<&str> {
        [&self.database_name, &self.database]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
    }

    pub fn endpoint(&self) -> String {
        match self.database() {
            Some(db) => format!("{}:{}/{}", self.host, self.port, db),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Debug for DatasourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasourceInfo")
            .field("id", &self.id)
            .field("type", &self.store_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub datasource: DatasourceInfo,
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub params: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl QueryRequest {
    pub fn kind(&self) -> Option<QueryKind> {
        QueryKind::parse(self.query_type.as_deref().unwrap_or_default())
    }

    pub fn params(&self) -> &[serde_json::Value] {
        self.params.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
    pub total_rows: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub request_id: String,
    pub success: bool,
    pub query_type: QueryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    pub fn failed(kind: QueryKind, error: impl fmt::Display, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            query_type: kind,
            error: Some(error.to_string()),
            execution_time_ms,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_query_request() {
        let frame = r#"{
            "type": "query_request",
            "request_id": "req-1",
            "datasource": {"id": 42, "type": "postgres", "host": "db", "port": 5432,
                           "database_name": "sales", "username": "u", "password": "p"},
            "query_type": "update",
            "query": "UPDATE t SET a = $1",
            "params": [1],
            "page": 2,
            "limit": 50
        }"#;

        let CoordinatorMessage::QueryRequest(req) = CoordinatorMessage::decode(frame).unwrap() else {
            panic!("expected query_request");
        };
        assert_eq!(req.request_id, "req-1");
        assert_eq!(req.kind(), Some(QueryKind::Update));
        assert_eq!(req.datasource.database(), Some("sales"));
        assert_eq!(req.datasource.id, serde_json::json!(42));
        assert_eq!(req.params().len(), 1);
        assert_eq!((req.page, req.limit), (Some(2), Some(50)));
    }

    #[test]
    fn datasource_id_may_be_a_string_or_absent() {
        let with_string: DatasourceInfo =
            serde_json::from_str(r#"{"id": "ds-7", "type": "sap"}"#).unwrap();
        assert_eq!(with_string.id, "ds-7");

        let without: DatasourceInfo = serde_json::from_str(r#"{"type": "sap"}"#).unwrap();
        assert!(without.id.is_null());
    }

    #[test]
    fn header_survives_malformed_payload() {
        let err = CoordinatorMessage::decode(r#"{"type":"query_request","datasource":7}"#)
            .unwrap_err();
        match err {
            DecodeError::Payload { kind, .. } => assert_eq!(kind, "query_request"),
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            CoordinatorMessage::decode("not json"),
            Err(DecodeError::Envelope(_))
        ));
    }

    #[test]
    fn unknown_and_bare_messages() {
        assert!(matches!(
            CoordinatorMessage::decode(r#"{"type":"ping"}"#).unwrap(),
            CoordinatorMessage::Ping
        ));
        let msg = CoordinatorMessage::decode(r#"{"type":"rebalance","x":1}"#).unwrap();
        assert_eq!(msg.kind(), "rebalance");
    }

    #[test]
    fn query_kind_defaults_and_aliases() {
        assert_eq!(QueryKind::parse(""), Some(QueryKind::Select));
        assert_eq!(QueryKind::parse("READ"), Some(QueryKind::Select));
        assert_eq!(QueryKind::parse("Delete"), Some(QueryKind::Delete));
        assert_eq!(QueryKind::parse("merge"), None);
        assert_eq!(QueryRequest::default().kind(), Some(QueryKind::Select));
    }

    #[test]
    fn database_falls_back_to_legacy_field() {
        let ds = DatasourceInfo {
            host: "db".into(),
            port: 5432,
            database_name: Some("  ".into()),
            database: Some("legacy".into()),
            ..DatasourceInfo::default()
        };
        assert_eq!(ds.database(), Some("legacy"));
        assert_eq!(ds.endpoint(), "db:5432/legacy");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let ds = DatasourceInfo {
            password: "hunter2".into(),
            ..DatasourceInfo::default()
        };
        assert!(!format!("{ds:?}").contains("hunter2"));

        let reg = RegisterMessage {
            agent_id: "a".into(),
            agent_name: "n".into(),
            agent_type: AGENT_TYPE.into(),
            token: "s3cret".into(),
        };
        assert!(!format!("{reg:?}").contains("s3cret"));
    }

    #[test]
    fn failed_result_omits_data_fields() {
        let mut result = QueryResult::failed(QueryKind::Insert, "boom", 12);
        result.request_id = "r9".into();
        let json = serde_json::to_value(AgentMessage::QueryResult(result)).unwrap();

        assert_eq!(json["type"], "query_result");
        assert_eq!(json["request_id"], "r9");
        assert_eq!(json["success"], false);
        assert_eq!(json["query_type"], "insert");
        assert_eq!(json["error"], "boom");
        assert_eq!(json["execution_time_ms"], 12);
        assert!(json.get("data").is_none());
        assert!(json.get("affected_rows").is_none());
    }

    #[test]
    fn outbound_envelopes_are_tagged() {
        let pong = AgentMessage::Pong.encode().unwrap();
        assert_eq!(pong, r#"{"type":"pong"}"#);

        let err = AgentMessage::Error(ErrorMessage {
            request_id: None,
            code: codes::AGENT_BUSY.into(),
            message: "busy".into(),
        });
        let json: serde_json::Value = serde_json::from_str(&err.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "error");
        assert!(json.get("request_id").is_none());
    }
}
