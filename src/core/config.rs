use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::info;

pub const TOKEN_ENV: &str = "QUERY_AGENT_TOKEN";
pub const COORDINATOR_URL_ENV: &str = "QUERY_AGENT_COORDINATOR_URL";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentIdentity,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity presented to the coordinator at registration. Fixed for the
/// lifetime of the process.
#[derive(Clone, Deserialize, Default)]
pub struct AgentIdentity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub token: String,
}

impl fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_reconnect_interval", with = "duration")]
    pub reconnect_interval: Duration,

    #[serde(default = "default_heartbeat_interval", with = "duration")]
    pub heartbeat_interval: Duration,

    /// Deadline for a single outbound frame. A write that exceeds it tears
    /// the connection down.
    #[serde(default = "default_write_timeout", with = "duration")]
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,

    #[serde(default = "default_query_timeout", with = "duration")]
    pub query_timeout: Duration,

    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_rows() -> u64 {
    100_000
}
fn default_query_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_max_concurrent_queries() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_interval: default_reconnect_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            write_timeout: default_write_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            query_timeout: default_query_timeout(),
            max_concurrent_queries: default_max_concurrent_queries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Loaded config: agent={}, coordinator={}, max_rows={}, query_timeout={:?}, max_concurrent_queries={}",
            config.agent.id,
            config.coordinator.url,
            config.limits.max_rows,
            config.limits.query_timeout,
            config.limits.max_concurrent_queries
        );
        Ok(config)
    }

    /// Parses YAML and replaces zero-valued settings with their defaults.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    /// Applies environment overrides. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |key| lookup(key).filter(|v: &String| !v.trim().is_empty());
        if let Some(token) = set(TOKEN_ENV) {
            self.agent.token = token;
        }
        if let Some(url) = set(COORDINATOR_URL_ENV) {
            self.coordinator.url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.id.trim().is_empty() {
            bail!("agent.id is required");
        }
        if self.coordinator.url.trim().is_empty() {
            bail!("coordinator.url is required");
        }
        let url = url::Url::parse(&self.coordinator.url)
            .with_context(|| format!("coordinator.url is not a valid URL: {}", self.coordinator.url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!(
                "coordinator.url must use ws:// or wss://, got {}://",
                url.scheme()
            );
        }
        Ok(())
    }

    fn normalize(&mut self) {
        if self.agent.name.trim().is_empty() {
            self.agent.name = self.agent.id.clone();
        }
        if self.limits.max_rows == 0 {
            self.limits.max_rows = default_max_rows();
        }
        if self.limits.query_timeout.is_zero() {
            self.limits.query_timeout = default_query_timeout();
        }
        if self.limits.max_concurrent_queries == 0 {
            self.limits.max_concurrent_queries = default_max_concurrent_queries();
        }
        if self.coordinator.reconnect_interval.is_zero() {
            self.coordinator.reconnect_interval = default_reconnect_interval();
        }
        if self.coordinator.heartbeat_interval.is_zero() {
            self.coordinator.heartbeat_interval = default_heartbeat_interval();
        }
        if self.coordinator.write_timeout.is_zero() {
            self.coordinator.write_timeout = default_write_timeout();
        }
        if self.logging.level.trim().is_empty() {
            self.logging.level = default_log_level();
        }
    }
}

/// Durations written either as whole seconds (`30`) or as unit strings
/// (`"500ms"`, `"10m"`, `"1m30s"`).
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(de::Error::custom),
        }
    }

    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty duration".to_string());
        }
        if let Ok(secs) = text.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let mut total = Duration::ZERO;
        let mut rest = text;
        while !rest.is_empty() {
            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            if digits == 0 {
                return Err(format!("invalid duration '{text}'"));
            }
            let amount: u64 = rest[..digits]
                .parse()
                .map_err(|_| format!("invalid duration '{text}'"))?;
            rest = &rest[digits..];

            let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
            let invalid = || format!("invalid duration '{text}'");
            let part = match &rest[..unit_len] {
                "ms" => Duration::from_millis(amount),
                "s" => Duration::from_secs(amount),
                "m" => Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?),
                "h" => Duration::from_secs(amount.checked_mul(3600).ok_or_else(invalid)?),
                unit => return Err(format!("unknown duration unit '{unit}' in '{text}'")),
            };
            total = total.checked_add(part).ok_or_else(invalid)?;
            rest = &rest[unit_len..];
        }
        Ok(total)
    }
}
