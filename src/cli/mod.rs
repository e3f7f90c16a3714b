mod terminal;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use tracing::info;

use crate::core::config::{Config, LimitsConfig};
use crate::core::connection::{ConnectionManager, WebSocketDialer};
use crate::core::executor::{Executor, ExecutorRegistry};
use crate::core::protocol::DatasourceInfo;
use crate::core::service::QueryService;
use crate::core::shutdown;
use crate::logging;
use terminal::{HelpSection, print_error, print_info, print_status, print_success};

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yml";
pub const CONFIG_PATH_ENV: &str = "QUERY_AGENT_CONFIG";

const PROBE_LIMIT: i64 = 10;

fn print_help() {
    HelpSection::new("Agent")
        .entry("run [--config <path>]", "Connect to the coordinator and serve queries")
        .print();

    HelpSection::new("Diagnostics")
        .entry(
            "probe --type <t> --host <h> --port <p> --user <u> --password <pw>",
            "Run one read query against a datasource",
        )
        .entry("      [--database <db>] [--query <sql>]", "")
        .entry("help", "Show this message")
        .print();

    println!(
        "\n {} {} [command] [options]\n",
        style("Usage:").bold(),
        style("query-agent").green()
    );
}

/// Config path from `--config`, then `QUERY_AGENT_CONFIG`, then the default.
pub(crate) fn parse_config_flag(args: &[String], start: usize, env: Option<String>) -> PathBuf {
    let mut path = env
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    path = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    PathBuf::from(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProbeArgs {
    pub store_type: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub query: String,
}

pub(crate) fn parse_probe_args(args: &[String], start: usize) -> Result<ProbeArgs> {
    let mut parsed = ProbeArgs {
        store_type: "postgres".to_string(),
        host: String::new(),
        port: 5432,
        user: String::new(),
        password: String::new(),
        database: None,
        query: "SELECT 1".to_string(),
    };
    let mut i = start;
    while i < args.len() {
        let flag = args[i].as_str();
        let Some(value) = args.get(i + 1).cloned() else {
            bail!("missing value for {flag}");
        };
        match flag {
            "--type" => parsed.store_type = value,
            "--host" => parsed.host = value,
            "--port" => {
                parsed.port = value
                    .parse()
                    .with_context(|| format!("invalid --port '{value}'"))?
            }
            "--user" => parsed.user = value,
            "--password" => parsed.password = value,
            "--database" => parsed.database = Some(value),
            "--query" => parsed.query = value,
            other => bail!("unknown probe option {other}"),
        }
        i += 2;
    }

    if parsed.host.is_empty() || parsed.user.is_empty() {
        bail!("--host and --user are required");
    }
    Ok(parsed)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("run");

    match command {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "probe" => {
            let parsed = match parse_probe_args(&args, 2) {
                Ok(parsed) => parsed,
                Err(e) => {
                    print_error(&format!("{e:#}"));
                    print_help();
                    return Ok(());
                }
            };
            probe(parsed).await
        }
        "run" => {
            let path = parse_config_flag(&args, 2, std::env::var(CONFIG_PATH_ENV).ok());
            run_agent(path).await
        }
        flag if flag.starts_with('-') => {
            let path = parse_config_flag(&args, 1, std::env::var(CONFIG_PATH_ENV).ok());
            run_agent(path).await
        }
        other => {
            print_error(&format!("Unknown command '{other}'"));
            print_help();
            Ok(())
        }
    }
}

async fn run_agent(path: PathBuf) -> Result<()> {
    let config = Config::load(&path).await?;
    logging::init(&config.logging);

    info!("Query agent starting");
    info!("Agent ID: {}", config.agent.id);
    info!("Agent name: {}", config.agent.name);
    info!("Coordinator URL: {}", config.coordinator.url);

    let registry = Arc::new(ExecutorRegistry::new(&config.limits));
    info!("Registered datasource types: {}", registry.store_types().join(", "));
    let service = Arc::new(QueryService::new(registry));
    let manager = ConnectionManager::new(&config, Arc::new(WebSocketDialer), service);

    let shutdown = shutdown::install();
    info!("Query agent is running, press Ctrl+C to stop");
    manager.run(shutdown).await;
    info!("Shutdown complete");
    Ok(())
}

async fn probe(args: ProbeArgs) -> Result<()> {
    let limits = LimitsConfig::default();
    let registry = ExecutorRegistry::new(&limits);
    let executor = registry.resolve(&args.store_type)?;

    let datasource = DatasourceInfo {
        id: serde_json::Value::from("probe"),
        store_type: args.store_type.clone(),
        host: args.host,
        port: args.port,
        database_name: args.database,
        database: None,
        username: args.user,
        password: args.password,
    };

    print_info(&format!(
        "Connecting to {} as {}...",
        datasource.endpoint(),
        datasource.username
    ));
    let result = executor
        .execute_read(&datasource, &args.query, Some(1), Some(PROBE_LIMIT))
        .await;

    if !result.success {
        bail!(
            "{} (after {}ms)",
            result.error.unwrap_or_else(|| "query failed".to_string()),
            result.execution_time_ms
        );
    }

    print_success(&format!("Query succeeded in {}ms", result.execution_time_ms));
    if let Some(columns) = &result.columns {
        let names: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}{}", c.name, c.type_name, if c.nullable { "" } else { " NOT NULL" }))
            .collect();
        print_status("Columns", &names.join(", "));
    }
    if let Some(pagination) = &result.pagination {
        print_status("Total rows", &pagination.total_rows.to_string());
    }
    for row in result.data.unwrap_or_default() {
        println!("    {}", serde_json::to_string(&row)?);
    }
    Ok(())
}
