use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use askql_core::ConfigStore;
use askql_observability::{
    canonical_logs_dir_from_root, emit_event, init_console_logging, init_process_logging,
    ObservabilityEvent, ProcessKind,
};
use askql_server::{build_engine, serve, AppState};
use askql_tools::{validate_sql, SqlDialect, SqlVerdict};
use askql_types::{QueryRequest, TableData};
use askql_wire::{WireFormat, WireFrame};

const SUPPORTED_PROVIDER_IDS: [&str; 5] = ["openai", "deepseek", "qwen", "openrouter", "ollama"];
const CONFIG_FILE: &str = "config.json";

#[derive(Parser, Debug)]
#[command(name = "askql")]
#[command(about = "Ask questions of your SQL data in plain language")]
struct Cli {
    /// Project config file. Defaults to `<state-dir>/config.json`.
    #[arg(long, global = true, env = "ASKQL_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true, env = "ASKQL_STATE_DIR")]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Answer one question and exit.
    Ask {
        question: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long = "data-source")]
        data_sources: Vec<String>,
        /// Print raw stream frames (`sse` or `ndjson`) instead of the answer.
        #[arg(long)]
        stream: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Check a statement against the read-only policy. `-` reads stdin.
    ValidateSql {
        sql: String,
        #[arg(long)]
        dialect: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let config_path = cli
        .config
        .unwrap_or_else(|| state_dir.join(CONFIG_FILE));

    match cli.command {
        Command::Serve {
            hostname,
            port,
            api_key,
            provider,
            model,
        } => {
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let config_store = ConfigStore::new(&config_path, overrides).await?;
            let config = config_store.get().await;
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Server,
                &logs_dir,
                config.server.log_retention_days,
            )?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    status: Some("ok"),
                    detail: Some("server jsonl logging initialized"),
                    ..ObservabilityEvent::new("logging.initialized", "engine.main")
                },
            );
            info!("server logging initialized: {:?}", log_info);

            let hostname = hostname.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &config_path, &addr);

            let engine = build_engine(&config, &state_dir, ProcessKind::Server).await?;
            serve(addr, AppState::new(engine, config_store)).await?;
        }
        Command::Ask {
            question,
            session,
            data_sources,
            stream,
            api_key,
            provider,
            model,
        } => {
            init_console_logging();
            let stream = stream
                .as_deref()
                .map(|raw| {
                    WireFormat::parse(raw)
                        .with_context(|| format!("unknown stream format `{raw}`; use sse or ndjson"))
                })
                .transpose()?;
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let config = ConfigStore::new(&config_path, overrides).await?.get().await;
            let engine = build_engine(&config, &state_dir, ProcessKind::Cli).await?;

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let (sink, printer) = match stream {
                Some(format) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    (Some(tx), Some(tokio::spawn(print_frames(format, rx))))
                }
                None => (None, None),
            };
            let request = QueryRequest {
                query: question,
                session_id: session,
                data_source_ids: data_sources,
                ..QueryRequest::default()
            };
            let result = engine.run(request, sink, cancel).await;
            if let Some(printer) = printer {
                printer.await.context("frame printer failed")?;
            }

            match result {
                Ok(response) => {
                    if stream.is_none() {
                        println!("{}", response.answer.trim());
                        if let Some(table) = &response.table {
                            println!();
                            print!("{}", format_table(table));
                        }
                        eprintln!("session: {}", response.session_id);
                    }
                }
                Err(err) => anyhow::bail!("{} ({})", err.user_message(), err.code()),
            }
        }
        Command::ValidateSql { sql, dialect } => {
            let sql = read_sql_arg(&sql)?;
            let config = ConfigStore::new(&config_path, None).await?.get().await;
            let mut policy = config.sql;
            if let Some(raw) = dialect {
                policy = policy.with_dialect(parse_dialect(&raw)?);
            }
            let verdict = validate_sql(&sql, &policy);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if let SqlVerdict::Deny { reason } = verdict {
                anyhow::bail!("denied: {reason}");
            }
        }
    }

    Ok(())
}

async fn print_frames(format: WireFormat, mut rx: mpsc::UnboundedReceiver<WireFrame>) {
    while let Some(frame) = rx.recv().await {
        match format.encode(&frame) {
            Ok(encoded) => print!("{encoded}"),
            Err(err) => tracing::warn!("skipping frame {}: {}", frame.seq, err),
        }
    }
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }
    if let Some(m) = &model {
        root.insert("default_model".to_string(), Value::String(m.clone()));
    }

    // Key and model land on the chosen provider, openai when none was chosen.
    let target_provider = provider.as_deref().unwrap_or("openai");
    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), Value::String(m));
        }
        let mut providers = serde_json::Map::new();
        providers.insert(target_provider.to_string(), Value::Object(provider_config));
        root.insert("providers".to_string(), Value::Object(providers));
    }

    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn parse_dialect(raw: &str) -> anyhow::Result<SqlDialect> {
    serde_json::from_value(Value::String(raw.trim().to_lowercase()))
        .with_context(|| format!("unknown dialect `{raw}`; use generic, postgres, mysql or sqlite"))
}

fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(".askql"))
}

fn read_sql_arg(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    Ok(input.to_string())
}

fn log_startup_paths(state_dir: &Path, config_path: &Path, addr: &SocketAddr) {
    info!(
        "starting askql server on {} (state_dir: {}, config: {})",
        addr,
        state_dir.display(),
        config_path.display()
    );
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_table(table: &TableData) -> String {
    let mut out = table.columns.join(" | ");
    out.push('\n');
    out.push_str(
        &table
            .columns
            .iter()
            .map(|c| "-".repeat(c.chars().count().max(3)))
            .collect::<Vec<_>>()
            .join("-|-"),
    );
    out.push('\n');
    for row in &table.rows {
        out.push_str(&row.iter().map(cell_text).collect::<Vec<_>>().join(" | "));
        out.push('\n');
    }
    out
}
