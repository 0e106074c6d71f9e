//! telecache CLI: chat event cache with MCP server.
//!
//! Usage:
//!   telecache serve [--transport stdio]
//!   telecache ingest [FILE] [--override-tombstones]
//!   telecache search <TEXT> [--chat ID] [--limit N] [--cursor C]
//!   telecache get|history <MESSAGE_ID>
//!   telecache deleted|stats|export|migrate
//!   telecache parked list|replay
//!
//! Global options: --config <FILE>, --db <FILE>.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telecache::config::LogConfig;
use telecache::ingest::IngestSummary;
use telecache::{
    CancellationToken, Config, EventSource, IngestError, IngestPipeline, JsonLinesSource,
    MessageStore, QueryService, RetryPolicy, SearchRequest, WriteMode,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "telecache",
    version,
    about = "Chat message cache with full-text search and an audit trail"
)]
struct Cli {
    /// YAML configuration file (also TELECACHE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to SQLite database file, overriding the configured location
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP (Model Context Protocol) server
    Serve {
        /// Transport type (currently only stdio)
        #[arg(long, default_value = "stdio")]
        transport: String,
    },
    /// Ingest newline-delimited JSON events from a file or stdin
    Ingest {
        /// Events file; reads stdin when omitted
        file: Option<PathBuf>,
        /// Apply edits to deleted messages, lifting the tombstone
        #[arg(long)]
        override_tombstones: bool,
    },
    /// Full-text search over message text and captions
    Search {
        text: String,
        #[arg(long)]
        chat: Option<i64>,
        #[arg(long)]
        sender: Option<i64>,
        /// Only messages sent at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Only messages sent before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        include_deleted: bool,
        #[arg(long)]
        limit: Option<usize>,
        /// Continue from a previous page
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Show a message's current state
    Get { message_id: String },
    /// Show a message with its events and audit trail
    History { message_id: String },
    /// List deleted messages, newest deletion first
    Deleted {
        #[arg(long)]
        chat: Option<i64>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show cache totals, or one chat's statistics
    Stats {
        #[arg(long)]
        chat: Option<i64>,
    },
    /// Write every message as JSON
    Export {
        /// Output file; stdout when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Inspect or replay parked events
    Parked {
        #[command(subcommand)]
        action: ParkedAction,
    },
    /// Create or upgrade the database schema
    Migrate,
}

#[derive(Subcommand)]
enum ParkedAction {
    /// List parked events, oldest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Retry parked events
    Replay {
        #[arg(long, default_value_t = 100)]
        limit: usize,
        /// Apply edits to deleted messages, lifting the tombstone
        #[arg(long)]
        override_tombstones: bool,
    },
}

fn init_tracing(log: &LogConfig) {
    let level = if log.debug { "debug" } else { log.level.as_str() };
    let default_directive = level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();

    // stdout carries MCP traffic and command output
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn write_mode(override_tombstones: bool) -> WriteMode {
    if override_tombstones {
        WriteMode::Override
    } else {
        WriteMode::Normal
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn MessageStore>, i32> {
    match telecache::open_store(config) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            eprintln!(
                "Error: failed to open database at {}: {}",
                config.store.resolved_path().display(),
                e
            );
            Err(1)
        }
    }
}

fn pipeline_for(store: Arc<dyn MessageStore>, config: &Config) -> IngestPipeline {
    IngestPipeline::new(store, config.ingest_actor())
        .with_retry_policy(RetryPolicy::from_config(&config.ingest))
        .with_event_logging(config.log.debug)
}

async fn cmd_ingest(config: &Config, file: Option<PathBuf>, override_tombstones: bool) -> i32 {
    let store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let pipeline = pipeline_for(store, config);
    let cancel = CancellationToken::new();
    let mode = write_mode(override_tombstones);

    let result = match file {
        Some(path) => {
            let mut source = match JsonLinesSource::open(&path).await {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("Error: cannot read '{}': {}", path.display(), e);
                    return 1;
                }
            };
            run_until_interrupted(&pipeline, &mut source, &cancel, mode).await
        }
        None => {
            let mut source = JsonLinesSource::stdin();
            run_until_interrupted(&pipeline, &mut source, &cancel, mode).await
        }
    };

    match result {
        Some(Ok(summary)) => print_json(&summary),
        Some(Err(e)) => {
            eprintln!("Error: {}", e);
            1
        }
        None => 0,
    }
}

/// Run a source to completion; Ctrl-C stops after the event in flight
async fn run_until_interrupted(
    pipeline: &IngestPipeline,
    source: &mut dyn EventSource,
    cancel: &CancellationToken,
    mode: WriteMode,
) -> Option<Result<IngestSummary, IngestError>> {
    let run = pipeline.run_with_mode(source, cancel, mode);
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => Some(result),
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            tracing::info!("interrupted; finishing the event in flight");
            match tokio::time::timeout(Duration::from_secs(5), &mut run).await {
                Ok(result) => Some(result),
                Err(_) => {
                    tracing::warn!("source did not yield; stopping");
                    None
                }
            }
        }
    }
}

async fn cmd_search(queries: &QueryService, request: SearchRequest) -> i32 {
    match queries.search_messages(request, &CancellationToken::new()).await {
        Ok(page) => {
            if page.hits.is_empty() {
                println!("No matching messages.");
                return 0;
            }
            println!("{:<24}  {:<20}  {:>8}  {}", "ID", "SENT", "SCORE", "TEXT");
            println!("{}", "-".repeat(80));
            for hit in &page.hits {
                let marker = if hit.message.is_tombstoned() { " [deleted]" } else { "" };
                println!(
                    "{:<24}  {:<20}  {:>8.3}  {}{}",
                    hit.message.id,
                    hit.message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    hit.score,
                    hit.message.preview(60),
                    marker
                );
            }
            if let Some(cursor) = page.next_cursor {
                println!("\nMore results: --cursor {}", cursor);
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_get(queries: &QueryService, message_id: &str) -> i32 {
    match queries.get_message(message_id).await {
        Ok(Some(message)) => print_json(&message),
        Ok(None) => {
            eprintln!("Error: message '{}' not found", message_id);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_history(queries: &QueryService, message_id: &str) -> i32 {
    let history = match queries.message_history(message_id).await {
        Ok(Some(history)) => history,
        Ok(None) => {
            eprintln!("Error: message '{}' not found", message_id);
            return 1;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match queries.audit_trail(message_id).await {
        Ok(audit) => print_json(&serde_json::json!({
            "message": history.message,
            "events": history.events,
            "audit": audit,
        })),
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_deleted(queries: &QueryService, chat: Option<i64>, limit: Option<usize>) -> i32 {
    match queries.deleted_messages(chat, limit).await {
        Ok(messages) if messages.is_empty() => {
            println!("No deleted messages.");
            0
        }
        Ok(messages) => {
            println!("{:<24}  {:<20}  {}", "ID", "DELETED", "TEXT");
            println!("{}", "-".repeat(72));
            for message in messages {
                let deleted = message
                    .deleted_at
                    .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{:<24}  {:<20}  {}", message.id, deleted, message.preview(40));
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_stats(queries: &QueryService, chat: Option<i64>) -> i32 {
    match chat {
        Some(chat_id) => match queries.chat_stats(chat_id).await {
            Ok(stats) => print_json(&stats),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        None => match queries.stats().await {
            Ok(stats) => print_json(&stats),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
    }
}

async fn cmd_export(queries: &QueryService, output: Option<PathBuf>) -> i32 {
    let messages = match queries.export().await {
        Ok(messages) => messages,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let Some(path) = output else {
        return print_json(&messages);
    };
    let text = match serde_json::to_string_pretty(&messages) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match tokio::fs::write(&path, text).await {
        Ok(()) => {
            println!("Exported {} messages to {}", messages.len(), path.display());
            0
        }
        Err(e) => {
            eprintln!("Error: cannot write '{}': {}", path.display(), e);
            1
        }
    }
}

async fn cmd_parked(config: &Config, action: ParkedAction) -> i32 {
    let store = match open_store(config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    match action {
        ParkedAction::List { limit } => {
            match tokio::task::spawn_blocking(move || store.parked(limit)).await {
                Ok(Ok(parked)) if parked.is_empty() => {
                    println!("No parked events.");
                    0
                }
                Ok(Ok(parked)) => print_json(&parked),
                Ok(Err(e)) => {
                    eprintln!("Error: {}", e);
                    1
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    1
                }
            }
        }
        ParkedAction::Replay {
            limit,
            override_tombstones,
        } => {
            let pipeline = pipeline_for(store, config);
            match pipeline
                .replay_parked(limit, write_mode(override_tombstones))
                .await
            {
                Ok(report) => print_json(&report),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    1
                }
            }
        }
    }
}

fn cmd_migrate(config: &Config) -> i32 {
    match telecache::open_store(config) {
        Ok(store) => match store.schema_version() {
            Ok(version) => {
                println!(
                    "Database {} is at schema version {}",
                    config.store.resolved_path().display(),
                    version
                );
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Err(e) => {
            eprintln!("Error: migration failed: {}", e);
            1
        }
    }
}

fn query_service(config: &Config) -> Result<QueryService, i32> {
    open_store(config).map(|store| QueryService::new(store, config.query.clone()))
}

fn block_on(fut: impl std::future::Future<Output = i32>) -> i32 {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(fut),
        Err(e) => {
            eprintln!("failed to create tokio runtime: {}", e);
            1
        }
    }
}

/// Run a read-only command against the configured store
fn with_queries<F, Fut>(config: &Config, command: F) -> i32
where
    F: FnOnce(QueryService) -> Fut,
    Fut: std::future::Future<Output = i32>,
{
    match query_service(config) {
        Ok(queries) => block_on(command(queries)),
        Err(code) => code,
    }
}

fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };
    if let Some(db) = cli.db {
        config.store.db_path = Some(db);
    }
    init_tracing(&config.log);

    let code = match cli.command {
        Commands::Serve { transport } => {
            if transport != "stdio" {
                eprintln!("error: only 'stdio' transport is currently supported");
                std::process::exit(1);
            }
            telecache::mcp::run_mcp_server(&config)
        }
        Commands::Ingest {
            file,
            override_tombstones,
        } => block_on(cmd_ingest(&config, file, override_tombstones)),
        Commands::Search {
            text,
            chat,
            sender,
            since,
            until,
            include_deleted,
            limit,
            cursor,
        } => {
            let request = SearchRequest {
                text,
                chat_id: chat,
                sender_id: sender,
                since,
                until,
                include_deleted,
                limit,
                cursor,
            };
            with_queries(&config, |q| async move { cmd_search(&q, request).await })
        }
        Commands::Get { message_id } => {
            with_queries(&config, |q| async move { cmd_get(&q, &message_id).await })
        }
        Commands::History { message_id } => {
            with_queries(&config, |q| async move { cmd_history(&q, &message_id).await })
        }
        Commands::Deleted { chat, limit } => {
            with_queries(&config, |q| async move { cmd_deleted(&q, chat, limit).await })
        }
        Commands::Stats { chat } => with_queries(&config, |q| async move { cmd_stats(&q, chat).await }),
        Commands::Export { output } => {
            with_queries(&config, |q| async move { cmd_export(&q, output).await })
        }
        Commands::Parked { action } => block_on(cmd_parked(&config, action)),
        Commands::Migrate => cmd_migrate(&config),
    };
    std::process::exit(code);
}
