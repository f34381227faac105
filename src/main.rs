//! HOLOW-MCP entry point.
//!
//! Modes, checked in order: `--setup` (write config + bootstrap),
//! `--config` (print resolved configuration), `--list-creds`,
//! `--mcp-status` (shard health report), `--sql` (one-shot query),
//! `--init` (schema bootstrap), and finally server mode on stdio.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use holow_mcp::config::{self, AppConfig, RuntimeConfig};
use holow_mcp::execution::circuit::BreakerSet;
use holow_mcp::execution::retry::RetrySweeper;
use holow_mcp::lifecycle::Supervisor;
use holow_mcp::mcp::handlers::browser::{BrowserTools, UnavailableTransport};
use holow_mcp::mcp::handlers::toolbox::ToolboxTools;
use holow_mcp::mcp::handlers::BuiltinHost;
use holow_mcp::mcp::registry::ToolRegistry;
use holow_mcp::mcp::server::McpServer;
use holow_mcp::observability::MetricsHub;
use holow_mcp::services::logger;
use holow_mcp::sqlcli;
use holow_mcp::storage::{resilience, Storage};

#[derive(Parser, Debug)]
#[command(name = "holow-mcp")]
#[command(about = "SQLite-backed MCP server with a runtime-programmable tool catalog")]
#[command(version)]
struct Cli {
    /// Initialize shard schemas and exit
    #[arg(long)]
    init: bool,

    /// Write config.json with defaults and bootstrap the shards
    #[arg(long)]
    setup: bool,

    /// Base directory for the six shards
    #[arg(long)]
    path: Option<PathBuf>,

    /// Directory of numbered .sql schema/migration files
    #[arg(long)]
    schemas: Option<PathBuf>,

    /// Use an ephemeral base path under the system temp dir
    #[arg(long)]
    test: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    config: bool,

    /// List configured credential providers and exit
    #[arg(long = "list-creds")]
    list_creds: bool,

    /// Print per-shard health and exit
    #[arg(long = "mcp-status")]
    mcp_status: bool,

    /// Execute one SQL query against a shard and exit
    #[arg(long)]
    sql: Option<String>,

    /// Shard name for --sql
    #[arg(long, default_value = "lifecycle-tools")]
    db: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();

    let base = config::resolve_base_path(cli.path.clone(), cli.test);
    if cli.test {
        eprintln!("[TEST MODE] using isolated path: {}", base.display());
    }

    // Setup: persist config.json, then fall through to schema init.
    if cli.setup {
        let app_config = AppConfig::new(base.clone());
        config::save_app_config(&app_config)?;
        eprintln!("config written to {}", config::config_path(&base).display());
        cli.init = true;
    }

    if cli.config {
        let app_config = config::load_app_config(&base)
            .unwrap_or_else(|_| AppConfig::new(base.clone()));
        println!("base_path: {}", app_config.base_path.display());
        println!("credentials_db: {}", app_config.credentials_db);
        println!("backup_enabled: {}", app_config.backup_enabled);
        println!("backup_max_count: {}", app_config.backup_max_count);
        println!("debug_port: {}", app_config.debug_port);
        return Ok(());
    }

    if cli.list_creds {
        let storage = Storage::open(&base)?;
        let providers: Vec<String> = storage
            .core
            .with(|conn| {
                let mut stmt =
                    conn.prepare("SELECT name, provider FROM secret_references ORDER BY name")?;
                let rows = stmt.query_map([], |r| {
                    Ok(format!("{} ({})", r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })?;
                rows.collect()
            })
            .unwrap_or_default();
        if providers.is_empty() {
            println!("no credentials configured (values live in the external encrypted store)");
        } else {
            println!("configured credentials:");
            for p in providers {
                println!("  - {p}");
            }
        }
        return Ok(());
    }

    if cli.mcp_status {
        let healths = resilience::validate_databases(&base);
        resilience::print_report(&base, &healths);
        let all_ok = healths.iter().all(|h| h.exists && h.integrity_ok);
        if !all_ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    if let Some(query) = cli.sql.as_deref() {
        return sqlcli::run_query(&base, &cli.db, query);
    }

    if cli.init {
        let storage = Storage::open(&base)?;
        storage.init_schemas(cli.schemas.as_deref())?;
        storage.recover_and_migrate(cli.schemas.as_deref())?;
        eprintln!("shards initialized under {}", base.display());
        return Ok(());
    }

    // Server mode.
    if !cli.test && !config::config_exists(&base) {
        anyhow::bail!(
            "holow-mcp is not initialized under {}; run `holow-mcp --setup` first",
            base.display()
        );
    }

    logger::init(&base);

    let storage = Storage::open(&base)?;
    if cli.test {
        storage.init_schemas(cli.schemas.as_deref())?;
    }
    storage.recover_and_migrate(cli.schemas.as_deref())?;

    let metrics = Arc::new(MetricsHub::new(
        storage.core.clone(),
        storage.metadata.clone(),
        storage.output.clone(),
    ));
    metrics.update_heartbeat("starting", 0);
    storage.metadata.exec_or_log(
        "INSERT OR REPLACE INTO build_info (id, version, built_with)
         VALUES (1, ?1, 'rustc')",
        &[&env!("CARGO_PKG_VERSION")],
    );

    let runtime_config = RuntimeConfig::load(&storage.core);
    let app_config = config::load_app_config(&base).unwrap_or_else(|_| AppConfig::new(base.clone()));

    let registry = Arc::new(ToolRegistry::new(storage.tools.clone()));
    registry.reload().map_err(|e| anyhow::anyhow!("initial tool load failed: {e}"))?;

    let breakers = Arc::new(BreakerSet::new(storage.execution.clone()));
    breakers
        .load_all()
        .map_err(|e| anyhow::anyhow!("failed to load circuit breakers: {e}"))?;

    let retry = Arc::new(RetrySweeper::new(
        storage.execution.clone(),
        storage.output.clone(),
    ));

    let browser = BrowserTools::new(Arc::new(UnavailableTransport), app_config.debug_port);
    let toolbox = ToolboxTools::new(
        storage.clone(),
        Arc::clone(&registry),
        Arc::clone(&breakers),
        Arc::clone(&retry),
        Arc::clone(&metrics),
    );
    let host = BuiltinHost::new(browser, toolbox);

    let server = McpServer::new(storage, registry, host, breakers, retry, metrics);
    info!(
        base = %base.display(),
        server = %runtime_config.server_name,
        "holow-mcp starting"
    );

    if app_config.backup_enabled {
        info!("backup_enabled set; archive backups are handled by the external backup tool");
    }

    Supervisor::new(server, runtime_config).run().await
}
