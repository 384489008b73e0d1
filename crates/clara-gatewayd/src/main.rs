//! Clara gateway daemon.
//!
//! Wires the stack together — store, tools, sandbox, engine, gateway —
//! serves the WebSocket listener, and tears everything down in order on
//! ctrl-c: stop accepting work, drain background tasks (they may still
//! call tools), then stop plugin servers.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clara_engine::memory::{HttpMemoryClient, MemoryClient, NullMemoryClient};
use clara_engine::orchestrator::{Orchestrator, OrchestratorConfig};
use clara_engine::{
    BackgroundWorker, ContextBuilder, ModelTier, Processor, ProviderResolver, TieredProviders,
};
use clara_gateway::router::RouterConfig;
use clara_gateway::server::GatewayServer;
use clara_sandbox::{SandboxConfig, SandboxRuntime};
use clara_store::{Database, IdentityStore, MessageStore, SessionStore};
use clara_tools::builtin::{LocalFileStore, register_builtin_tools, register_send_file_tool};
use clara_tools::plugin::PluginManager;
use clara_tools::{ToolExecutor, ToolRegistry};

use crate::config::DaemonConfig;

/// Clara gateway daemon.
#[derive(Debug, Parser)]
#[command(name = "clara-gatewayd", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the database path.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (silently ignore if missing).
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    run(config).await
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    // -- store --------------------------------------------------------------
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent).context("failed to create data directory")?;
    }
    let db = Database::open_and_migrate(config.database.path.clone())
        .await
        .context("failed to open database")?;
    info!(path = %config.database.path.display(), "store initialized");

    // -- memory -------------------------------------------------------------
    let memory: Arc<dyn MemoryClient> = if config.memory.base_url.is_empty() {
        info!("no memory service configured, running without semantic memory");
        Arc::new(NullMemoryClient)
    } else {
        let agent_id = if config.memory.agent_id.is_empty() {
            "clara".to_owned()
        } else {
            config.memory.agent_id.clone()
        };
        Arc::new(
            HttpMemoryClient::new(config.memory.base_url.clone(), agent_id)
                .context("failed to build memory client")?,
        )
    };

    // -- tools --------------------------------------------------------------
    let registry = ToolRegistry::new();
    let files = Arc::new(
        LocalFileStore::new(config.plugins.files_dir.clone())
            .context("failed to open file store")?,
    );
    register_builtin_tools(&registry, Arc::clone(&files));
    register_send_file_tool(&registry, files);

    let plugins = Arc::new(
        PluginManager::open(config.plugins.dir.clone()).context("failed to open plugin catalog")?,
    );
    plugins.start_all_enabled().await;

    let sandbox = Arc::new(
        SandboxRuntime::new(SandboxConfig {
            root: config.sandbox.root.clone(),
            timeout_secs: config.sandbox.timeout_secs,
            python_bin: config.sandbox.python_bin.clone(),
        })
        .context("failed to initialize sandbox")?,
    );

    let executor = Arc::new(ToolExecutor::new(
        registry,
        Arc::clone(&plugins),
        sandbox,
    ));

    // -- engine -------------------------------------------------------------
    let providers: Arc<dyn ProviderResolver> = Arc::new(TieredProviders::new(config.tier_config()));

    let evolution_provider = providers.resolve(ModelTier::Low).ok();
    let mut background = BackgroundWorker::new(
        Arc::clone(&memory),
        evolution_provider,
        config.background.evolution_probability,
    );
    if !config.background.proactive_endpoint.is_empty() {
        background = background.with_proactive_endpoint(config.background.proactive_endpoint.clone());
    }
    let background = Arc::new(background);

    let context = ContextBuilder::new(
        SessionStore::new(db.clone()),
        MessageStore::new(db.clone()),
        IdentityStore::new(db.clone()),
        Arc::clone(&memory),
        config.gateway.history_limit,
    );

    let orchestrator = Orchestrator::new(
        Arc::clone(&executor),
        OrchestratorConfig {
            max_iterations: config.llm.max_iterations,
            ..OrchestratorConfig::default()
        },
    );

    let processor = Arc::new(Processor::new(
        context,
        orchestrator,
        executor,
        MessageStore::new(db.clone()),
        providers,
        Arc::clone(&background),
    ));

    // -- gateway ------------------------------------------------------------
    let server = GatewayServer::new(
        processor,
        Arc::clone(&plugins),
        RouterConfig {
            debounce: Duration::from_millis(config.gateway.debounce_ms),
            queue_cap: config.gateway.queue_cap,
        },
    );

    let listener = tokio::net::TcpListener::bind(&config.gateway.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.gateway.bind))?;
    info!(bind = %config.gateway.bind, "clara gateway started");

    let serve = tokio::spawn(async move { server.serve(listener).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    // Stop accepting new work, then drain in dependency order: background
    // tasks may still call tools, so plugin servers go down last.
    serve.abort();
    background
        .shutdown(Duration::from_secs(config.background.shutdown_deadline_secs))
        .await;
    plugins.shutdown().await;

    info!("clara gateway stopped");
    Ok(())
}
