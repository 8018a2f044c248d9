//! `mcpd(1)`: runs the aggregating proxy as a standalone daemon.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use mcpd::catalogue::ToolInventory;
use mcpd::config::ConfigStore;
use mcpd::dataflow::DataFlowEngine;
use mcpd::events::EventBus;
use mcpd::handler::ProxyHandler;
use mcpd::http::{self, AppState};
use mcpd::router::Router;
use mcpd::session::SessionStore;
use mcpd::store::Store;
use mcpd::supervisor::Supervisor;
use mcpd::truncate::Truncator;
use rmcp::transport::streamable_http_server::{session::local::LocalSessionManager, StreamableHttpService};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser, Debug)]
#[command(name = "mcpd", version, about = "Aggregating MCP proxy")]
struct Cli {
    /// Path to the desired-state config JSON. Created with defaults if absent.
    #[arg(long, env = "MCPD_CONFIG", default_value = "./mcpd.json")]
    config: PathBuf,

    /// Override the listen address from the config file.
    #[arg(long, env = "MCPD_LISTEN")]
    listen: Option<String>,
}

fn init_logging(json: bool, level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_store = ConfigStore::open(cli.config.clone())?;
    let snapshot = config_store.snapshot();
    init_logging(snapshot.logging.json, &snapshot.logging.level);
    let listen_addr = cli.listen.clone().unwrap_or_else(|| snapshot.listen.clone());

    let store = Store::open(&snapshot.data_dir)?;
    let catalogue = Arc::new(ToolInventory::new());
    let events = EventBus::new();
    let sessions = Arc::new(SessionStore::new());
    let dataflow = Arc::new(DataFlowEngine::new(
        snapshot.security.flow_policy.clone(),
        if snapshot.security.internal_patterns.is_empty() {
            mcpd::dataflow::default_internal_patterns()
        } else {
            snapshot.security.internal_patterns.clone()
        },
        if snapshot.security.external_patterns.is_empty() {
            mcpd::dataflow::default_external_patterns()
        } else {
            snapshot.security.external_patterns.clone()
        },
    ));
    let truncator = Arc::new(Truncator::new(store.clone(), snapshot.tool_response_limit));

    let supervisor = Supervisor::new(
        Arc::clone(&config_store),
        Arc::clone(&catalogue),
        events.clone(),
        Some(Arc::clone(&store)),
    );

    let router = Arc::new(Router::new(
        Arc::clone(&supervisor),
        Arc::clone(&catalogue),
        Arc::clone(&dataflow),
        Arc::clone(&truncator),
        Arc::clone(&config_store),
        events.clone(),
        Arc::clone(&store),
    ));

    let cancel = CancellationToken::new();
    supervisor.spawn_reconciliation_loop(cancel.clone());

    let handler = ProxyHandler::new(
        Arc::clone(&router),
        Arc::clone(&supervisor),
        Arc::clone(&catalogue),
        Arc::clone(&config_store),
        Arc::clone(&sessions),
        Arc::clone(&dataflow),
        Arc::clone(&truncator),
    );

    let mcp_service = StreamableHttpService::new(
        move || Ok(handler.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let aux_state = AppState {
        config: Arc::clone(&config_store),
        catalogue: Arc::clone(&catalogue),
        supervisor: Arc::clone(&supervisor),
        events: events.clone(),
        store: Arc::clone(&store),
        dataflow: Arc::clone(&dataflow),
        api_key: snapshot.api_key.clone(),
    };

    let app = http::build_router(aux_state).nest_service("/mcp", mcp_service);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(listen = %listen_addr, "mcpd listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining");
            shutdown_cancel.cancel();
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        })
        .await?;

    Ok(())
}
