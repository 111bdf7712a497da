//! Control-plane server - HTTP API and per-run WebSocket streams for the
//! document pipeline.

mod routes;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use dirigent::config::load_config;
use dirigent::events::EventHub;
use dirigent::llm::credentials::CredentialPool;
use dirigent::llm::local::{DockerModelRuntime, LifecycleManager};
use dirigent::run::workflow::Workflow;
use dirigent::sandbox::SandboxFs;
use dirigent::supervisor::ProcessSupervisor;

use crate::state::AppState;

/// Comma-separated provider API keys.
const API_KEYS_ENV: &str = "DIRIGENT_API_KEYS";

#[derive(Parser)]
#[command(name = "dirigent-server")]
#[command(about = "Control-plane server for the document pipeline")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Project directory (sandbox root for all worker file access)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Config file (defaults to <project-dir>/dirigent.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dirigent::logging::init();

    let args = Args::parse();

    let project_dir = args.project_dir.canonicalize().unwrap_or(args.project_dir);
    let config_path = args
        .config
        .unwrap_or_else(|| project_dir.join("dirigent.toml"));
    let config = load_config(&config_path)?;
    info!(
        project_dir = %project_dir.display(),
        config = %config_path.display(),
        "starting dirigent-server"
    );

    let sandbox = Arc::new(SandboxFs::new(&project_dir)?);
    let events = Arc::new(EventHub::new());
    let launcher = Arc::new(ProcessSupervisor::new());
    let workflow = Arc::new(Workflow::new(
        config.clone(),
        Arc::clone(&sandbox),
        Arc::clone(&events),
        launcher,
    ));

    let credentials = Arc::new(CredentialPool::new(
        api_keys_from_env(),
        Duration::from_secs(config.credentials.cooldown_secs),
    ));
    if credentials.is_empty() {
        warn!("{API_KEYS_ENV} not set, cloud providers will be unavailable");
    }

    let lifecycle = Arc::new(LifecycleManager::new(
        Arc::new(DockerModelRuntime::new()),
        config.local_models.clone(),
    ));
    let sweeper = lifecycle.spawn_sweeper();

    let state = AppState {
        workflow,
        events,
        sandbox,
        lifecycle: Arc::clone(&lifecycle),
        credentials,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(routes::api_router())
        .route("/ws/{run_id}", get(ws::ws_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Leave no model containers behind.
    sweeper.abort();
    lifecycle.force_stop_all().await?;
    info!("shutdown complete");
    Ok(())
}

fn api_keys_from_env() -> Vec<String> {
    std::env::var(API_KEYS_ENV)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(err = %e, "failed to listen for shutdown signal");
    }
}
