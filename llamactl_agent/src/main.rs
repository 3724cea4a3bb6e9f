//! llamactl_agent: control panel backend for a local llama-server with GPU
//! health monitoring. Serves JSON over HTTP and a WebSocket at /ws.

use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use tracing::{info, warn};

use llamactl_agent::cli::parse_args;
use llamactl_agent::config::load_config;
use llamactl_agent::http::router;
use llamactl_agent::state::AppState;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match parse_args(env::args()) {
        Ok(a) => a,
        Err(msg) if msg.starts_with("Usage:") => {
            println!("{msg}");
            return Ok(());
        }
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    init_tracing();

    let mut cfg = load_config(args.config.as_deref()).context("loading config")?;
    cfg.apply_env(|k| env::var(k).ok());
    if let Some(port) = args.port {
        cfg.port = port;
    }
    cfg.validate().context("invalid configuration")?;

    let state = AppState::from_config(&cfg).context("building agent state")?;
    state.monitor.start();

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("llamactl agent listening on http://{addr}");

    let app = router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {e}");
            }
            info!("shutting down");
        })
        .await
        .context("http server")?;

    state.monitor.stop().await;
    let report = state.launcher.lock().await.stop().await;
    info!("{}", report.message);
    Ok(())
}
