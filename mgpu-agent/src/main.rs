use anyhow::Context as _;
use clap::Parser;
use mgpu_agent::config::AgentConfig;
use mgpu_agent::{gpu, link, server, Agent};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mgpu-agent", about = "mgpu compute-node agent", version)]
struct Args {
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the node id (default: hostname).
    #[arg(long, env = "MGPU_NODE_ID")]
    node_id: Option<String>,
    /// Override the master's agent endpoint.
    #[arg(long, env = "MGPU_MASTER_ADDR")]
    master: Option<String>,
    /// Override the command listen address.
    #[arg(long, env = "MGPU_AGENT_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = AgentConfig::load(args.config.as_deref()).context("loading config")?;
    if let Some(node_id) = args.node_id {
        cfg.node_id = node_id;
    }
    if let Some(master) = args.master {
        cfg.master_addr = master;
    }
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }

    let gpus = gpu::discover();
    info!(
        node_id = %cfg.node_id,
        master = %cfg.master_addr,
        listen = %cfg.listen,
        gpus = gpus.len(),
        "mgpu agent starting"
    );
    let ctx = Agent::new(cfg, gpus);

    tokio::select! {
        res = server::run(ctx.clone()) => res.context("command listener")?,
        _ = link::run(ctx.clone()) => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
