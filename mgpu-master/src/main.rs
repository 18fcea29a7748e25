use anyhow::Context as _;
use clap::Parser;
use mgpu_master::config::MasterConfig;
use mgpu_master::state::Master;
use mgpu_master::{agent_api, client_api, scheduler, sweeper};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "mgpu-master", about = "mgpu cluster master", version)]
struct Args {
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the client listen address.
    #[arg(long, env = "MGPU_CLIENT_LISTEN")]
    client_listen: Option<String>,
    /// Override the agent listen address.
    #[arg(long, env = "MGPU_AGENT_LISTEN")]
    agent_listen: Option<String>,
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
    let mut cfg = MasterConfig::load(args.config.as_deref()).context("loading config")?;
    if let Some(addr) = args.client_listen {
        cfg.client_listen = addr;
    }
    if let Some(addr) = args.agent_listen {
        cfg.agent_listen = addr;
    }

    info!(
        client = %cfg.client_listen,
        agent = %cfg.agent_listen,
        orphan_policy = ?cfg.orphan_policy,
        "mgpu master starting"
    );
    let ctx = Master::new(cfg);

    tokio::select! {
        res = client_api::run(ctx.clone()) => res.context("client listener")?,
        res = agent_api::run(ctx.clone()) => res.context("agent listener")?,
        _ = scheduler::run(ctx.clone()) => {}
        _ = sweeper::run(ctx.clone()) => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
