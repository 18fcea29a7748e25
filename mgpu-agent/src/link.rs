//! The long-lived master link: registration plus heartbeats.
//!
//! On any error the agent redials with backoff and registers again,
//! which is also what rebuilds the registry after a master restart.

use crate::Ctx;
use mgpu_proto::message::Message;
use mgpu_proto::Wire;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub async fn run(ctx: Ctx) {
    let mut backoff = Duration::from_secs(1);
    loop {
        match TcpStream::connect(&ctx.cfg.master_addr).await {
            Ok(stream) => {
                backoff = Duration::from_secs(1);
                if let Err(err) = session(&ctx, stream).await {
                    warn!(%err, "master link lost, will redial");
                }
            }
            Err(err) => {
                warn!(addr = %ctx.cfg.master_addr, %err, "cannot reach master");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn session(ctx: &Ctx, stream: TcpStream) -> crate::Result<()> {
    let mut wire = Wire::new(stream);
    wire.send(&Message::Register {
        node_id: ctx.cfg.node_id.clone(),
        address: ctx.cfg.advertised(),
        gpus: ctx.gpus.clone(),
    })
    .await?;
    match wire.recv().await? {
        Some(Message::Ack { .. }) => {
            info!(node_id = %ctx.cfg.node_id, gpus = ctx.gpus.len(), "registered with master");
        }
        Some(other) => warn!(?other, "unexpected registration reply"),
        None => {
            return Err(crate::Error::Link("master closed during registration".into()))
        }
    }

    let mut tick =
        tokio::time::interval(Duration::from_secs(ctx.cfg.heartbeat_interval_secs));
    loop {
        tick.tick().await;
        wire.send(&Message::Heartbeat {
            node_id: ctx.cfg.node_id.clone(),
            free_gpus: ctx.free_gpus(),
            running: ctx.running_jobs(),
            ts: chrono::Utc::now().timestamp(),
        })
        .await?;
    }
}
