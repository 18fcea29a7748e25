//! The agent's command listener.
//!
//! Every inbound connection carries exactly one `start`, `cancel` or
//! `query-resources` exchange; concurrent commands ride concurrent
//! connections. A single reused control socket is deliberately not
//! supported.

use crate::{executor, process, Ctx};
use mgpu_proto::message::{ErrorCode, Message};
use mgpu_proto::Wire;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

pub async fn run(ctx: Ctx) -> crate::Result<()> {
    let listener = TcpListener::bind(&ctx.cfg.listen).await?;
    serve(ctx, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(ctx: Ctx, listener: TcpListener) -> crate::Result<()> {
    info!(addr = ?listener.local_addr(), "command listener up");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(handle(ctx.clone(), stream, peer));
    }
}

async fn handle(ctx: Ctx, stream: TcpStream, peer: SocketAddr) {
    let mut wire = Wire::new(stream);
    let msg = match wire.recv().await {
        Ok(Some(msg)) => msg,
        Ok(None) => return,
        Err(err) => {
            warn!(%peer, %err, "bad command");
            return;
        }
    };

    let reply = match msg {
        Message::Start { job_id, node_id, command, assigned_gpus, env_extras, distributed } => {
            let params = executor::StartParams {
                job_id: job_id.clone(),
                target_node: node_id,
                command,
                assigned_gpus,
                env_extras,
                distributed,
            };
            match executor::start(&ctx, params) {
                Ok(pid) => Message::Ack {
                    job_id: Some(job_id),
                    prior_status: None,
                    pid: Some(pid),
                },
                Err(err) => {
                    warn!(job_id, %err, "start refused");
                    Message::Error { code: ErrorCode::Internal, reason: err.to_string() }
                }
            }
        }
        Message::Cancel { job_id } => {
            // Ack now; the escalation runs in the background and the exit
            // still travels on the job's stream connection.
            let ctx = ctx.clone();
            let target = job_id.clone();
            tokio::spawn(async move {
                if !process::cancel(&ctx, &target).await {
                    info!(job_id = target, "cancel for a job with no live process");
                }
            });
            Message::Ack { job_id: Some(job_id), prior_status: None, pid: None }
        }
        Message::QueryResources => {
            Message::Resources { gpus: ctx.gpus.clone(), free_gpus: ctx.free_gpus() }
        }
        other => Message::Error {
            code: ErrorCode::Internal,
            reason: format!("unexpected command: {other:?}"),
        },
    };
    if let Err(err) = wire.send(&reply).await {
        warn!(%peer, %err, "command reply failed");
    }
}
