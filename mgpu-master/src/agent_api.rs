//! The agent-facing listener.
//!
//! Agents dial in for two things: the long-lived registration +
//! heartbeat connection, and one dedicated stream connection per
//! running job carrying `out` chunks and the final `exit`. Both land
//! here; the message types tell them apart.

use crate::config::OrphanPolicy;
use crate::dispatch;
use crate::state::{Ctx, MasterState};
use bytes::Bytes;
use mgpu_proto::message::Message;
use mgpu_proto::Wire;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub async fn run(ctx: Ctx) -> crate::Result<()> {
    let listener = TcpListener::bind(&ctx.cfg.agent_listen).await?;
    serve(ctx, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(ctx: Ctx, listener: TcpListener) -> crate::Result<()> {
    info!(addr = ?listener.local_addr(), "agent listener up");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(handle_conn(ctx.clone(), stream, peer));
    }
}

async fn handle_conn(ctx: Ctx, stream: TcpStream, peer: SocketAddr) {
    let mut wire = Wire::new(stream);
    loop {
        match wire.recv().await {
            Ok(Some(msg)) => {
                if let Err(err) = handle_message(&ctx, &mut wire, msg).await {
                    warn!(%peer, %err, "agent connection error");
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%peer, %err, "dropping agent connection");
                break;
            }
        }
    }
}

async fn handle_message(
    ctx: &Ctx,
    wire: &mut Wire<TcpStream>,
    msg: Message,
) -> crate::Result<()> {
    match msg {
        Message::Register { node_id, address, gpus } => {
            {
                let mut st = ctx.state.lock();
                st.register_node(node_id.clone(), address.clone(), gpus);
            }
            ctx.wake.notify_one();
            wire.send(&Message::Ack { job_id: None, prior_status: None, pid: None })
                .await?;
            tokio::spawn(verify_dialback(ctx.clone(), node_id, address));
        }
        Message::Heartbeat { node_id, free_gpus, running, ts: _ } => {
            let kills = {
                let mut st = ctx.state.lock();
                apply_heartbeat(&mut st, ctx.cfg.orphan_policy, &node_id, &free_gpus, &running)
            };
            if !kills.is_empty() {
                ctx.wake.notify_one();
            }
            for (address, job_id) in kills {
                tokio::spawn(async move {
                    if let Err(err) = dispatch::cancel(&address, &job_id).await {
                        warn!(%address, job_id, %err, "orphan kill failed");
                    }
                });
            }
        }
        Message::Out { job_id, stream, data } => {
            let mut st = ctx.state.lock();
            match st.outputs.get_mut(&job_id) {
                Some(output) => output.append(&job_id, stream, Bytes::from(data)),
                None => debug!(job_id, "output chunk for unknown job"),
            }
        }
        Message::Exit { job_id, node_id, code, signal } => {
            {
                let mut st = ctx.state.lock();
                if st.record_share_exit(&job_id, &node_id, code, signal) {
                    if let Some((status, code, signal, reason)) = st.exit_outcome(&job_id) {
                        st.retire(&job_id, status, code, signal, &reason);
                    }
                }
            }
            ctx.wake.notify_one();
        }
        other => warn!(?other, "unexpected message on agent connection"),
    }
    Ok(())
}

/// Apply a heartbeat: refresh liveness and flag running jobs the master
/// does not know about (survivors of a master restart).
fn apply_heartbeat(
    st: &mut MasterState,
    orphan_policy: OrphanPolicy,
    node_id: &str,
    free_gpus: &[u32],
    running: &[String],
) -> Vec<(String, String)> {
    let Some(node) = st.nodes.get_mut(node_id) else {
        // The agent will re-register when its link connection drops.
        warn!(node_id, "heartbeat from unregistered node");
        return vec![];
    };
    node.heartbeat();
    let address = node.address.clone();
    if free_gpus.len() != node.free_gpus.len() {
        // Advisory only; the master's bookkeeping is authoritative.
        debug!(
            node_id,
            agent_free = free_gpus.len(),
            master_free = node.free_gpus.len(),
            "free-GPU views diverge"
        );
    }

    let mut kills = vec![];
    for job_id in running {
        let known = st.jobs.get(job_id).is_some_and(|j| {
            !j.is_terminal() && j.assignment.iter().any(|s| s.node_id == node_id)
        });
        if known {
            continue;
        }
        match orphan_policy {
            OrphanPolicy::Adopt => {
                debug!(node_id, job_id, "adopting unknown running job")
            }
            OrphanPolicy::Kill => {
                warn!(node_id, job_id, "killing unknown running job");
                kills.push((address.clone(), job_id.clone()));
            }
        }
    }
    kills
}

/// Confirm that a freshly-registered agent is dialable at the address
/// it advertised; a wrong address would only surface at first start
/// otherwise.
async fn verify_dialback(ctx: Ctx, node_id: String, address: String) {
    match dispatch::query_resources(&address).await {
        Ok(Message::Resources { gpus, .. }) => {
            debug!(node_id, %address, gpus = gpus.len(), "dial-back verified");
        }
        Ok(_) => {}
        Err(err) => {
            warn!(node_id, %address, %err, "advertised address is not dialable");
            let mut st = ctx.state.lock();
            if let Some(node) = st.nodes.get_mut(&node_id) {
                node.bump_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgpu_proto::message::{GpuDesc, NodeStatus};

    fn gpus(count: u32) -> Vec<GpuDesc> {
        (0..count)
            .map(|index| GpuDesc {
                index,
                model: "NVIDIA A100".into(),
                total_memory_mb: 80_000,
            })
            .collect()
    }

    #[test]
    fn heartbeat_restores_liveness() {
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7800".into(), gpus(1));
        st.nodes.get_mut("n1").unwrap().status = NodeStatus::Degraded;

        let kills = apply_heartbeat(&mut st, OrphanPolicy::Adopt, "n1", &[0], &[]);
        assert!(kills.is_empty());
        assert_eq!(st.nodes["n1"].status, NodeStatus::Online);
    }

    #[test]
    fn orphan_policy_kill_targets_unknown_jobs() {
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7800".into(), gpus(1));

        let kills = apply_heartbeat(
            &mut st,
            OrphanPolicy::Kill,
            "n1",
            &[0],
            &["feedc0de".to_string()],
        );
        assert_eq!(kills, vec![("127.0.0.1:7800".to_string(), "feedc0de".to_string())]);

        let kills = apply_heartbeat(
            &mut st,
            OrphanPolicy::Adopt,
            "n1",
            &[0],
            &["feedc0de".to_string()],
        );
        assert!(kills.is_empty());
    }

    #[test]
    fn heartbeat_from_stranger_is_ignored() {
        let mut st = MasterState::default();
        let kills = apply_heartbeat(&mut st, OrphanPolicy::Kill, "ghost", &[], &[]);
        assert!(kills.is_empty());
    }
}
