//! The liveness sweeper.
//!
//! A one-second tick that enforces the time-driven parts of the state
//! machine: heartbeat windows, the node-lost failure path, the cancel
//! grace deadline, interactive detach ties and retired-job retention.

use crate::config::MasterConfig;
use crate::dispatch;
use crate::state::{Ctx, MasterState};
use chrono::Utc;
use mgpu_proto::message::{JobStatus, NodeStatus};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One sweep over the shared state. Returns the cancel RPCs to issue
/// outside the lock.
pub fn sweep_once(st: &mut MasterState, cfg: &MasterConfig) -> Vec<(String, String)> {
    let degraded_after = Duration::from_secs(cfg.heartbeat_timeout_secs);
    let offline_after = degraded_after + Duration::from_secs(cfg.offline_timeout_secs);

    // Heartbeat windows.
    let mut lost_nodes = vec![];
    for node in st.nodes.values_mut() {
        if node.status == NodeStatus::Offline {
            continue;
        }
        let silent = node.silent_for();
        if silent > offline_after {
            warn!(node_id = %node.node_id, silent_secs = silent.as_secs(), "node offline");
            node.status = NodeStatus::Offline;
            node.free_gpus.clear();
            lost_nodes.push(node.node_id.clone());
        } else if silent > degraded_after && node.status == NodeStatus::Online {
            warn!(node_id = %node.node_id, silent_secs = silent.as_secs(), "node degraded");
            node.status = NodeStatus::Degraded;
        }
    }

    // Jobs stranded on lost nodes. Running jobs fail; a cancelling job
    // already got what it asked for.
    if !lost_nodes.is_empty() {
        let stranded: Vec<(String, JobStatus)> = st
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Running | JobStatus::Cancelling))
            .filter(|j| j.assignment.iter().any(|s| lost_nodes.contains(&s.node_id)))
            .map(|j| (j.id.clone(), j.status))
            .collect();
        for (job_id, status) in stranded {
            match status {
                JobStatus::Cancelling => {
                    st.retire(&job_id, JobStatus::Cancelled, -1, None, "node-lost")
                }
                _ => st.retire(&job_id, JobStatus::Failed, -1, None, "node-lost"),
            }
        }
    }

    // Cancel grace expiry: the agent never reported, force-retire.
    let now = Instant::now();
    let overdue: Vec<String> = st
        .jobs
        .values()
        .filter(|j| j.status == JobStatus::Cancelling)
        .filter(|j| j.cancel_deadline.is_some_and(|d| now >= d))
        .map(|j| j.id.clone())
        .collect();
    for job_id in overdue {
        warn!(job_id, "cancel grace expired, force-retiring");
        st.retire(&job_id, JobStatus::Cancelled, -1, None, "cancel grace expired");
    }

    // Interactive detach ties: last client gone cancels the job.
    let mut detached = vec![];
    for (job_id, output) in st.outputs.iter_mut() {
        if !output.prune_detached() && output.ever_attached() && !output.is_finished() {
            detached.push(job_id.clone());
        }
    }
    let mut cancels = vec![];
    for job_id in detached {
        let wants_tie = st
            .jobs
            .get(&job_id)
            .is_some_and(|j| j.cancel_on_detach && j.status == JobStatus::Running);
        if wants_tie {
            info!(job_id, "last client detached, cancelling");
            cancels.extend(
                st.begin_cancel(&job_id, Duration::from_secs(cfg.cancel_grace_secs)),
            );
        }
    }

    // Retired-job retention.
    let cutoff = chrono::Duration::seconds(cfg.retired_retention_secs as i64);
    let now_wall = Utc::now();
    let expired: Vec<String> = st
        .jobs
        .values()
        .filter(|j| j.is_terminal())
        .filter(|j| j.ended_at.is_some_and(|t| now_wall - t > cutoff))
        .map(|j| j.id.clone())
        .collect();
    for job_id in expired {
        st.jobs.remove(&job_id);
        st.outputs.remove(&job_id);
    }

    cancels
}

/// The sweeper task.
pub async fn run(ctx: Ctx) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let had_lost;
        let cancels = {
            let mut st = ctx.state.lock();
            let before = st.jobs.len();
            let cancels = sweep_once(&mut st, &ctx.cfg);
            had_lost = st.jobs.len() != before || !cancels.is_empty();
            cancels
        };
        for (address, job_id) in cancels {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(err) = dispatch::cancel(&address, &job_id).await {
                    warn!(%address, job_id, %err, "cancel RPC failed");
                }
                ctx.wake.notify_one();
            });
        }
        if had_lost {
            ctx.wake.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NodeShare;
    use mgpu_proto::message::{DistributedKind, GpuDesc, JobSpec};

    fn gpus(count: u32) -> Vec<GpuDesc> {
        (0..count)
            .map(|index| GpuDesc {
                index,
                model: "NVIDIA A100".into(),
                total_memory_mb: 80_000,
            })
            .collect()
    }

    fn spec() -> JobSpec {
        JobSpec {
            owner: "alice".into(),
            command: "sleep 100".into(),
            gpus: 1,
            pins: vec![],
            priority: 0,
            distributed: DistributedKind::None,
            interactive: false,
            cancel_on_detach: None,
            mem_mb: None,
        }
    }

    fn run_on(st: &mut MasterState, job_id: &str, node_id: &str) {
        st.nodes.get_mut(node_id).unwrap().allocate(&[0]).unwrap();
        st.pending.remove(job_id);
        let job = st.jobs.get_mut(job_id).unwrap();
        job.transition(JobStatus::Running, "placed");
        job.assignment = vec![NodeShare {
            node_id: node_id.into(),
            gpu_ids: vec![0],
            pid: Some(4242),
            exited: None,
        }];
    }

    fn silence(st: &mut MasterState, node_id: &str, secs: u64) {
        st.nodes.get_mut(node_id).unwrap().last_heartbeat_at =
            Instant::now() - Duration::from_secs(secs);
    }

    #[test]
    fn silence_degrades_then_offlines() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7800".into(), gpus(1));

        silence(&mut st, "n1", 31);
        sweep_once(&mut st, &cfg);
        assert_eq!(st.nodes["n1"].status, NodeStatus::Degraded);

        silence(&mut st, "n1", 95);
        sweep_once(&mut st, &cfg);
        assert_eq!(st.nodes["n1"].status, NodeStatus::Offline);
    }

    #[test]
    fn node_loss_fails_running_jobs_and_releases_gpus() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7800".into(), gpus(1));
        let id = st.submit(spec(), 1024).unwrap();
        run_on(&mut st, &id, "n1");

        silence(&mut st, "n1", 120);
        sweep_once(&mut st, &cfg);

        let job = &st.jobs[&id];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "node-lost");
        assert!(job.assignment.is_empty());
        // the offline node's free set is cleared, not double-counted
        assert!(st.nodes["n1"].free_gpus.is_empty());
    }

    #[test]
    fn cancel_grace_expiry_force_retires() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7800".into(), gpus(1));
        let id = st.submit(spec(), 1024).unwrap();
        run_on(&mut st, &id, "n1");

        let targets = st.begin_cancel(&id, Duration::from_secs(0));
        assert_eq!(targets.len(), 1);
        assert_eq!(st.jobs[&id].status, JobStatus::Cancelling);

        sweep_once(&mut st, &cfg);
        assert_eq!(st.jobs[&id].status, JobStatus::Cancelled);
        assert_eq!(st.nodes["n1"].free_gpus.len(), 1);
    }

    #[test]
    fn detach_tie_cancels_interactive_jobs() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7800".into(), gpus(1));
        let mut s = spec();
        s.interactive = true;
        let id = st.submit(s, 1024).unwrap();
        run_on(&mut st, &id, "n1");

        let rx = st.outputs.get_mut(&id).unwrap().attach(&id);
        assert!(sweep_once(&mut st, &cfg).is_empty());

        drop(rx);
        let cancels = sweep_once(&mut st, &cfg);
        assert_eq!(cancels.len(), 1);
        assert_eq!(st.jobs[&id].status, JobStatus::Cancelling);
    }

    #[test]
    fn old_terminal_jobs_are_dropped() {
        let cfg = MasterConfig { retired_retention_secs: 0, ..Default::default() };
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7800".into(), gpus(1));
        let id = st.submit(spec(), 1024).unwrap();
        st.pending.remove(&id);
        st.retire(&id, JobStatus::Completed, 0, None, "exit 0");
        st.jobs.get_mut(&id).unwrap().ended_at =
            Some(Utc::now() - chrono::Duration::seconds(10));

        sweep_once(&mut st, &cfg);
        assert!(!st.jobs.contains_key(&id));
        assert!(!st.outputs.contains_key(&id));
    }
}
