//! Placement and the scheduler loop.
//!
//! A single task wakes on submissions, completions, node changes and a
//! one-second tick. Each cycle walks the queue in (priority desc,
//! submitted asc) order, allocates GPUs under the state lock, and then
//! issues `start` RPCs outside it. A failed start rolls the whole
//! allocation back and requeues the job.

use crate::config::MasterConfig;
use crate::dispatch;
use crate::job::{Job, NodeShare};
use crate::node::Node;
use crate::state::{Ctx, MasterState};
use mgpu_proto::message::{DistributedEnv, DistributedKind, JobStatus, Message};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One `start` RPC of a plan.
pub struct NodeStart {
    pub node_id: String,
    pub address: String,
    pub msg: Message,
}

/// Everything needed to launch one placed job, captured under the lock.
pub struct StartPlan {
    pub job_id: String,
    pub starts: Vec<NodeStart>,
}

enum Placement {
    Shares(Vec<(String, Vec<u32>)>),
    /// Leave the job in the queue for a later cycle.
    Skip,
    /// The job can never be placed.
    Fail(String),
}

fn place(nodes: &HashMap<String, Node>, job: &Job) -> Placement {
    if !job.pins.is_empty() {
        return place_pinned(nodes, job);
    }

    let need = job.requested_gpus as usize;

    // Prefer a single node that fits the whole request.
    let single = nodes
        .values()
        .filter(|n| n.status == mgpu_proto::message::NodeStatus::Online)
        .filter(|n| n.eligible_free(job.mem_mb).len() >= need)
        .min_by_key(|n| (n.failure_count, n.node_id.clone()));
    if let Some(node) = single {
        let gpus = node.eligible_free(job.mem_mb)[..need].to_vec();
        return Placement::Shares(vec![(node.node_id.clone(), gpus)]);
    }

    // Otherwise span nodes greedily, largest free pool first.
    let mut candidates: Vec<(&Node, Vec<u32>)> = nodes
        .values()
        .filter(|n| n.status == mgpu_proto::message::NodeStatus::Online)
        .map(|n| (n, n.eligible_free(job.mem_mb)))
        .filter(|(_, free)| !free.is_empty())
        .collect();
    candidates.sort_by(|(a, fa), (b, fb)| {
        fb.len()
            .cmp(&fa.len())
            .then(a.failure_count.cmp(&b.failure_count))
            .then(a.node_id.cmp(&b.node_id))
    });

    let mut shares = vec![];
    let mut remaining = need;
    for (node, free) in candidates {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(free.len());
        shares.push((node.node_id.clone(), free[..take].to_vec()));
        remaining -= take;
    }
    if remaining > 0 {
        debug!(job_id = %job.id, need, "not enough free GPUs this cycle");
        return Placement::Skip;
    }
    Placement::Shares(shares)
}

fn place_pinned(nodes: &HashMap<String, Node>, job: &Job) -> Placement {
    use mgpu_proto::message::NodeStatus;

    for pin in &job.pins {
        let Some(node) = nodes.get(&pin.node_id) else {
            return Placement::Fail(format!("pinned node {} is gone", pin.node_id));
        };
        match node.status {
            NodeStatus::Offline => {
                return Placement::Fail(format!("pinned node {} is offline", pin.node_id));
            }
            NodeStatus::Degraded => return Placement::Skip,
            NodeStatus::Online => {}
        }
        if !pin.gpu_ids.iter().all(|g| node.free_gpus.contains(g)) {
            return Placement::Skip;
        }
    }
    Placement::Shares(
        job.pins.iter().map(|p| (p.node_id.clone(), p.gpu_ids.clone())).collect(),
    )
}

/// Run one placement pass under the lock. Allocates GPUs, marks jobs
/// running, and returns the `start` plans to execute outside it.
pub fn plan_cycle(st: &mut MasterState, cfg: &MasterConfig) -> Vec<StartPlan> {
    let mut ordered: Vec<(String, crate::state::QueueRank)> =
        st.pending.iter().map(|(id, rank)| (id.clone(), *rank)).collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1));

    let mut plans = vec![];
    for (job_id, _) in ordered {
        let Some(job) = st.jobs.get(&job_id) else {
            st.pending.remove(&job_id);
            continue;
        };
        match place(&st.nodes, job) {
            Placement::Skip => continue,
            Placement::Fail(reason) => {
                warn!(job_id, %reason, "job is unplaceable");
                st.pending.remove(&job_id);
                st.retire(&job_id, JobStatus::Failed, -1, None, &reason);
            }
            Placement::Shares(shares) => {
                for (node_id, gpus) in &shares {
                    if let Some(node) = st.nodes.get_mut(node_id) {
                        // Free sets were checked under this same lock.
                        if let Err(err) = node.allocate(gpus) {
                            warn!(job_id, %err, "allocation lost a race; skipping");
                        }
                    }
                }
                st.pending.remove(&job_id);
                let Some(job) = st.jobs.get_mut(&job_id) else { continue };
                job.assignment = shares
                    .iter()
                    .map(|(node_id, gpus)| NodeShare {
                        node_id: node_id.clone(),
                        gpu_ids: gpus.clone(),
                        pid: None,
                        exited: None,
                    })
                    .collect();
                job.transition(JobStatus::Running, "placed");
                let starts = build_starts(&st.nodes, job, cfg, &shares);
                info!(job_id, nodes = shares.len(), "job placed");
                plans.push(StartPlan { job_id, starts });
            }
        }
    }
    plans
}

fn build_starts(
    nodes: &HashMap<String, Node>,
    job: &Job,
    cfg: &MasterConfig,
    shares: &[(String, Vec<u32>)],
) -> Vec<NodeStart> {
    let world_size = shares.len() as u32;
    let master_host = shares
        .first()
        .and_then(|(node_id, _)| nodes.get(node_id))
        .map(|n| host_of(&n.address))
        .unwrap_or_default();

    shares
        .iter()
        .enumerate()
        .map(|(rank, (node_id, gpus))| {
            let distributed = match job.distributed {
                DistributedKind::TorchDistributed => Some(DistributedEnv {
                    kind: DistributedKind::TorchDistributed,
                    rank: rank as u32,
                    world_size,
                    master_host: master_host.clone(),
                    master_port: cfg.torch_master_port,
                }),
                // mpi and plain jobs get no rendezvous variables
                DistributedKind::Mpi | DistributedKind::None => None,
            };
            let address =
                nodes.get(node_id).map(|n| n.address.clone()).unwrap_or_default();
            NodeStart {
                node_id: node_id.clone(),
                address,
                msg: Message::Start {
                    job_id: job.id.clone(),
                    node_id: node_id.clone(),
                    command: job.command.clone(),
                    assigned_gpus: gpus.clone(),
                    env_extras: BTreeMap::new(),
                    distributed,
                },
            }
        })
        .collect()
}

fn host_of(address: &str) -> String {
    address.rsplit_once(':').map(|(host, _)| host).unwrap_or(address).to_string()
}

/// Undo a placement whose `start` RPCs (partially) failed. Returns
/// true when the job went back on the queue, false when it was retired.
pub fn apply_start_failure(
    st: &mut MasterState,
    cfg: &MasterConfig,
    job_id: &str,
    failed_nodes: &[String],
) -> bool {
    for node_id in failed_nodes {
        if let Some(node) = st.nodes.get_mut(node_id) {
            node.bump_failure();
        }
    }
    st.release_assignment(job_id);
    let Some(job) = st.jobs.get_mut(job_id) else { return false };
    match job.status {
        JobStatus::Running => {
            job.assignment.clear();
            job.retry_count += 1;
            if job.retry_count > cfg.start_retry_budget {
                let reason =
                    format!("placement failed after {} attempts", job.retry_count);
                st.retire(job_id, JobStatus::Failed, -1, None, &reason);
                false
            } else {
                st.requeue(job_id);
                true
            }
        }
        JobStatus::Cancelling => {
            st.retire(job_id, JobStatus::Cancelled, -1, None, "cancelled during start");
            false
        }
        _ => false,
    }
}

/// Execute one plan: fire the `start` RPCs concurrently, then either
/// record pids or roll the allocation back.
pub async fn launch(ctx: Ctx, plan: StartPlan) {
    let results = futures::future::join_all(plan.starts.iter().map(|s| async move {
        let outcome = dispatch::start(&s.address, &s.msg).await;
        (s, outcome)
    }))
    .await;

    let mut failed_nodes = vec![];
    let mut started = vec![];
    for (start, outcome) in results {
        match outcome {
            Ok(pid) => started.push((start, pid)),
            Err(err) => {
                warn!(job_id = %plan.job_id, node_id = %start.node_id, %err, "start RPC failed");
                failed_nodes.push(start.node_id.clone());
            }
        }
    }

    if failed_nodes.is_empty() {
        let mut st = ctx.state.lock();
        if let Some(job) = st.jobs.get_mut(&plan.job_id) {
            for (start, pid) in started {
                if let Some(share) =
                    job.assignment.iter_mut().find(|s| s.node_id == start.node_id)
                {
                    share.pid = pid;
                }
            }
        }
        return;
    }

    let requeued = {
        let mut st = ctx.state.lock();
        apply_start_failure(&mut st, &ctx.cfg, &plan.job_id, &failed_nodes)
    };
    if requeued {
        info!(job_id = %plan.job_id, "allocation rolled back, job requeued");
    }

    // Reap the halves that did launch before the rollback.
    for (start, _) in started {
        if let Err(err) = dispatch::cancel(&start.address, &plan.job_id).await {
            warn!(node_id = %start.node_id, %err, "rollback cancel failed");
        }
    }
    ctx.wake.notify_one();
}

/// The scheduler task.
pub async fn run(ctx: Ctx) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ctx.wake.notified() => {}
            _ = tick.tick() => {}
        }
        let plans = {
            let mut st = ctx.state.lock();
            plan_cycle(&mut st, &ctx.cfg)
        };
        for plan in plans {
            tokio::spawn(launch(ctx.clone(), plan));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgpu_proto::message::{GpuDesc, GpuPin, JobSpec, NodeStatus};

    fn gpus(count: u32) -> Vec<GpuDesc> {
        (0..count)
            .map(|index| GpuDesc {
                index,
                model: "NVIDIA A100".into(),
                total_memory_mb: 80_000,
            })
            .collect()
    }

    fn spec(gpu_count: u32) -> JobSpec {
        JobSpec {
            owner: "alice".into(),
            command: "echo hi".into(),
            gpus: gpu_count,
            pins: vec![],
            priority: 0,
            distributed: DistributedKind::None,
            interactive: false,
            cancel_on_detach: None,
            mem_mb: None,
        }
    }

    fn cluster(st: &mut MasterState, nodes: &[(&str, u32)]) {
        for (i, (id, count)) in nodes.iter().enumerate() {
            st.register_node(
                (*id).to_string(),
                format!("127.0.0.1:78{i:02}"),
                gpus(*count),
            );
        }
    }

    #[test]
    fn priority_then_fifo_run_order() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        cluster(&mut st, &[("n1", 1)]);

        let j1 = st.submit(spec(1), 1024).unwrap();
        let mut high = spec(1);
        high.priority = 5;
        let j2 = st.submit(high.clone(), 1024).unwrap();
        let j3 = st.submit(high, 1024).unwrap();

        // only one GPU: each cycle places exactly the current winner
        let run_one = |st: &mut MasterState| -> String {
            let plans = plan_cycle(st, &cfg);
            assert_eq!(plans.len(), 1);
            let id = plans[0].job_id.clone();
            // pretend it finished
            st.retire(&id, JobStatus::Completed, 0, None, "exit 0");
            id
        };

        assert_eq!(run_one(&mut st), j2);
        assert_eq!(run_one(&mut st), j3);
        assert_eq!(run_one(&mut st), j1);
    }

    #[test]
    fn pinned_job_waits_for_its_gpu() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        cluster(&mut st, &[("n1", 1), ("n2", 1)]);

        let mut a = spec(0);
        a.pins = vec![GpuPin { node_id: "n1".into(), gpu_ids: vec![0] }];
        let job_a = st.submit(a.clone(), 1024).unwrap();
        let plans = plan_cycle(&mut st, &cfg);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].job_id, job_a);

        // B pins the same GPU and must stay queued while A runs
        let job_b = st.submit(a, 1024).unwrap();
        assert!(plan_cycle(&mut st, &cfg).is_empty());
        assert_eq!(st.jobs[&job_b].status, JobStatus::Queued);

        st.retire(&job_a, JobStatus::Completed, 0, None, "exit 0");
        let plans = plan_cycle(&mut st, &cfg);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].job_id, job_b);
        assert_eq!(st.jobs[&job_b].assignment[0].gpu_ids, vec![0]);
    }

    #[test]
    fn pinned_job_fails_when_node_goes_offline() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        cluster(&mut st, &[("n1", 1)]);

        let mut a = spec(0);
        a.pins = vec![GpuPin { node_id: "n1".into(), gpu_ids: vec![0] }];
        let id = st.submit(a, 1024).unwrap();

        st.nodes.get_mut("n1").unwrap().status = NodeStatus::Offline;
        assert!(plan_cycle(&mut st, &cfg).is_empty());
        assert_eq!(st.jobs[&id].status, JobStatus::Failed);
        assert!(st.pending.is_empty());
    }

    #[test]
    fn single_node_placement_is_preferred() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        cluster(&mut st, &[("big", 4), ("small", 2)]);

        let id = st.submit(spec(2), 1024).unwrap();
        let plans = plan_cycle(&mut st, &cfg);
        assert_eq!(plans.len(), 1);
        let job = &st.jobs[&id];
        assert_eq!(job.assignment.len(), 1, "should not span nodes");
    }

    #[test]
    fn spanning_assigns_distinct_torch_ranks() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        cluster(&mut st, &[("n1", 1), ("n2", 1)]);

        let mut s = spec(2);
        s.distributed = DistributedKind::TorchDistributed;
        let id = st.submit(s, 1024).unwrap();

        let mut plans = plan_cycle(&mut st, &cfg);
        assert_eq!(plans.len(), 1);
        let plan = plans.pop().unwrap();
        assert_eq!(plan.starts.len(), 2);

        let mut ranks = vec![];
        for start in &plan.starts {
            match &start.msg {
                Message::Start { assigned_gpus, distributed, .. } => {
                    assert_eq!(assigned_gpus, &vec![0]);
                    let env = distributed.as_ref().expect("torch env");
                    assert_eq!(env.world_size, 2);
                    ranks.push(env.rank);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1]);
        assert_eq!(st.jobs[&id].assignment.len(), 2);
    }

    #[test]
    fn start_failure_rolls_back_and_requeues() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        cluster(&mut st, &[("n1", 1)]);

        let id = st.submit(spec(1), 1024).unwrap();
        let plans = plan_cycle(&mut st, &cfg);
        assert_eq!(plans.len(), 1);
        assert!(st.nodes["n1"].free_gpus.is_empty());

        let requeued = apply_start_failure(&mut st, &cfg, &id, &["n1".to_string()]);
        assert!(requeued);
        assert_eq!(st.nodes["n1"].free_gpus.len(), 1, "rollback must free GPUs");
        assert_eq!(st.jobs[&id].status, JobStatus::Queued);
        assert_eq!(st.jobs[&id].retry_count, 1);
        assert_eq!(st.nodes["n1"].failure_count, 1);
        assert_eq!(st.pending.len(), 1);
    }

    #[test]
    fn retry_budget_exhaustion_fails_the_job() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        cluster(&mut st, &[("n1", 1)]);

        let id = st.submit(spec(1), 1024).unwrap();
        let plans = plan_cycle(&mut st, &cfg);
        assert_eq!(plans.len(), 1);
        st.jobs.get_mut(&id).unwrap().retry_count = cfg.start_retry_budget;

        let requeued = apply_start_failure(&mut st, &cfg, &id, &["n1".to_string()]);
        assert!(!requeued);
        assert_eq!(st.jobs[&id].status, JobStatus::Failed);
        assert_eq!(st.nodes["n1"].free_gpus.len(), 1);
        assert!(st.pending.is_empty());
    }

    #[test]
    fn degraded_nodes_are_not_candidates() {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        cluster(&mut st, &[("n1", 2)]);
        st.nodes.get_mut("n1").unwrap().status = NodeStatus::Degraded;

        let id = st.submit(spec(1), 1024).unwrap();
        assert!(plan_cycle(&mut st, &cfg).is_empty());
        assert_eq!(st.jobs[&id].status, JobStatus::Queued);
    }
}
