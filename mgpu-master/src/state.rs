//! Shared master state.
//!
//! One mutex guards the job table, the node registry and the output
//! rings together, so GPU-set mutations and job-status transitions are
//! always observed atomically (a GPU can never appear in two running
//! assignments). Critical sections stay short; all socket I/O happens
//! outside the lock.

use crate::config::MasterConfig;
use crate::job::{gen_job_id, Job};
use crate::node::Node;
use crate::output::JobOutput;
use mgpu_proto::message::{ErrorCode, GpuDesc, JobSpec, JobStatus, JobView, Message, NodeView};
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Queue rank: priority first, then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueRank {
    pub priority: i64,
    pub order: Reverse<u64>,
}

/// The master context handed to every task.
pub struct Master {
    pub cfg: MasterConfig,
    pub state: Mutex<MasterState>,
    /// Wakes the scheduler on submissions, completions and node changes.
    pub wake: Notify,
}

pub type Ctx = Arc<Master>;

impl Master {
    pub fn new(cfg: MasterConfig) -> Ctx {
        Arc::new(Self {
            cfg,
            state: Mutex::new(MasterState::default()),
            wake: Notify::new(),
        })
    }
}

#[derive(Default)]
pub struct MasterState {
    pub jobs: HashMap<String, Job>,
    pub pending: PriorityQueue<String, QueueRank>,
    pub nodes: HashMap<String, Node>,
    pub outputs: HashMap<String, JobOutput>,
    next_seq: u64,
}

impl MasterState {
    /// Validate a spec and put the job on the queue.
    pub fn submit(
        &mut self,
        spec: JobSpec,
        ring_capacity: usize,
    ) -> Result<String, (ErrorCode, String)> {
        if spec.command.trim().is_empty() {
            return Err((ErrorCode::InvalidSpec, "empty command".into()));
        }
        if spec.pins.is_empty() && spec.gpus == 0 {
            return Err((ErrorCode::InvalidSpec, "job requests no GPUs".into()));
        }

        if spec.pins.is_empty() {
            // A request larger than the whole cluster can never be placed.
            let total = self.total_gpus();
            if !self.nodes.is_empty() && spec.gpus as usize > total {
                return Err((
                    ErrorCode::ResourceUnsatisfiableForever,
                    format!("{} GPUs requested, cluster has {total}", spec.gpus),
                ));
            }
        } else {
            let mut seen = std::collections::HashSet::new();
            for pin in &spec.pins {
                let node = self.nodes.get(&pin.node_id).ok_or_else(|| {
                    (
                        ErrorCode::ResourceUnsatisfiableForever,
                        format!("pin references unknown node {}", pin.node_id),
                    )
                })?;
                if pin.gpu_ids.is_empty() {
                    return Err((
                        ErrorCode::InvalidSpec,
                        format!("pin on {} lists no GPUs", pin.node_id),
                    ));
                }
                for gpu in &pin.gpu_ids {
                    if !node.has_gpu(*gpu) {
                        return Err((
                            ErrorCode::ResourceUnsatisfiableForever,
                            format!("pin references unknown gpu {}:{gpu}", pin.node_id),
                        ));
                    }
                    if !seen.insert((pin.node_id.clone(), *gpu)) {
                        return Err((
                            ErrorCode::InvalidSpec,
                            format!("duplicate pin {}:{gpu}", pin.node_id),
                        ));
                    }
                }
            }
        }

        let id = gen_job_id(|candidate| self.jobs.contains_key(candidate));
        let seq = self.next_seq;
        self.next_seq += 1;
        let job = Job::new(id.clone(), seq, spec);
        let rank = QueueRank { priority: job.priority, order: Reverse(seq) };

        info!(job_id = %id, owner = %job.owner, gpus = job.gpu_count(), priority = job.priority, "job submitted");
        self.outputs.insert(id.clone(), JobOutput::new(ring_capacity));
        self.jobs.insert(id.clone(), job);
        self.pending.push(id.clone(), rank);
        Ok(id)
    }

    /// Register (or re-register) a node. Re-registration clears the
    /// failure quarantine and rebuilds the free set from the jobs the
    /// master still believes are running there.
    pub fn register_node(&mut self, node_id: String, address: String, gpus: Vec<GpuDesc>) {
        let mut node = Node::new(node_id.clone(), address, gpus);
        let held: Vec<u32> = self
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .flat_map(|j| j.assignment.iter())
            .filter(|s| s.node_id == node_id)
            .flat_map(|s| s.gpu_ids.iter().copied())
            .collect();
        for gpu in held {
            node.free_gpus.remove(&gpu);
        }
        info!(node_id = %node.node_id, gpus = node.total_gpus(), free = node.free_gpus.len(), "node registered");
        self.nodes.insert(node_id, node);
    }

    pub fn total_gpus(&self) -> usize {
        self.nodes.values().map(|n| n.total_gpus()).sum()
    }

    /// Give a job's GPUs back to their nodes' free sets.
    pub fn release_assignment(&mut self, job_id: &str) {
        let shares: Vec<(String, Vec<u32>)> = match self.jobs.get(job_id) {
            Some(job) => job
                .assignment
                .iter()
                .map(|s| (s.node_id.clone(), s.gpu_ids.clone()))
                .collect(),
            None => return,
        };
        for (node_id, gpus) in shares {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.release(&gpus);
            }
        }
    }

    /// Retire a job into a terminal state: release GPUs, clear the
    /// assignment, close the output stream. Terminal states are sticky;
    /// a late duplicate retire changes nothing.
    pub fn retire(
        &mut self,
        job_id: &str,
        status: JobStatus,
        code: i32,
        signal: Option<i32>,
        reason: &str,
    ) {
        debug_assert!(status.is_terminal());
        match self.jobs.get(job_id) {
            None => {
                warn!(job_id, "retire for unknown job");
                return;
            }
            Some(job) if job.is_terminal() => return,
            Some(_) => {}
        }
        self.release_assignment(job_id);
        let Some(job) = self.jobs.get_mut(job_id) else { return };
        job.exit_code = Some(code);
        job.exit_signal = signal;
        job.cancel_deadline = None;
        job.transition(status, reason);
        let node_id = job.assignment.first().map(|s| s.node_id.clone()).unwrap_or_default();
        job.assignment.clear();
        info!(job_id, status = ?status, code, ?signal, reason, "job retired");
        let exit = Message::Exit { job_id: job_id.to_string(), node_id, code, signal };
        if let Some(output) = self.outputs.get_mut(job_id) {
            output.finish(exit);
        }
    }

    /// Record one node's exit report. Returns `true` when every share of
    /// the job has reported and the caller should retire it.
    pub fn record_share_exit(
        &mut self,
        job_id: &str,
        node_id: &str,
        code: i32,
        signal: Option<i32>,
    ) -> bool {
        let Some(job) = self.jobs.get_mut(job_id) else {
            warn!(job_id, node_id, "exit report for unknown job");
            return false;
        };
        if !matches!(job.status, JobStatus::Running | JobStatus::Cancelling) {
            // A stray exit from a rolled-back or already-retired launch.
            return false;
        }
        match job.assignment.iter().position(|s| s.node_id == node_id) {
            Some(idx) => job.assignment[idx].exited = Some((code, signal)),
            None if job.assignment.len() == 1 => {
                // Old agents omit node_id; unambiguous for single-node jobs.
                job.assignment[0].exited = Some((code, signal));
            }
            None => {
                warn!(job_id, node_id, "exit report from node outside the assignment");
                return false;
            }
        }
        job.assignment.iter().all(|s| s.exited.is_some())
    }

    /// Terminal outcome for a fully-reported job.
    pub fn exit_outcome(&self, job_id: &str) -> Option<(JobStatus, i32, Option<i32>, String)> {
        let job = self.jobs.get(job_id)?;
        if job.status == JobStatus::Cancelling {
            let (code, signal) = first_failure(&job.assignment).unwrap_or((0, Some(SIGTERM)));
            return Some((JobStatus::Cancelled, code, signal, "cancelled".into()));
        }
        match first_failure(&job.assignment) {
            None => Some((JobStatus::Completed, 0, None, "exit 0".into())),
            Some((code, signal)) => {
                let reason = match signal {
                    Some(sig) => format!("killed by signal {sig}"),
                    None => format!("exit code {code}"),
                };
                Some((JobStatus::Failed, code, signal, reason))
            }
        }
    }

    pub fn snapshot(&self) -> (Vec<JobView>, Vec<NodeView>) {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|j| !j.is_terminal()).collect();
        jobs.sort_by_key(|j| j.seq);
        let mut nodes: Vec<NodeView> = self.nodes.values().map(Node::view).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        (jobs.into_iter().map(Job::view).collect(), nodes)
    }

    /// Move a running job to `cancelling` and list the `(address,
    /// job_id)` cancel RPCs to issue once the lock is released.
    pub fn begin_cancel(&mut self, job_id: &str, grace: std::time::Duration) -> Vec<(String, String)> {
        let node_ids: Vec<String> = match self.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Running => {
                job.transition(JobStatus::Cancelling, "cancel requested");
                job.cancel_deadline = Some(std::time::Instant::now() + grace);
                job.assignment.iter().map(|s| s.node_id.clone()).collect()
            }
            _ => return vec![],
        };
        node_ids
            .iter()
            .filter_map(|nid| self.nodes.get(nid))
            .map(|n| (n.address.clone(), job_id.to_string()))
            .collect()
    }

    /// Put a rolled-back job back on the queue, keeping its original
    /// submission order.
    pub fn requeue(&mut self, job_id: &str) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.status = JobStatus::Queued;
            job.assignment.clear();
            let rank = QueueRank { priority: job.priority, order: Reverse(job.seq) };
            self.pending.push(job_id.to_string(), rank);
        }
    }
}

const SIGTERM: i32 = 15;

fn first_failure(shares: &[crate::job::NodeShare]) -> Option<(i32, Option<i32>)> {
    shares
        .iter()
        .filter_map(|s| s.exited)
        .find(|(code, signal)| *code != 0 || signal.is_some())
}
