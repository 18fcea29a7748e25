//! Node records: registration data, free-GPU bookkeeping and liveness.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use mgpu_proto::message::{GpuDesc, NodeStatus, NodeView};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Consecutive start failures after which a node stops being `online`.
pub const FAILURE_DEGRADE_THRESHOLD: u32 = 3;

/// A compute host registered with the master.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: String,
    /// `host:port` the master dials for `start`/`cancel`/`query-resources`.
    pub address: String,
    pub gpus: Vec<GpuDesc>,
    /// Local indices currently unassigned.
    pub free_gpus: BTreeSet<u32>,
    pub status: NodeStatus,
    pub last_heartbeat_at: Instant,
    pub registered_at: DateTime<Utc>,
    pub failure_count: u32,
}

impl Node {
    pub fn new(node_id: String, address: String, gpus: Vec<GpuDesc>) -> Self {
        let free_gpus = gpus.iter().map(|g| g.index).collect();
        Self {
            node_id,
            address,
            gpus,
            free_gpus,
            status: NodeStatus::Online,
            last_heartbeat_at: Instant::now(),
            registered_at: Utc::now(),
            failure_count: 0,
        }
    }

    pub fn total_gpus(&self) -> usize {
        self.gpus.len()
    }

    pub fn has_gpu(&self, index: u32) -> bool {
        self.gpus.iter().any(|g| g.index == index)
    }

    /// Free GPUs that pass the advisory memory filter, ascending.
    pub fn eligible_free(&self, mem_mb: Option<u64>) -> Vec<u32> {
        self.free_gpus
            .iter()
            .copied()
            .filter(|idx| match mem_mb {
                None => true,
                Some(need) => self
                    .gpus
                    .iter()
                    .find(|g| g.index == *idx)
                    .is_some_and(|g| g.total_memory_mb >= need),
            })
            .collect()
    }

    /// Take specific GPUs out of the free set.
    pub fn allocate(&mut self, ids: &[u32]) -> Result<()> {
        for id in ids {
            if !self.free_gpus.contains(id) {
                return Err(Error::Node(format!(
                    "gpu {id} on {} is not free",
                    self.node_id
                )));
            }
        }
        for id in ids {
            self.free_gpus.remove(id);
        }
        Ok(())
    }

    /// Return GPUs to the free set. Unknown indices are ignored so the
    /// release side stays idempotent.
    pub fn release(&mut self, ids: &[u32]) {
        for id in ids {
            if self.has_gpu(*id) {
                self.free_gpus.insert(*id);
            }
        }
    }

    /// Record a heartbeat. Liveness recovers, but a node over the
    /// failure threshold stays out of placement until it re-registers.
    pub fn heartbeat(&mut self) {
        self.last_heartbeat_at = Instant::now();
        self.status = if self.failure_count >= FAILURE_DEGRADE_THRESHOLD {
            NodeStatus::Degraded
        } else {
            NodeStatus::Online
        };
    }

    /// Record a failed command RPC against this node.
    pub fn bump_failure(&mut self) {
        self.failure_count += 1;
        if self.failure_count >= FAILURE_DEGRADE_THRESHOLD {
            self.status = NodeStatus::Degraded;
        }
    }

    pub fn silent_for(&self) -> Duration {
        self.last_heartbeat_at.elapsed()
    }

    pub fn view(&self) -> NodeView {
        NodeView {
            node_id: self.node_id.clone(),
            status: self.status,
            total_gpus: self.total_gpus(),
            free_gpus: self.free_gpus.iter().copied().collect(),
            failure_count: self.failure_count,
        }
    }
}
