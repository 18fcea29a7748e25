//! Message types exchanged between clients, master and node agents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hard cap on the raw payload of a single `out` chunk.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Job lifecycle state as visible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    /// Cancel requested for a running job; terminal state pending.
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Node liveness as tracked by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

/// How a job wants its launch environment decorated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DistributedKind {
    #[default]
    None,
    TorchDistributed,
    Mpi,
}

/// Which child stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One GPU as reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDesc {
    /// Physical index on the host (the index CUDA sees).
    pub index: u32,
    pub model: String,
    pub total_memory_mb: u64,
}

/// An explicit `node:gpus` placement constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuPin {
    pub node_id: String,
    pub gpu_ids: Vec<u32>,
}

/// A job as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub owner: String,
    pub command: String,
    /// Number of GPUs wanted; ignored when `pins` is non-empty.
    #[serde(default)]
    pub gpus: u32,
    /// Explicit placement. When non-empty this overrides `gpus`.
    #[serde(default)]
    pub pins: Vec<GpuPin>,
    /// Larger runs first.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub distributed: DistributedKind,
    #[serde(default)]
    pub interactive: bool,
    /// Cancel the job when the last attached client goes away.
    /// Unset defaults to the value of `interactive`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_on_detach: Option<bool>,
    /// Advisory per-GPU memory requirement; filters placement, never reserves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_mb: Option<u64>,
}

/// Distributed-launch environment computed by the master for one node
/// of a multi-node assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedEnv {
    pub kind: DistributedKind,
    pub rank: u32,
    pub world_size: u32,
    pub master_host: String,
    pub master_port: u16,
}

/// Machine-readable error codes on the client surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidSpec,
    UnknownJob,
    ResourceUnsatisfiableForever,
    NotRunningAndNoHistory,
    NodeLost,
    Internal,
}

/// One `(node, gpus, pid)` element of a running job's assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentView {
    pub node_id: String,
    pub gpu_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Job summary in a `snapshot` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub owner: String,
    pub command: String,
    pub status: JobStatus,
    pub priority: i64,
    pub gpus: u32,
    #[serde(default)]
    pub assignment: Vec<AssignmentView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Node summary in a `snapshot` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: String,
    pub status: NodeStatus,
    pub total_gpus: usize,
    pub free_gpus: Vec<u32>,
    pub failure_count: u32,
}

/// Every message that crosses a socket, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    // agent -> master
    Register {
        node_id: String,
        /// `host:port` the master dials back for commands.
        address: String,
        gpus: Vec<GpuDesc>,
    },
    Heartbeat {
        node_id: String,
        free_gpus: Vec<u32>,
        #[serde(default)]
        running: Vec<String>,
        ts: i64,
    },
    Resources {
        gpus: Vec<GpuDesc>,
        free_gpus: Vec<u32>,
    },
    Out {
        job_id: String,
        stream: StreamKind,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Exit {
        job_id: String,
        /// Reporting node; multi-node jobs retire once every share has
        /// reported.
        #[serde(default)]
        node_id: String,
        code: i32,
        signal: Option<i32>,
    },

    // master -> agent
    QueryResources,
    Start {
        job_id: String,
        node_id: String,
        command: String,
        /// Physical GPU indices on the target host.
        assigned_gpus: Vec<u32>,
        #[serde(default)]
        env_extras: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distributed: Option<DistributedEnv>,
    },

    // master -> agent and client -> master
    Cancel {
        job_id: String,
    },

    // client -> master
    Submit {
        spec: JobSpec,
    },
    Queue,
    Attach {
        job_id: String,
    },

    // replies
    Snapshot {
        jobs: Vec<JobView>,
        nodes: Vec<NodeView>,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prior_status: Option<JobStatus>,
        /// Pid of the spawned process group, in the ack to a `start`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Error {
        code: ErrorCode,
        reason: String,
    },
}

/// Base64 (standard alphabet) encoding for chunk payloads.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
