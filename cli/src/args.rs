//! Command-line surface of the `mgpu` client.

use clap::{Args, Parser, Subcommand};
use mgpu_proto::message::{DistributedKind, GpuPin, JobSpec};
use std::str::FromStr;

#[derive(Debug, Parser)]
#[command(name = "mgpu", about = "mgpu cluster client", version)]
pub struct Cli {
    /// Master host.
    #[arg(long, global = true, env = "MGPU_MASTER_HOST", default_value = "127.0.0.1")]
    pub master_host: String,
    /// Master client port.
    #[arg(long, global = true, env = "MGPU_MASTER_PORT", default_value_t = 7700)]
    pub master_port: u16,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a job.
    Submit(SubmitArgs),
    /// Show queued and running jobs and the cluster's nodes.
    Queue,
    /// Cancel a job.
    Cancel {
        job_id: String,
        #[command(flatten)]
        timeouts: TimeoutArgs,
    },
    /// Attach to a job's output stream.
    Monitor {
        job_id: String,
        #[command(flatten)]
        timeouts: TimeoutArgs,
    },
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Shell command to execute (joined with spaces).
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
    /// Number of GPUs to allocate.
    #[arg(long, default_value_t = 1)]
    pub gpus: u32,
    /// Pin placement explicitly, e.g. "n1:0,1;n2:2". Overrides --gpus.
    #[arg(long)]
    pub node_gpu_ids: Option<PinList>,
    /// Larger runs first.
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i64,
    /// Stay attached and stream the job's output.
    #[arg(long, short = 'i')]
    pub interactive: bool,
    /// Inject torch-distributed rendezvous variables.
    #[arg(long, conflicts_with = "mpi")]
    pub distributed: bool,
    /// Mark the job as MPI (no extra env injection).
    #[arg(long)]
    pub mpi: bool,
    /// Advisory per-GPU memory requirement in MB.
    #[arg(long)]
    pub mem: Option<u64>,
    /// Job owner label; defaults to $USER.
    #[arg(long, env = "USER", default_value = "unknown")]
    pub owner: String,
    /// Keep the job running when this client disconnects.
    #[arg(long)]
    pub no_cancel_on_detach: bool,
    #[command(flatten)]
    pub timeouts: TimeoutArgs,
}

/// The four client timeouts; all unbounded unless given. Long training
/// jobs must never be aborted by a silent client-side default.
#[derive(Debug, Clone, Copy, Default, Args)]
pub struct TimeoutArgs {
    /// Whole attach lifetime, seconds.
    #[arg(long)]
    pub session_timeout: Option<u64>,
    /// TCP connect timeout, seconds.
    #[arg(long)]
    pub connection_timeout: Option<u64>,
    /// Per-read timeout while attached, seconds.
    #[arg(long)]
    pub max_wait_time: Option<u64>,
    /// Consecutive read timeouts tolerated before giving up.
    #[arg(long)]
    pub max_consecutive_timeouts: Option<u32>,
}

/// `node:gpus` pin syntax: `n1:0,1;n2:2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinList(pub Vec<GpuPin>);

impl FromStr for PinList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pins = vec![];
        for part in s.split(';').filter(|p| !p.trim().is_empty()) {
            let (node, gpus) = part
                .split_once(':')
                .ok_or_else(|| format!("expected node:gpus, got {part:?}"))?;
            let node = node.trim();
            if node.is_empty() {
                return Err(format!("empty node id in {part:?}"));
            }
            let gpu_ids = gpus
                .split(',')
                .map(|g| {
                    g.trim()
                        .parse::<u32>()
                        .map_err(|_| format!("bad gpu index {g:?} for node {node}"))
                })
                .collect::<Result<Vec<u32>, String>>()?;
            if gpu_ids.is_empty() {
                return Err(format!("no gpu indices for node {node}"));
            }
            pins.push(GpuPin { node_id: node.to_string(), gpu_ids });
        }
        if pins.is_empty() {
            return Err("empty pin list".to_string());
        }
        Ok(PinList(pins))
    }
}

impl SubmitArgs {
    pub fn to_spec(&self) -> JobSpec {
        let distributed = if self.distributed {
            DistributedKind::TorchDistributed
        } else if self.mpi {
            DistributedKind::Mpi
        } else {
            DistributedKind::None
        };
        JobSpec {
            owner: self.owner.clone(),
            command: self.command.join(" "),
            gpus: self.gpus,
            pins: self.node_gpu_ids.clone().map(|p| p.0).unwrap_or_default(),
            priority: self.priority,
            distributed,
            interactive: self.interactive,
            cancel_on_detach: self.no_cancel_on_detach.then_some(false),
            mem_mb: self.mem,
        }
    }
}
