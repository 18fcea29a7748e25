//! The mgpu node agent: one per compute host. Discovers local GPUs,
//! registers with the master, executes assigned jobs as process groups,
//! streams their output back and kills cleanly on cancel.

pub mod config;
pub mod executor;
pub mod gpu;
pub mod link;
pub mod process;
pub mod server;

use mgpu_proto::message::GpuDesc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Agent-side error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("master link: {0}")]
    Link(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] mgpu_proto::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shared agent context.
pub struct Agent {
    pub cfg: config::AgentConfig,
    /// GPU inventory discovered at startup.
    pub gpus: Vec<GpuDesc>,
    /// Live jobs, exclusively owned by this agent.
    pub table: Mutex<HashMap<String, process::ProcessRecord>>,
}

pub type Ctx = Arc<Agent>;

impl Agent {
    pub fn new(cfg: config::AgentConfig, gpus: Vec<GpuDesc>) -> Ctx {
        Arc::new(Self { cfg, gpus, table: Mutex::new(HashMap::new()) })
    }

    /// Local GPU indices not held by any live job.
    pub fn free_gpus(&self) -> Vec<u32> {
        let table = self.table.lock();
        let held: std::collections::HashSet<u32> =
            table.values().flat_map(|r| r.gpu_ids.iter().copied()).collect();
        self.gpus.iter().map(|g| g.index).filter(|i| !held.contains(i)).collect()
    }

    /// Job ids with a live process group.
    pub fn running_jobs(&self) -> Vec<String> {
        self.table.lock().keys().cloned().collect()
    }
}
