//! Local GPU discovery via the NVIDIA management tool.

use mgpu_proto::message::GpuDesc;
use tracing::{debug, info};

/// Query nvidia-smi for the host's GPUs. A missing tool yields an empty
/// list; the agent stays usable for CPU-only testing.
pub fn discover() -> Vec<GpuDesc> {
    match std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=index,name,memory.total", "--format=csv,noheader,nounits"])
        .output()
    {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let gpus: Vec<GpuDesc> = stdout.lines().filter_map(parse_line).collect();
            info!(count = gpus.len(), "discovered GPUs");
            gpus
        }
        _ => {
            debug!("nvidia-smi not available, reporting zero GPUs");
            vec![]
        }
    }
}

fn parse_line(line: &str) -> Option<GpuDesc> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }
    Some(GpuDesc {
        index: parts[0].parse().ok()?,
        model: parts[1].to_string(),
        total_memory_mb: parts[2].parse().ok()?,
    })
}
