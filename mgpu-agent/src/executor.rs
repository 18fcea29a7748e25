//! Job execution: spawn in a fresh session, stream output, report exit.

use crate::process::ProcessRecord;
use crate::{Ctx, Error, Result};
use mgpu_proto::message::{DistributedEnv, Message, StreamKind, MAX_CHUNK_BYTES};
use mgpu_proto::Wire;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt as _;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Flush window for straggler pipe holders after the child itself exits.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);
/// The exit report is retried this many times, one second apart.
const EXIT_REPORT_ATTEMPTS: u32 = 30;

/// The `start` contract as received from the master.
pub struct StartParams {
    pub job_id: String,
    /// Node the master believes it is talking to; printed in the banner
    /// so routing mistakes are visible in the job output itself.
    pub target_node: String,
    pub command: String,
    pub assigned_gpus: Vec<u32>,
    pub env_extras: BTreeMap<String, String>,
    pub distributed: Option<DistributedEnv>,
}

/// Spawn the job and its supervisor task. Returns the process-group id.
pub fn start(ctx: &Ctx, params: StartParams) -> Result<u32> {
    if ctx.table.lock().contains_key(&params.job_id) {
        return Err(Error::Spawn(format!("job {} is already running here", params.job_id)));
    }

    let command = banner_wrapped(&params, &ctx.cfg.node_id);
    let mut cmd = tokio::process::Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("CUDA_VISIBLE_DEVICES", join_gpus(&params.assigned_gpus))
        .envs(&params.env_extras);
    if let Some(env) = &params.distributed {
        apply_distributed_env(&mut cmd, env);
    }
    // New session: the child leads its own process group, so one killpg
    // reaches it and every descendant.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| Error::Spawn(e.to_string()))?;
    let pid = child.id().ok_or_else(|| Error::Spawn("child has no pid".into()))?;

    ctx.table.lock().insert(
        params.job_id.clone(),
        ProcessRecord {
            job_id: params.job_id.clone(),
            pgid: pid as i32,
            gpu_ids: params.assigned_gpus.clone(),
            started_at: Instant::now(),
        },
    );
    info!(job_id = %params.job_id, pid, gpus = ?params.assigned_gpus, "job started");

    tokio::spawn(supervise(ctx.clone(), params.job_id, child));
    Ok(pid)
}

/// Contractual prologue: job id, target node, actual hostname, resolved
/// IP. Clients and logs rely on it.
fn banner_wrapped(params: &StartParams, node_id: &str) -> String {
    let target =
        if params.target_node.is_empty() { node_id } else { &params.target_node };
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let ip = crate::config::local_ip();
    format!(
        "echo \"[mgpu {}] node={} host={} ip={}\"; {}",
        params.job_id, target, host, ip, params.command
    )
}

fn join_gpus(gpus: &[u32]) -> String {
    gpus.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

fn apply_distributed_env(cmd: &mut tokio::process::Command, env: &DistributedEnv) {
    cmd.env("MASTER_ADDR", &env.master_host)
        .env("MASTER_PORT", env.master_port.to_string())
        .env("WORLD_SIZE", env.world_size.to_string())
        .env("RANK", env.rank.to_string())
        // one rank per node: the job always sees local rank zero
        .env("LOCAL_RANK", "0");
}

/// Wait on the child, forwarding its output as it arrives, then deliver
/// the exit report and drop the process record.
async fn supervise(ctx: Ctx, job_id: String, mut child: tokio::process::Child) {
    let (tx, mut rx) = mpsc::channel::<(StreamKind, Vec<u8>)>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, StreamKind::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, StreamKind::Stderr, tx.clone()));
    }
    drop(tx);

    let mut link = StreamLink::new(ctx.cfg.master_addr.clone());
    let mut pipes_open = true;
    let status = loop {
        tokio::select! {
            chunk = rx.recv(), if pipes_open => match chunk {
                Some((stream, data)) => {
                    link.send_chunk(&Message::Out { job_id: job_id.clone(), stream, data })
                        .await;
                }
                None => pipes_open = false,
            },
            status = child.wait() => break status,
        }
    };

    if pipes_open {
        // Backgrounded grandchildren may still hold the pipes; they get
        // a bounded flush window, not a veto over the exit report.
        let _ = tokio::time::timeout(DRAIN_WINDOW, async {
            while let Some((stream, data)) = rx.recv().await {
                link.send_chunk(&Message::Out { job_id: job_id.clone(), stream, data })
                    .await;
            }
        })
        .await;
    }

    let (code, signal) = match status {
        Ok(st) => exit_parts(st),
        Err(err) => {
            warn!(job_id, %err, "wait on child failed");
            (-1, None)
        }
    };
    info!(job_id, code, ?signal, "job exited");

    let exit = Message::Exit {
        job_id: job_id.clone(),
        node_id: ctx.cfg.node_id.clone(),
        code,
        signal,
    };
    if !link.send_reliable(&exit).await {
        warn!(job_id, "exit report could not be delivered");
    }
    ctx.table.lock().remove(&job_id);
}

fn exit_parts(status: std::process::ExitStatus) -> (i32, Option<i32>) {
    use std::os::unix::process::ExitStatusExt as _;
    match status.code() {
        Some(code) => (code, None),
        None => (-1, status.signal()),
    }
}

async fn pump<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    stream: StreamKind,
    tx: mpsc::Sender<(StreamKind, Vec<u8>)>,
) {
    let mut buf = vec![0u8; MAX_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// The per-job upload connection to the master. Chunks are best-effort
/// across redials (output produced while disconnected is lost); the
/// exit report is retried until delivered.
struct StreamLink {
    master_addr: String,
    wire: Option<Wire<TcpStream>>,
    last_attempt: Option<Instant>,
}

impl StreamLink {
    fn new(master_addr: String) -> Self {
        Self { master_addr, wire: None, last_attempt: None }
    }

    async fn ensure(&mut self) -> bool {
        if self.wire.is_some() {
            return true;
        }
        if let Some(t) = self.last_attempt {
            if t.elapsed() < Duration::from_secs(1) {
                return false;
            }
        }
        self.last_attempt = Some(Instant::now());
        match TcpStream::connect(&self.master_addr).await {
            Ok(stream) => {
                self.wire = Some(Wire::new(stream));
                true
            }
            Err(err) => {
                debug!(addr = %self.master_addr, %err, "stream connect failed");
                false
            }
        }
    }

    async fn send_chunk(&mut self, msg: &Message) {
        if !self.ensure().await {
            return;
        }
        if let Some(wire) = &mut self.wire {
            if let Err(err) = wire.send(msg).await {
                warn!(%err, "stream send failed, will redial");
                self.wire = None;
            }
        }
    }

    async fn send_reliable(&mut self, msg: &Message) -> bool {
        for _ in 0..EXIT_REPORT_ATTEMPTS {
            if self.ensure().await {
                if let Some(wire) = &mut self.wire {
                    match wire.send(msg).await {
                        Ok(()) => return true,
                        Err(err) => {
                            warn!(%err, "exit report send failed, retrying");
                            self.wire = None;
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }
}
