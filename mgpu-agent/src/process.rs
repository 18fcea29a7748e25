//! Process-group supervision: the live-job table and cancel escalation.
//!
//! Cancellation is forceful: SIGTERM to the whole group, a grace
//! window, SIGKILL to the group, then a process-table sweep that reaps
//! any stray descendant. An orphaned descendant is a correctness bug,
//! not a cosmetic one.

use crate::Ctx;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// One live job on this host.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub job_id: String,
    /// Process-group id; the child is its own group leader.
    pub pgid: i32,
    pub gpu_ids: Vec<u32>,
    pub started_at: Instant,
}

/// True while any process of the group exists.
pub fn group_alive(pgid: i32) -> bool {
    killpg(Pid::from_raw(pgid), None).is_ok()
}

/// Two-stage shutdown of a process group, then the stray sweep.
pub async fn terminate_group(pgid: i32, grace: Duration) {
    let pg = Pid::from_raw(pgid);
    if killpg(pg, Signal::SIGTERM).is_err() {
        // Group already gone; still sweep for reparented strays.
        sweep_strays(pgid);
        return;
    }
    info!(pgid, "sent SIGTERM to process group");

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if !group_alive(pgid) {
            break;
        }
    }
    if group_alive(pgid) {
        warn!(pgid, "grace expired, sending SIGKILL");
        let _ = killpg(pg, Signal::SIGKILL);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let reaped = sweep_strays(pgid);
    if reaped > 0 {
        warn!(pgid, reaped, "killed stray descendants");
    }
}

/// Kill every process that still belongs to the job: same session as
/// the group leader, or transitively parented under it (covers
/// descendants that changed their own group).
pub fn sweep_strays(pgid: i32) -> usize {
    use sysinfo::{ProcessesToUpdate, System};

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let procs = sys.processes();

    // Seed from the session: jobs run setsid, so every descendant that
    // has not re-led its own session matches. Dead pids are never
    // force-added, which keeps a reused pid out of the kill set.
    let root = sysinfo::Pid::from_u32(pgid as u32);
    let mut targets: HashSet<sysinfo::Pid> = procs
        .iter()
        .filter(|(_, p)| p.session_id() == Some(root))
        .map(|(pid, _)| *pid)
        .collect();

    loop {
        let before = targets.len();
        for (pid, p) in procs {
            if let Some(parent) = p.parent() {
                if targets.contains(&parent) {
                    targets.insert(*pid);
                }
            }
        }
        if targets.len() == before {
            break;
        }
    }

    let mut killed = 0;
    for pid in targets {
        if let Some(p) = procs.get(&pid) {
            if p.kill() {
                killed += 1;
            }
        }
    }
    killed
}

/// Cancel a job by id. Returns false when this agent has no record of
/// it (already exited), which keeps cancel idempotent.
pub async fn cancel(ctx: &Ctx, job_id: &str) -> bool {
    let pgid = { ctx.table.lock().get(job_id).map(|r| r.pgid) };
    match pgid {
        None => false,
        Some(pgid) => {
            info!(job_id, pgid, "cancelling job");
            terminate_group(pgid, Duration::from_secs(ctx.cfg.kill_grace_secs)).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt as _;

    #[tokio::test]
    async fn terminate_kills_the_whole_group() {
        // Two backgrounded sleepers plus the shell, one process group.
        let mut child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 300 & sleep 300 & wait")
            .process_group(0)
            .spawn()
            .expect("spawn test shell");
        let pgid = child.id() as i32;
        assert!(group_alive(pgid));

        terminate_group(pgid, Duration::from_millis(500)).await;
        let _ = child.wait();

        assert!(!group_alive(pgid), "no process may survive with the job's pgid");
    }

    #[tokio::test]
    async fn terminate_of_a_dead_group_is_idempotent() {
        let mut child = std::process::Command::new("/bin/true")
            .process_group(0)
            .spawn()
            .expect("spawn");
        let pgid = child.id() as i32;
        let _ = child.wait();

        terminate_group(pgid, Duration::from_millis(100)).await;
        terminate_group(pgid, Duration::from_millis(100)).await;
        assert!(!group_alive(pgid));
    }
}
