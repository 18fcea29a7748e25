//! Job records and lifecycle transitions.

use chrono::{DateTime, Utc};
use mgpu_proto::message::{
    AssignmentView, DistributedKind, GpuPin, JobSpec, JobStatus, JobView,
};
use std::time::Instant;
use uuid::Uuid;

/// One node's share of a running job.
#[derive(Debug, Clone)]
pub struct NodeShare {
    pub node_id: String,
    pub gpu_ids: Vec<u32>,
    pub pid: Option<u32>,
    /// `(code, signal)` once this node reported the child gone.
    pub exited: Option<(i32, Option<i32>)>,
}

/// A job owned by the master.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub owner: String,
    pub command: String,
    pub requested_gpus: u32,
    /// When non-empty, placement is forced and `requested_gpus` is ignored.
    pub pins: Vec<GpuPin>,
    pub priority: i64,
    pub distributed: DistributedKind,
    pub interactive: bool,
    pub cancel_on_detach: bool,
    pub mem_mb: Option<u64>,
    /// Monotonic submission instant, used for FIFO tie-breaks and grace
    /// deadlines.
    pub submitted_at: Instant,
    pub submitted_wall: DateTime<Utc>,
    /// Process-wide submission sequence number.
    pub seq: u64,
    pub status: JobStatus,
    /// Non-empty exactly while the job is running or cancelling.
    pub assignment: Vec<NodeShare>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Deadline by which a cancelling job must report its exit.
    pub cancel_deadline: Option<Instant>,
    /// Last state-change message; surfaced as the failure reason.
    pub message: String,
}

impl Job {
    pub fn new(id: String, seq: u64, spec: JobSpec) -> Self {
        let cancel_on_detach = spec.cancel_on_detach.unwrap_or(spec.interactive);
        Self {
            id,
            owner: spec.owner,
            command: spec.command,
            requested_gpus: spec.gpus,
            pins: spec.pins,
            priority: spec.priority,
            distributed: spec.distributed,
            interactive: spec.interactive,
            cancel_on_detach,
            mem_mb: spec.mem_mb,
            submitted_at: Instant::now(),
            submitted_wall: Utc::now(),
            seq,
            status: JobStatus::Queued,
            assignment: vec![],
            exit_code: None,
            exit_signal: None,
            retry_count: 0,
            started_at: None,
            ended_at: None,
            cancel_deadline: None,
            message: String::new(),
        }
    }

    /// Move to a new state, stamping the lifecycle timestamps.
    pub fn transition(&mut self, status: JobStatus, message: &str) {
        self.status = status;
        self.message = message.to_string();
        match status {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.ended_at = Some(Utc::now());
            }
            _ => {}
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// GPUs this job occupies when placed.
    pub fn gpu_count(&self) -> u32 {
        if self.pins.is_empty() {
            self.requested_gpus
        } else {
            self.pins.iter().map(|p| p.gpu_ids.len() as u32).sum()
        }
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            owner: self.owner.clone(),
            command: self.command.clone(),
            status: self.status,
            priority: self.priority,
            gpus: self.gpu_count(),
            assignment: self
                .assignment
                .iter()
                .map(|s| AssignmentView {
                    node_id: s.node_id.clone(),
                    gpu_ids: s.gpu_ids.clone(),
                    pid: s.pid,
                })
                .collect(),
            exit_code: self.exit_code,
            failure_reason: (self.status == JobStatus::Failed && !self.message.is_empty())
                .then(|| self.message.clone()),
        }
    }
}

/// Draw a fresh 8-hex job id that `taken` does not already know.
pub fn gen_job_id(mut taken: impl FnMut(&str) -> bool) -> String {
    loop {
        let full = Uuid::new_v4().simple().to_string();
        let id = full[..8].to_string();
        if !taken(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> JobSpec {
        JobSpec {
            owner: "alice".into(),
            command: command.into(),
            gpus: 1,
            pins: vec![],
            priority: 0,
            distributed: DistributedKind::None,
            interactive: false,
            cancel_on_detach: None,
            mem_mb: None,
        }
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut job = Job::new("ab12cd34".into(), 1, spec("echo hi"));
        assert!(job.started_at.is_none());

        job.transition(JobStatus::Running, "placed");
        assert!(job.started_at.is_some());
        assert!(job.ended_at.is_none());

        job.transition(JobStatus::Completed, "exit 0");
        assert!(job.ended_at.is_some());
        assert!(job.is_terminal());
    }

    #[test]
    fn pins_override_requested_gpus() {
        let mut s = spec("true");
        s.gpus = 8;
        s.pins = vec![
            GpuPin { node_id: "n1".into(), gpu_ids: vec![0, 1] },
            GpuPin { node_id: "n2".into(), gpu_ids: vec![2] },
        ];
        let job = Job::new("ab12cd34".into(), 1, s);
        assert_eq!(job.gpu_count(), 3);
    }

    #[test]
    fn interactive_defaults_to_cancel_on_detach() {
        let mut s = spec("sleep 5");
        s.interactive = true;
        let job = Job::new("ab12cd34".into(), 1, s);
        assert!(job.cancel_on_detach);

        let mut s = spec("sleep 5");
        s.interactive = true;
        s.cancel_on_detach = Some(false);
        let job = Job::new("ab12cd35".into(), 2, s);
        assert!(!job.cancel_on_detach);
    }

    #[test]
    fn job_ids_are_eight_hex_chars() {
        let id = gen_job_id(|_| false);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
