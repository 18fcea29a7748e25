//! Per-job output history and fan-out to attached clients.
//!
//! Each running job keeps a bounded ring of its most recent output so a
//! late attach can replay history, plus the set of attached client
//! channels. A client whose channel fills up is dropped rather than
//! allowed to slow the job.

use bytes::Bytes;
use mgpu_proto::message::{Message, StreamKind};
use tokio::sync::mpsc;

/// Depth of each attached client's chunk channel.
pub const ATTACH_CHANNEL_DEPTH: usize = 1024;

/// Adjacent same-stream ring entries are merged up to this size so the
/// ring entry count stays bounded even under byte-at-a-time writers.
const COALESCE_LIMIT: usize = 16 * 1024;

pub struct JobOutput {
    capacity_bytes: usize,
    ring: std::collections::VecDeque<(StreamKind, Vec<u8>)>,
    ring_bytes: usize,
    attached: Vec<mpsc::Sender<Message>>,
    /// Set once the job reported (or was forced to) its exit.
    finished: Option<Message>,
    /// True once any client has ever attached; drives cancel-on-detach.
    ever_attached: bool,
}

impl JobOutput {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            ring: std::collections::VecDeque::new(),
            ring_bytes: 0,
            attached: vec![],
            finished: None,
            ever_attached: false,
        }
    }

    /// Append a chunk to the ring and fan it out to attached clients.
    pub fn append(&mut self, job_id: &str, stream: StreamKind, data: Bytes) {
        if data.is_empty() || self.finished.is_some() {
            return;
        }

        match self.ring.back_mut() {
            Some((last_stream, buf))
                if *last_stream == stream && buf.len() + data.len() <= COALESCE_LIMIT =>
            {
                buf.extend_from_slice(&data);
            }
            _ => self.ring.push_back((stream, data.to_vec())),
        }
        self.ring_bytes += data.len();
        while self.ring_bytes > self.capacity_bytes {
            match self.ring.pop_front() {
                Some((_, dropped)) => self.ring_bytes -= dropped.len(),
                None => break,
            }
        }

        let msg = Message::Out { job_id: job_id.to_string(), stream, data: data.to_vec() };
        self.fan_out(msg);
    }

    /// Record the terminal message, deliver it, and detach everyone.
    pub fn finish(&mut self, exit: Message) {
        if self.finished.is_some() {
            return;
        }
        self.fan_out(exit.clone());
        self.finished = Some(exit);
        self.attached.clear();
    }

    /// Attach a new client: replay the ring, then live chunks, then the
    /// exit message. For an already-finished job the receiver drains the
    /// history and closes.
    pub fn attach(&mut self, job_id: &str) -> mpsc::Receiver<Message> {
        // The replay must never hit backpressure, so size the channel to it.
        let depth = ATTACH_CHANNEL_DEPTH.max(self.ring.len() + 2);
        let (tx, rx) = mpsc::channel(depth);
        for (stream, data) in &self.ring {
            let _ = tx.try_send(Message::Out {
                job_id: job_id.to_string(),
                stream: *stream,
                data: data.clone(),
            });
        }
        match &self.finished {
            Some(exit) => {
                let _ = tx.try_send(exit.clone());
            }
            None => {
                self.ever_attached = true;
                self.attached.push(tx);
            }
        }
        rx
    }

    /// Drop channels whose client went away; true while anyone remains.
    pub fn prune_detached(&mut self) -> bool {
        self.attached.retain(|tx| !tx.is_closed());
        !self.attached.is_empty()
    }

    pub fn ever_attached(&self) -> bool {
        self.ever_attached
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    fn fan_out(&mut self, msg: Message) {
        // A full channel means a client that cannot keep up; drop it.
        self.attached.retain(|tx| tx.try_send(msg.clone()).is_ok());
    }
}
