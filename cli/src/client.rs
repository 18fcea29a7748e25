//! One-shot RPCs against the master and the attach stream pump.

use crate::args::TimeoutArgs;
use mgpu_proto::message::{
    ErrorCode, JobSpec, JobStatus, JobView, Message, NodeView, StreamKind,
};
use mgpu_proto::Wire;
use std::time::Duration;
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    #[error("no such job: {0}")]
    NoSuchJob(String),
    #[error("request rejected ({code:?}): {reason}")]
    Rejected { code: ErrorCode, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Unreachable(_) => crate::exit_codes::UNREACHABLE,
            ClientError::NoSuchJob(_) => crate::exit_codes::NO_SUCH_JOB,
            ClientError::Rejected { .. } => crate::exit_codes::USAGE,
            ClientError::Protocol(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// The four optional client timeouts; `None` is unbounded, which is the
/// default throughout — long training jobs must never be aborted by a
/// client-side default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub session: Option<Duration>,
    pub connection: Option<Duration>,
    pub per_read: Option<Duration>,
    pub max_consecutive_timeouts: Option<u32>,
}

impl From<TimeoutArgs> for Timeouts {
    fn from(args: TimeoutArgs) -> Self {
        Self {
            session: args.session_timeout.map(Duration::from_secs),
            connection: args.connection_timeout.map(Duration::from_secs),
            per_read: args.max_wait_time.map(Duration::from_secs),
            max_consecutive_timeouts: args.max_consecutive_timeouts,
        }
    }
}

pub struct Client {
    addr: String,
    pub timeouts: Timeouts,
}

impl Client {
    pub fn new(host: &str, port: u16, timeouts: Timeouts) -> Self {
        Self { addr: format!("{host}:{port}"), timeouts }
    }

    async fn connect(&self) -> Result<Wire<TcpStream>> {
        let dial = TcpStream::connect(&self.addr);
        let stream = match self.timeouts.connection {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| ClientError::Unreachable(format!("{}: connect timed out", self.addr)))?,
            None => dial.await,
        }
        .map_err(|e| ClientError::Unreachable(format!("{}: {e}", self.addr)))?;
        Ok(Wire::new(stream))
    }

    async fn rpc(&self, msg: &Message) -> Result<Message> {
        let mut wire = self.connect().await?;
        wire.send(msg).await.map_err(net_err)?;
        wire.recv()
            .await
            .map_err(net_err)?
            .ok_or_else(|| ClientError::Protocol("connection closed without a reply".into()))
    }

    /// Submit a job. For interactive submissions the returned connection
    /// has become the output stream.
    pub async fn submit(&self, spec: JobSpec) -> Result<(String, Option<Wire<TcpStream>>)> {
        let interactive = spec.interactive;
        let mut wire = self.connect().await?;
        wire.send(&Message::Submit { spec }).await.map_err(net_err)?;
        match wire.recv().await.map_err(net_err)? {
            Some(Message::Ack { job_id: Some(job_id), .. }) => {
                Ok((job_id, interactive.then_some(wire)))
            }
            Some(Message::Error { code, reason }) => Err(error_reply(code, reason)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn queue(&self) -> Result<(Vec<JobView>, Vec<NodeView>)> {
        match self.rpc(&Message::Queue).await? {
            Message::Snapshot { jobs, nodes } => Ok((jobs, nodes)),
            Message::Error { code, reason } => Err(error_reply(code, reason)),
            other => Err(unexpected(Some(other))),
        }
    }

    /// Cancel a job; resolves once the master has retired it. Returns
    /// the status the job had when the cancel arrived.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus> {
        match self.rpc(&Message::Cancel { job_id: job_id.to_string() }).await? {
            Message::Ack { prior_status: Some(prior), .. } => Ok(prior),
            Message::Ack { .. } => Ok(JobStatus::Queued),
            Message::Error { code, reason } => Err(error_reply(code, reason)),
            other => Err(unexpected(Some(other))),
        }
    }

    /// Open an attach stream for an existing job. Errors surface as
    /// `error` messages inside the stream and are handled by the pump.
    pub async fn attach(&self, job_id: &str) -> Result<Wire<TcpStream>> {
        let mut wire = self.connect().await?;
        wire.send(&Message::Attach { job_id: job_id.to_string() })
            .await
            .map_err(net_err)?;
        Ok(wire)
    }
}

fn net_err(err: mgpu_proto::Error) -> ClientError {
    ClientError::Protocol(err.to_string())
}

fn error_reply(code: ErrorCode, reason: String) -> ClientError {
    match code {
        ErrorCode::UnknownJob | ErrorCode::NotRunningAndNoHistory => {
            ClientError::NoSuchJob(reason)
        }
        _ => ClientError::Rejected { code, reason },
    }
}

fn unexpected(msg: Option<Message>) -> ClientError {
    ClientError::Protocol(format!("unexpected reply: {msg:?}"))
}

/// Map a job's exit report onto this process's exit code.
pub fn exit_code_for(code: i32, signal: Option<i32>) -> i32 {
    match signal {
        Some(sig) => 128 + sig,
        None if code >= 0 => code,
        None => 1,
    }
}

enum ReadOutcome {
    Message(Message),
    TimedOut,
    Closed,
    Failed(String),
}

async fn read_with_timeout(
    wire: &mut Wire<TcpStream>,
    limit: Option<Duration>,
) -> ReadOutcome {
    let res = match limit {
        Some(limit) => match tokio::time::timeout(limit, wire.recv()).await {
            Err(_) => return ReadOutcome::TimedOut,
            Ok(res) => res,
        },
        None => wire.recv().await,
    };
    match res {
        Ok(Some(msg)) => ReadOutcome::Message(msg),
        Ok(None) => ReadOutcome::Closed,
        Err(err) => ReadOutcome::Failed(err.to_string()),
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Copy an attach stream to stdout/stderr until the exit message.
/// SIGINT sends a cancel on a fresh connection and keeps draining:
/// output may legitimately arrive after the cancel, and only the exit
/// message ends the stream.
pub async fn pump_stream(
    mut wire: Wire<TcpStream>,
    job_id: &str,
    client: &Client,
) -> Result<i32> {
    let t = client.timeouts;
    let session_deadline = t.session.map(|d| tokio::time::Instant::now() + d);
    let mut consecutive_timeouts = 0u32;
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    loop {
        let msg = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("mgpu: cancelling {job_id}");
                if let Err(err) = client.cancel(job_id).await {
                    eprintln!("mgpu: cancel failed: {err}");
                }
                continue;
            }
            _ = sleep_until_opt(session_deadline) => {
                return Err(ClientError::Protocol("session timeout exceeded".into()));
            }
            outcome = read_with_timeout(&mut wire, t.per_read) => match outcome {
                ReadOutcome::TimedOut => {
                    consecutive_timeouts += 1;
                    if let Some(max) = t.max_consecutive_timeouts {
                        if consecutive_timeouts >= max {
                            return Err(ClientError::Protocol(
                                "too many consecutive read timeouts".into(),
                            ));
                        }
                    }
                    continue;
                }
                ReadOutcome::Message(msg) => {
                    consecutive_timeouts = 0;
                    msg
                }
                ReadOutcome::Closed => {
                    return Err(ClientError::Protocol(
                        "stream closed before the exit message".into(),
                    ));
                }
                ReadOutcome::Failed(err) => return Err(ClientError::Protocol(err)),
            }
        };

        match msg {
            Message::Out { stream: StreamKind::Stdout, data, .. } => {
                stdout
                    .write_all(&data)
                    .await
                    .map_err(|e| ClientError::Protocol(e.to_string()))?;
                let _ = stdout.flush().await;
            }
            Message::Out { stream: StreamKind::Stderr, data, .. } => {
                stderr
                    .write_all(&data)
                    .await
                    .map_err(|e| ClientError::Protocol(e.to_string()))?;
                let _ = stderr.flush().await;
            }
            Message::Exit { code, signal, .. } => return Ok(exit_code_for(code, signal)),
            Message::Error { code, reason } => return Err(error_reply(code, reason)),
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected stream message: {other:?}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mapping() {
        assert_eq!(exit_code_for(0, None), 0);
        assert_eq!(exit_code_for(3, None), 3);
        assert_eq!(exit_code_for(-1, Some(15)), 128 + 15);
        assert_eq!(exit_code_for(-1, None), 1);
    }

    #[test]
    fn error_codes_map_to_exit_codes() {
        let err = error_reply(ErrorCode::UnknownJob, "gone".into());
        assert_eq!(err.exit_code(), crate::exit_codes::NO_SUCH_JOB);

        let err = error_reply(ErrorCode::InvalidSpec, "bad".into());
        assert_eq!(err.exit_code(), crate::exit_codes::USAGE);

        let err = ClientError::Unreachable("nope".into());
        assert_eq!(err.exit_code(), crate::exit_codes::UNREACHABLE);
    }

    #[tokio::test]
    async fn rpc_round_trip_against_a_fake_master() {
        use mgpu_proto::message::Message;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut wire = Wire::new(stream);
            match wire.recv().await.unwrap() {
                Some(Message::Queue) => {
                    wire.send(&Message::Snapshot { jobs: vec![], nodes: vec![] })
                        .await
                        .unwrap();
                }
                other => panic!("unexpected: {other:?}"),
            }
        });

        let client = Client::new(&addr.ip().to_string(), addr.port(), Timeouts::default());
        let (jobs, nodes) = client.queue().await.unwrap();
        assert!(jobs.is_empty());
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn unreachable_master_is_exit_code_four() {
        // a port that nothing listens on
        let client = Client::new(
            "127.0.0.1",
            1,
            Timeouts { connection: Some(Duration::from_millis(500)), ..Default::default() },
        );
        let err = client.queue().await.unwrap_err();
        assert_eq!(err.exit_code(), crate::exit_codes::UNREACHABLE);
    }
}
