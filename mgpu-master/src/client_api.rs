//! The client-facing listener: submit, queue, cancel and attach.
//!
//! Each client connection carries exactly one verb. A submit with
//! `interactive` set keeps its connection open and turns it into the
//! attach stream.

use crate::dispatch;
use crate::state::Ctx;
use mgpu_proto::message::{ErrorCode, JobStatus, Message};
use mgpu_proto::Wire;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

pub async fn run(ctx: Ctx) -> crate::Result<()> {
    let listener = TcpListener::bind(&ctx.cfg.client_listen).await?;
    serve(ctx, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(ctx: Ctx, listener: TcpListener) -> crate::Result<()> {
    info!(addr = ?listener.local_addr(), "client listener up");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(handle_conn(ctx.clone(), stream, peer));
    }
}

async fn handle_conn(ctx: Ctx, stream: TcpStream, peer: SocketAddr) {
    let mut wire = Wire::new(stream);
    let msg = match wire.recv().await {
        Ok(Some(msg)) => msg,
        Ok(None) => return,
        Err(err) => {
            warn!(%peer, %err, "bad client request");
            let _ = wire
                .send(&Message::Error {
                    code: ErrorCode::InvalidSpec,
                    reason: err.to_string(),
                })
                .await;
            return;
        }
    };

    let result = match msg {
        Message::Submit { spec } => handle_submit(&ctx, &mut wire, spec).await,
        Message::Queue => handle_queue(&ctx, &mut wire).await,
        Message::Cancel { job_id } => handle_cancel(&ctx, &mut wire, job_id).await,
        Message::Attach { job_id } => attach_and_pump(&ctx, &mut wire, job_id).await,
        other => {
            wire.send(&Message::Error {
                code: ErrorCode::InvalidSpec,
                reason: format!("unexpected client message: {other:?}"),
            })
            .await
            .map_err(Into::into)
        }
    };
    if let Err(err) = result {
        // Usually the client went away mid-stream; nothing to salvage.
        warn!(%peer, %err, "client connection closed with error");
    }
}

async fn handle_submit(
    ctx: &Ctx,
    wire: &mut Wire<TcpStream>,
    spec: mgpu_proto::message::JobSpec,
) -> crate::Result<()> {
    let interactive = spec.interactive;
    let submitted = {
        let mut st = ctx.state.lock();
        st.submit(spec, ctx.cfg.ring_capacity_bytes)
    };
    match submitted {
        Err((code, reason)) => {
            wire.send(&Message::Error { code, reason }).await?;
            Ok(())
        }
        Ok(job_id) => {
            ctx.wake.notify_one();
            wire.send(&Message::Ack {
                job_id: Some(job_id.clone()),
                prior_status: None,
                pid: None,
            })
            .await?;
            if interactive {
                attach_and_pump(ctx, wire, job_id).await?;
            }
            Ok(())
        }
    }
}

async fn handle_queue(ctx: &Ctx, wire: &mut Wire<TcpStream>) -> crate::Result<()> {
    let (jobs, nodes) = {
        let st = ctx.state.lock();
        st.snapshot()
    };
    wire.send(&Message::Snapshot { jobs, nodes }).await?;
    Ok(())
}

enum CancelDisposition {
    Unknown,
    Done(JobStatus),
    Wait(JobStatus, Vec<(String, String)>),
}

async fn handle_cancel(
    ctx: &Ctx,
    wire: &mut Wire<TcpStream>,
    job_id: String,
) -> crate::Result<()> {
    let grace = Duration::from_secs(ctx.cfg.cancel_grace_secs);
    let disposition = {
        let mut st = ctx.state.lock();
        match st.jobs.get(&job_id).map(|j| j.status) {
            None => CancelDisposition::Unknown,
            Some(JobStatus::Queued) => {
                st.pending.remove(&job_id);
                st.retire(&job_id, JobStatus::Cancelled, -1, None, "cancelled while queued");
                CancelDisposition::Done(JobStatus::Queued)
            }
            Some(prior) if prior.is_terminal() => CancelDisposition::Done(prior),
            Some(JobStatus::Running) => {
                let targets = st.begin_cancel(&job_id, grace);
                CancelDisposition::Wait(JobStatus::Running, targets)
            }
            Some(prior) => CancelDisposition::Wait(prior, vec![]),
        }
    };

    match disposition {
        CancelDisposition::Unknown => {
            wire.send(&Message::Error {
                code: ErrorCode::UnknownJob,
                reason: format!("no such job: {job_id}"),
            })
            .await?;
        }
        CancelDisposition::Done(prior) => {
            ctx.wake.notify_one();
            wire.send(&Message::Ack {
                job_id: Some(job_id),
                prior_status: Some(prior),
                pid: None,
            })
            .await?;
        }
        CancelDisposition::Wait(prior, targets) => {
            for (address, target_job) in targets {
                tokio::spawn(async move {
                    if let Err(err) = dispatch::cancel(&address, &target_job).await {
                        warn!(%address, job_id = target_job, %err, "cancel RPC failed");
                    }
                });
            }
            await_retirement(ctx, &job_id, grace).await;
            ctx.wake.notify_one();
            wire.send(&Message::Ack {
                job_id: Some(job_id),
                prior_status: Some(prior),
                pid: None,
            })
            .await?;
        }
    }
    Ok(())
}

/// Wait for the agents' exit reports, force-retiring after the grace
/// window. The reply to the client is held until the job is truly gone.
async fn await_retirement(ctx: &Ctx, job_id: &str, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let terminal = {
            let st = ctx.state.lock();
            st.jobs.get(job_id).map(|j| j.is_terminal()).unwrap_or(true)
        };
        if terminal {
            return;
        }
        if Instant::now() >= deadline {
            let mut st = ctx.state.lock();
            st.retire(job_id, JobStatus::Cancelled, -1, None, "cancel grace expired");
            return;
        }
    }
}

/// Subscribe to a job's output and copy it to the client until the exit
/// message. Replays ring history first, so attaching to a finished job
/// still yields its tail and exit.
async fn attach_and_pump(
    ctx: &Ctx,
    wire: &mut Wire<TcpStream>,
    job_id: String,
) -> crate::Result<()> {
    let attached = {
        let mut st = ctx.state.lock();
        if !st.jobs.contains_key(&job_id) {
            Err((ErrorCode::UnknownJob, format!("no such job: {job_id}")))
        } else {
            match st.outputs.get_mut(&job_id) {
                Some(output) => Ok(output.attach(&job_id)),
                None => Err((
                    ErrorCode::NotRunningAndNoHistory,
                    format!("job {job_id} has no retained output"),
                )),
            }
        }
    };

    let mut rx = match attached {
        Err((code, reason)) => {
            wire.send(&Message::Error { code, reason }).await?;
            return Ok(());
        }
        Ok(rx) => rx,
    };

    while let Some(msg) = rx.recv().await {
        let is_exit = matches!(msg, Message::Exit { .. });
        wire.send(&msg).await?;
        if is_exit {
            break;
        }
    }
    Ok(())
}
