//! Master→agent command RPCs.
//!
//! Every logical exchange is its own TCP session: dial, send one
//! request, read one reply, hang up. Reusing a single control socket
//! for request/response traffic is exactly the failure mode this
//! replaces.

use crate::{Error, Result};
use mgpu_proto::{Message, Wire};
use std::time::Duration;
use tokio::net::TcpStream;

pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// One request/response round trip against an agent.
pub async fn call(address: &str, msg: &Message) -> Result<Message> {
    let exchange = async {
        let stream = TcpStream::connect(address).await?;
        let mut wire = Wire::new(stream);
        wire.send(msg).await?;
        wire.recv()
            .await?
            .ok_or_else(|| Error::Node(format!("{address} closed without a reply")))
    };
    tokio::time::timeout(RPC_TIMEOUT, exchange)
        .await
        .map_err(|_| Error::Node(format!("{address} did not reply within {RPC_TIMEOUT:?}")))?
}

/// Issue a `start`; returns the spawned process-group pid when the
/// agent reports one.
pub async fn start(address: &str, msg: &Message) -> Result<Option<u32>> {
    match call(address, msg).await? {
        Message::Ack { pid, .. } => Ok(pid),
        Message::Error { code, reason } => {
            Err(Error::Node(format!("{address} rejected start ({code:?}): {reason}")))
        }
        other => Err(Error::Node(format!("{address} sent unexpected reply: {other:?}"))),
    }
}

/// Issue a `cancel`. The exit still arrives on the job's stream
/// connection; this only requests it.
pub async fn cancel(address: &str, job_id: &str) -> Result<()> {
    match call(address, &Message::Cancel { job_id: job_id.to_string() }).await? {
        Message::Ack { .. } => Ok(()),
        Message::Error { code, reason } => {
            Err(Error::Node(format!("{address} rejected cancel ({code:?}): {reason}")))
        }
        other => Err(Error::Node(format!("{address} sent unexpected reply: {other:?}"))),
    }
}

/// Ask an agent for its current GPU inventory.
pub async fn query_resources(address: &str) -> Result<Message> {
    match call(address, &Message::QueryResources).await? {
        msg @ Message::Resources { .. } => Ok(msg),
        other => Err(Error::Node(format!("{address} sent unexpected reply: {other:?}"))),
    }
}
