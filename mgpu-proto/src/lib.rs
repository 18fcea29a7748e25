//! Wire protocol shared by the master, the node agents and the clients.
//!
//! Every exchange in the cluster is newline-delimited JSON over TCP: one
//! UTF-8 object per line, tagged by a `type` field. [`message::Message`]
//! is the full set of message types; [`wire::Wire`] frames them over any
//! async byte stream.

pub mod message;
pub mod wire;

pub use message::Message;
pub use wire::Wire;

/// Protocol-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
