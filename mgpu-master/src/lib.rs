//! The mgpu master: accepts client requests, tracks the node registry,
//! places jobs onto agents and routes their output back to attached
//! clients.

pub mod agent_api;
pub mod client_api;
pub mod config;
pub mod dispatch;
pub mod job;
pub mod node;
pub mod output;
pub mod scheduler;
pub mod state;
pub mod sweeper;

/// Master-side error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job error: {0}")]
    Job(String),
    #[error("node error: {0}")]
    Node(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] mgpu_proto::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
