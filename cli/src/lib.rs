//! Client library and CLI adapter for the mgpu cluster.

pub mod args;
pub mod client;

/// Process exit codes of the `mgpu` binary.
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const USAGE: i32 = 2;
    pub const NO_SUCH_JOB: i32 = 3;
    pub const UNREACHABLE: i32 = 4;
}
