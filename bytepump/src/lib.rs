//! bytepump: a guard-railed synthetic file pumper.
//!
//! One invocation is one job: a token source, a writer backend and a set of
//! safety controls. The token sources live in `bytepump-payload`, the rate
//! bucket in `bytepump-throttle`; this crate owns the write side — backends,
//! durability, integrity, guards and the job controller.

pub mod config;
pub mod controller;
pub mod guard;
pub mod integrity;
pub mod monitor;
pub mod progress;
pub mod signals;
pub mod target;
pub mod writer;

mod common;

/// Process exit codes.
pub mod exit {
    /// Clean completion.
    pub const SUCCESS: i32 = 0;
    /// Argument, configuration or unexpected failure, and interruption.
    pub const FAILURE: i32 = 1;
    /// No resolvable targets.
    pub const NO_TARGETS: i32 = 2;
    /// Disk guard or pre-check abort.
    pub const PRECHECK: i32 = 3;
    /// RAM limit exceeded.
    pub const RAM_LIMIT: i32 = 4;
    /// Hash verification mismatch.
    pub const VERIFY: i32 = 5;
}

/// Errors produced by a bytepump job.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid configuration; surfaced before any side effect.
    #[error("configuration error: {0}")]
    Config(#[from] config::Error),
    /// The target set resolved to nothing.
    #[error("no resolvable targets")]
    NoTargets,
    /// Target enumeration failed.
    #[error("target error: {0}")]
    Target(#[from] target::Error),
    /// A pre-write guard refused the job.
    #[error(transparent)]
    Guard(#[from] guard::Error),
    /// Resident set size grew past the configured limit.
    #[error("RSS {observed} bytes exceeds the configured limit of {limit} bytes")]
    RamLimit {
        /// Bytes observed.
        observed: u64,
        /// Configured ceiling.
        limit: u64,
    },
    /// The re-read digest does not match what was written.
    #[error("hash verification failed: wrote {written}, file re-reads as {reread}")]
    Verify {
        /// Digest accumulated while writing.
        written: String,
        /// Digest of the file as re-read.
        reread: String,
    },
    /// Write-side failure.
    #[error(transparent)]
    Write(#[from] writer::Error),
    /// Token source failure.
    #[error("payload error: {0}")]
    Payload(#[from] bytepump_payload::Error),
    /// A worker task panicked or was aborted.
    #[error("worker join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// External cancellation; partial output is retained.
    #[error("interrupted")]
    Interrupted,
}

impl Error {
    /// The process exit code this error maps to.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoTargets => exit::NO_TARGETS,
            Self::Guard(_) => exit::PRECHECK,
            Self::RamLimit { .. } => exit::RAM_LIMIT,
            Self::Verify { .. } => exit::VERIFY,
            _ => exit::FAILURE,
        }
    }
}
