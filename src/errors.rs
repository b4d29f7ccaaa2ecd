//! Per-file failure taxonomy.
//!
//! Everything that can go wrong between "candidate listed" and "outcome
//! recorded" is a `TransferError`. The orchestrator converts any of these into
//! a `failed` entry for the file being processed; state-store and lock
//! failures live beside their own services because they end the run instead.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Credential, handshake or host-key rejection.
    #[error("authentication with `{host}` failed: {reason}")]
    Auth { host: String, reason: String },

    /// Network-level failure before a session existed.
    #[error("could not connect to `{host}`: {reason}")]
    Connect { host: String, reason: String },

    /// A required remote directory is absent. Never created implicitly.
    #[error("remote directory `{missing}` not found")]
    Layout { missing: String },

    /// I/O failure on an established session.
    #[error("transport failure during {operation} on `{path}`: {reason}")]
    Transport {
        operation: &'static str,
        path: String,
        reason: String,
    },

    /// The upload completed but the remote copy does not match.
    #[error("verification of `{path}` failed: expected {expected} bytes, found {actual:?}")]
    VerifyFailed {
        path: String,
        expected: u64,
        actual: Option<u64>,
    },

    /// Delivery was told to stop before starting `stage`.
    #[error("delivery of `{path}` stopped before {stage}")]
    Cancelled { path: String, stage: &'static str },

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// Payload does not have the columns or shape the cleaner needs.
    #[error("csv schema error: {0}")]
    Schema(String),

    #[error("payload is not valid {encoding} (invalid byte at offset {offset})")]
    Encoding {
        encoding: &'static str,
        offset: usize,
    },

    /// Listing or download failure from the cloud source.
    #[error("source error: {0}")]
    Source(String),
}

pub type TransferResult<T> = Result<T, TransferError>;

impl TransferError {
    /// Stable label used in logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Auth { .. } => "auth",
            TransferError::Connect { .. } => "connect",
            TransferError::Layout { .. } => "layout",
            TransferError::Transport { .. } => "transport",
            TransferError::VerifyFailed { .. } => "verify",
            TransferError::Cancelled { .. } => "cancelled",
            TransferError::Timeout { .. } => "timeout",
            TransferError::Schema(_) => "schema",
            TransferError::Encoding { .. } => "encoding",
            TransferError::Source(_) => "source",
        }
    }

    /// Whether a later run could plausibly succeed without anyone changing
    /// the file, the credentials or the remote layout.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Connect { .. } => true,
            TransferError::Transport { .. } => true,
            TransferError::Timeout { .. } => true,
            TransferError::Cancelled { .. } => true,
            TransferError::Source(_) => true,
            TransferError::VerifyFailed { .. } => true,
            TransferError::Auth { .. } => false,
            TransferError::Layout { .. } => false,
            TransferError::Schema(_) => false,
            TransferError::Encoding { .. } => false,
        }
    }
}
