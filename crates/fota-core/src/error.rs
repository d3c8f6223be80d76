//! Error types for the update engine.
//!
//! Retryable session-establishment errors are absorbed by the session layer;
//! everything else ends the transfer and is surfaced through
//! [`UpdateError`] and the host-visible [`FailureReason`].

use std::time::Duration;

use thiserror::Error;

use crate::model::FailureReason;

/// Errors while establishing a transfer session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The destination host name could not be resolved. Retried.
    #[error("DNS lookup failed for {0}")]
    DnsFailure(String),

    /// The destination scheme or security mode is not supported.
    #[error("Unsupported destination: {0}")]
    Unsupported(String),

    /// Session setup failed for another reason.
    #[error("Session setup failed: {0}")]
    Failed(String),

    /// The configured retry limit was reached.
    #[error("Gave up after {attempts} session attempts")]
    RetriesExhausted { attempts: u32 },
}

impl SessionError {
    /// Whether the session layer should wait and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::DnsFailure(_))
    }
}

/// Errors reported by the transport once a session is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Failed to send request for chunk {sequence}: {reason}")]
    Send { sequence: u32, reason: String },

    #[error("Poll failed: {0}")]
    Poll(String),

    #[error("Session closed by peer")]
    Closed,
}

/// Chunk sequencing anomalies. Never fatal: nothing is written and the
/// expected chunk is requested again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Duplicate chunk {received}, expected {expected}")]
    Duplicate { received: u32, expected: u32 },

    #[error("Out-of-order chunk {received}, expected {expected}")]
    OutOfOrder { received: u32, expected: u32 },
}

/// Errors writing or finalizing the candidate partition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("No update partition available")]
    NoUpdatePartition,

    #[error("Failed to begin update: {0}")]
    Begin(String),

    #[error("Write of {len} bytes at offset {offset} exceeds partition capacity {capacity}")]
    CapacityExceeded { offset: u64, len: u64, capacity: u64 },

    #[error("Write of {len} bytes at offset {offset} exceeds declared image size {declared}")]
    DeclaredSizeExceeded { offset: u64, len: u64, declared: u64 },

    #[error("Write at offset {offset} failed: {reason}")]
    Write { offset: u64, reason: String },

    #[error("Sender announced {announced} bytes, but {declared} were declared")]
    SizeConflict { declared: u64, announced: u64 },

    #[error("Image incomplete: declared {declared} bytes, wrote {written}")]
    SizeMismatch { declared: u64, written: u64 },

    #[error("Failed to finalize update: {0}")]
    End(String),
}

/// Errors committing a completed image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("Failed to set boot partition {partition}: {reason}")]
    SetBoot { partition: String, reason: String },
}

/// Why a transfer ended without a commit.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("No chunk received within {}ms", .waited.as_millis())]
    Timeout { waited: Duration },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("Update cancelled")]
    Cancelled,
}

impl UpdateError {
    /// Host-visible failure reason, or `None` for a cancellation.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            UpdateError::Session(e) => Some(FailureReason::Session(e.to_string())),
            UpdateError::Timeout { waited } => Some(FailureReason::Timeout {
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            }),
            UpdateError::Transport(e) => Some(FailureReason::Transport(e.to_string())),
            UpdateError::Flash(e) => Some(FailureReason::Flash(e.to_string())),
            UpdateError::Commit(e) => Some(FailureReason::Commit(e.to_string())),
            UpdateError::Cancelled => None,
        }
    }
}

/// Errors returned by the host-facing supervisor API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("An update is already in progress")]
    Busy,

    #[error("Update task failed ({0}); restart the update task to retry")]
    TaskFailed(FailureReason),

    #[error("An update has already been committed")]
    AlreadyCommitted,

    #[error("Failed to spawn update task: {0}")]
    Spawn(String),

    #[error("Update task panicked")]
    TaskPanicked,

    #[error("No update task is running")]
    NotRunning,
}
