//! Firmware update data model.
//!
//! These types describe one retrieve-then-commit update:
//! - Chunks as delivered by the transport (sequence / more flag / size exponent)
//! - Partition handles for the running, boot-configured and candidate slots
//! - The per-transfer session bookkeeping
//! - Host-visible status and supervisor state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Negotiated chunk size class.
///
/// A size exponent `szx` selects a chunk size of `16 << szx` bytes, so the
/// valid range 0..=6 covers 16 to 1024 bytes. The value 7 is reserved by the
/// block-wise transfer protocol and is never constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SizeExponent(u8);

impl SizeExponent {
    /// Largest valid exponent (1024-byte chunks).
    pub const MAX: SizeExponent = SizeExponent(6);

    /// Create a size exponent, rejecting the reserved value and anything above it.
    pub fn new(szx: u8) -> Option<Self> {
        (szx <= Self::MAX.0).then_some(Self(szx))
    }

    /// The raw exponent.
    pub fn value(self) -> u8 {
        self.0
    }

    /// Chunk size in bytes selected by this exponent.
    pub fn block_size(self) -> usize {
        16usize << self.0
    }

    /// Largest exponent whose chunk size does not exceed `bytes`.
    ///
    /// Anything smaller than 16 bytes maps to the smallest class.
    pub fn fitting(bytes: usize) -> Self {
        let mut szx = Self::MAX.0;
        while szx > 0 && (16usize << szx) > bytes {
            szx -= 1;
        }
        Self(szx)
    }
}

impl Default for SizeExponent {
    fn default() -> Self {
        Self::MAX
    }
}

impl TryFrom<u8> for SizeExponent {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("size exponent {} out of range 0..=6", value))
    }
}

impl From<SizeExponent> for u8 {
    fn from(szx: SizeExponent) -> Self {
        szx.0
    }
}

/// One unit of the firmware image plus its sequence metadata.
///
/// Immutable once received; consumed exactly once by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk in the transfer, starting at 0.
    pub sequence: u32,
    /// Image bytes carried by this chunk.
    pub payload: Vec<u8>,
    /// `true` while further chunks follow.
    pub more: bool,
    /// Size class the sender used for this chunk.
    pub size_exponent: SizeExponent,
}

impl Chunk {
    pub fn new(sequence: u32, payload: Vec<u8>, more: bool, size_exponent: SizeExponent) -> Self {
        Self {
            sequence,
            payload,
            more,
            size_exponent,
        }
    }

    /// Whether this is the last chunk of the image.
    pub fn is_terminal(&self) -> bool {
        !self.more
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Opaque reference to an application partition.
///
/// Two handles refer to the same partition when label, offset and capacity
/// all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionHandle {
    /// Partition table label (e.g. "ota_0").
    pub label: String,
    /// Flash offset of the partition.
    pub offset: u32,
    /// Physical capacity in bytes.
    pub capacity: u64,
}

impl PartitionHandle {
    pub fn new(label: &str, offset: u32, capacity: u64) -> Self {
        Self {
            label: label.to_string(),
            offset,
            capacity,
        }
    }
}

impl fmt::Display for PartitionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (offset 0x{:08x})", self.label, self.offset)
    }
}

/// Bookkeeping for one transfer.
///
/// Created when a transfer starts and owned by the update task until it
/// completes, is cancelled or aborts. The counters only move forward through
/// [`UpdateSession::record_accepted`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    candidate: PartitionHandle,
    declared_total_size: Option<u64>,
    bytes_written: u64,
    next_expected_sequence: u32,
    request_deadline: Duration,
}

impl UpdateSession {
    pub fn new(
        candidate: PartitionHandle,
        declared_total_size: Option<u64>,
        request_deadline: Duration,
    ) -> Self {
        Self {
            candidate,
            declared_total_size,
            bytes_written: 0,
            next_expected_sequence: 0,
            request_deadline,
        }
    }

    pub fn candidate(&self) -> &PartitionHandle {
        &self.candidate
    }

    pub fn declared_total_size(&self) -> Option<u64> {
        self.declared_total_size
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn next_expected_sequence(&self) -> u32 {
        self.next_expected_sequence
    }

    pub fn request_deadline(&self) -> Duration {
        self.request_deadline
    }

    /// Adopt a total size the sender announced after the transfer started.
    pub(crate) fn set_declared_total_size(&mut self, total: u64) {
        self.declared_total_size = Some(total);
    }

    /// Record an accepted chunk whose payload has been written.
    pub(crate) fn record_accepted(&mut self, payload_len: u64) {
        self.next_expected_sequence += 1;
        self.bytes_written += payload_len;
    }

    /// Host-visible progress for this session.
    pub fn progress(&self) -> UpdateStatus {
        UpdateStatus::InProgress {
            bytes_written: self.bytes_written,
            total: self.declared_total_size,
        }
    }
}

/// Why an update ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum FailureReason {
    /// The transfer session could not be established.
    Session(String),
    /// No chunk arrived within the per-request deadline.
    Timeout { waited_ms: u64 },
    /// The transport reported an error while sending or polling.
    Transport(String),
    /// Writing or finalizing the candidate partition failed.
    Flash(String),
    /// Switching the boot partition failed.
    Commit(String),
    /// The update task terminated abnormally.
    Task(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Session(msg) => write!(f, "session: {}", msg),
            FailureReason::Timeout { waited_ms } => {
                write!(f, "no chunk received within {} ms", waited_ms)
            }
            FailureReason::Transport(msg) => write!(f, "transport: {}", msg),
            FailureReason::Flash(msg) => write!(f, "flash: {}", msg),
            FailureReason::Commit(msg) => write!(f, "commit: {}", msg),
            FailureReason::Task(msg) => write!(f, "task: {}", msg),
        }
    }
}

/// Update status as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UpdateStatus {
    /// No update has been triggered (or the last one was cancelled).
    Idle,
    /// A transfer is running.
    #[serde(rename_all = "camelCase")]
    InProgress {
        bytes_written: u64,
        total: Option<u64>,
    },
    /// The new image is committed and the system is restarting.
    Succeeded,
    /// The update task stopped on an unrecoverable error.
    Failed { reason: FailureReason },
    /// The downloaded image is identical to the running one.
    RedundantImage,
}

impl UpdateStatus {
    /// Whether a finished update left nothing more to do for this task instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateStatus::Succeeded | UpdateStatus::Failed { .. })
    }
}

impl Default for UpdateStatus {
    fn default() -> Self {
        UpdateStatus::Idle
    }
}

/// States of the update supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting,
    RequestingChunk,
    AwaitingChunk,
    Writing,
    Committing,
    Restarting,
    /// Passive wait after a redundant image, until the next trigger.
    Redundant,
    Failed,
}

impl Default for SupervisorState {
    fn default() -> Self {
        SupervisorState::Idle
    }
}

/// What started an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerSource {
    /// Update button press.
    Button,
    /// Update task started by the service manager.
    ServiceStart,
    /// Operator request through a host API.
    Manual,
}

/// Context passed with `start_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    pub source: TriggerSource,
    /// Total image size when the sender announced it in advance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_size: Option<u64>,
}

impl TriggerContext {
    pub fn new(source: TriggerSource) -> Self {
        Self {
            source,
            declared_size: None,
        }
    }

    pub fn button() -> Self {
        Self::new(TriggerSource::Button)
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }
}
