//! External collaborator interfaces.
//!
//! The engine never talks to a network stack, flash driver or scheduler
//! directly. Platforms implement these traits:
//! - [`Transport`]: the session-oriented request/response layer that delivers chunks
//! - [`BootStorage`]: OTA partitions, boot configuration and system restart
//! - [`Platform`]: blocking delay and the watchdog liveness signal
//!
//! All methods are synchronous; the update task is a single blocking loop.

use std::time::Duration;

use crate::error::{CommitError, FlashError, SessionError, TransportError};
use crate::model::{Chunk, PartitionHandle, SizeExponent};

/// Identifier the transport assigned to a sent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u32);

/// What a single poll produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    ChunkReceived(Chunk),
    NoEvent,
}

/// Result of one blocking poll, with the time it actually blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polled {
    pub event: PollEvent,
    pub elapsed: Duration,
}

impl Polled {
    pub fn chunk(chunk: Chunk, elapsed: Duration) -> Self {
        Self {
            event: PollEvent::ChunkReceived(chunk),
            elapsed,
        }
    }

    pub fn idle(elapsed: Duration) -> Self {
        Self {
            event: PollEvent::NoEvent,
            elapsed,
        }
    }
}

/// Session-oriented chunk transport.
pub trait Transport {
    /// Open session state (context, peer address, security association).
    type Session;

    /// Resolve and connect to `destination`.
    fn open_session(&mut self, destination: &str) -> Result<Self::Session, SessionError>;

    /// Ask the peer for chunk `sequence` in the given size class.
    fn send_chunk_request(
        &mut self,
        session: &mut Self::Session,
        sequence: u32,
        size_exponent: SizeExponent,
    ) -> Result<RequestId, TransportError>;

    /// Block for at most `timeout` waiting for the next event.
    ///
    /// `elapsed` in the result must report how long the call blocked; the
    /// session deadline is charged with it.
    fn poll(
        &mut self,
        session: &mut Self::Session,
        timeout: Duration,
    ) -> Result<Polled, TransportError>;

    /// Total image size the peer announced during the transfer, if any.
    fn declared_total(&self, _session: &Self::Session) -> Option<u64> {
        None
    }

    /// Tear the session down and release its resources.
    fn close_session(&mut self, session: Self::Session);
}

/// OTA partition and boot configuration service.
pub trait BootStorage {
    /// In-progress write state for one candidate partition.
    type Handle;

    /// Partition the system booted from.
    fn running_partition(&self) -> PartitionHandle;

    /// Partition the bootloader will load next.
    fn boot_partition(&self) -> PartitionHandle;

    /// Inactive partition that should receive the next image.
    fn next_update_partition(&self) -> Option<PartitionHandle>;

    /// Prepare `target` for writing, erasing as much as `declared_size` needs
    /// (or the whole partition when the size is unknown).
    fn begin_update(
        &mut self,
        target: &PartitionHandle,
        declared_size: Option<u64>,
    ) -> Result<Self::Handle, FlashError>;

    /// Append `bytes` to the image.
    fn write(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> Result<(), FlashError>;

    /// Finish writing and validate the image.
    fn end_update(&mut self, handle: Self::Handle) -> Result<(), FlashError>;

    /// Abandon a partially written image. The candidate must not be
    /// selectable as a boot target afterwards.
    fn abort_update(&mut self, handle: Self::Handle);

    /// Whether both partitions hold the same application image.
    fn images_identical(&self, a: &PartitionHandle, b: &PartitionHandle) -> bool;

    /// Atomically select `partition` as the next boot target.
    fn set_boot_partition(&mut self, partition: &PartitionHandle) -> Result<(), CommitError>;

    /// Restart the system. Does not return on hardware; test doubles record
    /// the call and return.
    fn restart_system(&mut self);
}

/// Scheduler services the update task needs.
pub trait Platform {
    /// Block the update task for `duration`.
    fn sleep(&mut self, duration: Duration);

    /// Tell the watchdog the update task is alive.
    fn feed_watchdog(&mut self);
}

/// Host platform: thread sleep and no watchdog.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPlatform;

impl Platform for StdPlatform {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn feed_watchdog(&mut self) {}
}
