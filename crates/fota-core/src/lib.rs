//! # fota-core
//!
//! Chunked-transfer firmware update engine.
//!
//! This crate provides:
//! - Data model types (Chunk, UpdateSession, PartitionHandle, status types)
//! - Chunk validation (accept / duplicate / out-of-order / terminal)
//! - Append-only flash writing into the candidate partition
//! - The one-request-at-a-time transfer session loop
//! - Partition commit (identity check, boot switch, restart)
//! - The update supervisor exposed to the host as start / cancel / status
//!
//! This crate is intentionally runtime-agnostic and contains no async code.
//! Transport, flash and platform services are consumed through the traits in
//! [`ports`], so the same engine runs on ESP-IDF targets and on the host
//! against simulated collaborators.

pub mod commit;
pub mod config;
pub mod control;
pub mod error;
pub mod flash;
pub mod model;
pub mod ports;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod validator;

#[cfg(test)]
mod testing;

pub use commit::{finalize, CommitOutcome};
pub use config::{ConfigError, UpdateConfig};
pub use control::UpdateControl;
pub use error::{
    CommitError, FlashError, ProtocolError, SessionError, SupervisorError, TransportError,
    UpdateError,
};
pub use flash::{CompletedImage, FlashWriteCursor, FlashWriter};
pub use model::*;
pub use ports::{BootStorage, Platform, PollEvent, Polled, RequestId, StdPlatform, Transport};
pub use session::{ChunkSink, OpenSession, SessionManager, SessionStep};
pub use sink::ImageSink;
pub use supervisor::{UpdateEngine, UpdateSupervisor};
pub use validator::{validate, Decision};
