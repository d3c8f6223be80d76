//! # fota-sim
//!
//! Simulated collaborators for the update engine.
//!
//! - [`BlockServer`]: block-wise request/response image server
//! - [`PublishStream`]: broker that pushes the image as streamed fragments
//! - [`ReplayTransport`]: delivers a fixed list of chunks, for scenario tests
//! - [`MemoryFlash`]: two-slot OTA partition table held in memory
//! - [`VirtualPlatform`]: sleeps without blocking and counts watchdog feeds
//!
//! Transports run on virtual time by default: an idle poll returns at once
//! and reports the full timeout as elapsed. [`BlockServer::real_time`] makes
//! polls block for real, which the host binary and tests that need a
//! long-running task use.

pub mod block_server;
pub mod flash;
pub mod platform;
pub mod publish;
pub mod replay;

pub use block_server::{BlockServer, Fault};
pub use flash::MemoryFlash;
pub use platform::VirtualPlatform;
pub use publish::PublishStream;
pub use replay::ReplayTransport;
