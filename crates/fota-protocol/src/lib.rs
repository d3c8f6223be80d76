//! # fota-protocol
//!
//! Wire-level chunk framing for firmware transfers.
//!
//! Two delivery styles are supported:
//! - Block-wise request/response, where each chunk carries a block option
//!   (`num`, more flag, size exponent). See [`block`].
//! - Streamed publications that arrive as `(offset, data, total_len)`
//!   fragments. See [`stream`].
//!
//! Both produce [`fota_core::Chunk`] values for the session manager.

pub mod block;
pub mod stream;

pub use block::{BlockOption, CodecError};
pub use stream::{Fragment, StreamError, StreamSequencer};
