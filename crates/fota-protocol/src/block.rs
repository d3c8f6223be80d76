//! Block option codec.
//!
//! A block option packs the block number, the more flag and the size
//! exponent into one unsigned value:
//!
//! ```text
//!  bits 23..4   3   2..0
//! +----------+---+-----+
//! |   NUM    | M | SZX |
//! +----------+---+-----+
//! ```
//!
//! On the wire the value is sent big-endian in as few bytes as possible
//! (zero bytes for the value 0, at most three).

use fota_core::{Chunk, SizeExponent};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encoding or decoding a block option.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Option value longer than three bytes.
    #[error("Block option is {0} bytes long, at most 3 allowed")]
    TooLong(usize),

    /// Block number does not fit in 20 bits.
    #[error("Block number {0} exceeds 20 bits")]
    NumTooLarge(u32),

    /// SZX 7 is reserved.
    #[error("Reserved size exponent 7")]
    ReservedSizeExponent,
}

/// Decoded block option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOption {
    pub num: u32,
    pub more: bool,
    pub szx: SizeExponent,
}

impl BlockOption {
    /// Largest encodable block number.
    pub const MAX_NUM: u32 = (1 << 20) - 1;

    pub fn new(num: u32, more: bool, szx: SizeExponent) -> Result<Self, CodecError> {
        if num > Self::MAX_NUM {
            return Err(CodecError::NumTooLarge(num));
        }
        Ok(Self { num, more, szx })
    }

    /// Option sent with a request for block `num`.
    pub fn request(num: u32, szx: SizeExponent) -> Result<Self, CodecError> {
        Self::new(num, false, szx)
    }

    pub fn block_size(&self) -> usize {
        self.szx.block_size()
    }

    /// Byte offset of this block in the image.
    pub fn offset(&self) -> u64 {
        u64::from(self.num) * self.block_size() as u64
    }

    /// Option for requesting the block after this one, keeping the size
    /// exponent and clearing the more flag.
    pub fn next_request(&self) -> Result<Self, CodecError> {
        Self::request(self.num.saturating_add(1), self.szx)
    }

    pub fn encode(&self) -> u32 {
        (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx.value())
    }

    pub fn decode(value: u32) -> Result<Self, CodecError> {
        if value > 0x00FF_FFFF {
            return Err(CodecError::TooLong(4));
        }
        let szx = SizeExponent::new((value & 0x7) as u8).ok_or(CodecError::ReservedSizeExponent)?;
        Ok(Self {
            num: value >> 4,
            more: value & 0x8 != 0,
            szx,
        })
    }

    /// Minimal big-endian encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let value = self.encode();
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        bytes[skip..].to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > 3 {
            return Err(CodecError::TooLong(bytes.len()));
        }
        let value = bytes
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        Self::decode(value)
    }

    /// Attach a response payload, producing the chunk for the session.
    pub fn into_chunk(self, payload: Vec<u8>) -> Chunk {
        Chunk::new(self.num, payload, self.more, self.szx)
    }
}
