//! Sequencing for streamed publications.
//!
//! A publish/subscribe delivery hands the image over as fragments of one
//! large message, each tagged with its byte offset and the total message
//! length. [`StreamSequencer`] turns those into numbered [`Chunk`]s so the
//! same validator and session rules apply:
//! - the fragment at the expected offset gets the next sequence number
//! - a fragment at an offset already consumed maps to an earlier number and
//!   is rejected as a duplicate
//! - a fragment past the expected offset maps to a later number and is
//!   rejected as out of order

use fota_core::{Chunk, SizeExponent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Errors that can occur while sequencing fragments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A fragment announced a different total than earlier ones.
    #[error("Total length changed from {expected} to {received}")]
    TotalChanged { expected: u64, received: u64 },

    /// A fragment runs past the announced total.
    #[error("Fragment at offset {offset} with {len} bytes overruns total {total}")]
    Overrun { offset: u64, len: u64, total: u64 },
}

/// One received piece of a streamed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub offset: u64,
    pub data: Vec<u8>,
    pub total_len: u64,
}

impl Fragment {
    pub fn new(offset: u64, data: Vec<u8>, total_len: u64) -> Self {
        Self {
            offset,
            data,
            total_len,
        }
    }
}

/// Maps fragment offsets to chunk sequence numbers.
#[derive(Debug, Default)]
pub struct StreamSequencer {
    total_len: Option<u64>,
    expected_offset: u64,
    next_sequence: u32,
}

impl StreamSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total image size, once the first fragment has announced it.
    pub fn declared_total(&self) -> Option<u64> {
        self.total_len
    }

    /// Offset of the next in-order fragment.
    pub fn expected_offset(&self) -> u64 {
        self.expected_offset
    }

    pub fn is_complete(&self) -> bool {
        self.total_len
            .is_some_and(|total| self.expected_offset >= total)
    }

    /// Number `fragment` as a chunk.
    pub fn sequence(&mut self, fragment: Fragment) -> Result<Chunk, StreamError> {
        let total = match self.total_len {
            Some(expected) if expected != fragment.total_len => {
                return Err(StreamError::TotalChanged {
                    expected,
                    received: fragment.total_len,
                });
            }
            Some(total) => total,
            None => {
                self.total_len = Some(fragment.total_len);
                fragment.total_len
            }
        };

        let len = fragment.data.len() as u64;
        let end = fragment.offset.saturating_add(len);
        if end > total {
            return Err(StreamError::Overrun {
                offset: fragment.offset,
                len,
                total,
            });
        }

        let sequence = if fragment.offset == self.expected_offset {
            let sequence = self.next_sequence;
            self.expected_offset = end;
            self.next_sequence += 1;
            sequence
        } else if fragment.offset < self.expected_offset {
            self.next_sequence.saturating_sub(1)
        } else {
            self.next_sequence + 1
        };

        trace!(
            offset = fragment.offset,
            len,
            sequence,
            "Fragment sequenced"
        );

        Ok(Chunk::new(
            sequence,
            fragment.data,
            end < total,
            SizeExponent::fitting(len as usize),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fota_core::{validate, Decision, PartitionHandle, UpdateSession};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_in_order_fragments() {
        let mut sequencer = StreamSequencer::new();

        let first = sequencer.sequence(Fragment::new(0, vec![1; 100], 250)).unwrap();
        let second = sequencer.sequence(Fragment::new(100, vec![2; 100], 250)).unwrap();
        let last = sequencer.sequence(Fragment::new(200, vec![3; 50], 250)).unwrap();

        assert_eq!(
            (first.sequence, second.sequence, last.sequence),
            (0, 1, 2)
        );
        assert!(first.more && second.more);
        assert!(last.is_terminal());
        assert!(sequencer.is_complete());
        assert_eq!(sequencer.declared_total(), Some(250));
    }

    #[test]
    fn test_repeated_offset_is_duplicate() {
        let mut sequencer = StreamSequencer::new();
        let session = UpdateSession::new(
            PartitionHandle::new("ota_1", 0x110000, 0x1000),
            Some(200),
            Duration::from_secs(5),
        );

        let first = sequencer.sequence(Fragment::new(0, vec![1; 100], 200)).unwrap();
        assert_eq!(validate(&first, &session), Decision::Accept);

        let repeat = sequencer.sequence(Fragment::new(0, vec![1; 100], 200)).unwrap();
        assert_eq!(repeat.sequence, 0);
        assert_eq!(sequencer.expected_offset(), 100);

        let next = sequencer.sequence(Fragment::new(100, vec![2; 100], 200)).unwrap();
        assert_eq!(next.sequence, 1);
        assert!(next.is_terminal());
    }

    #[test]
    fn test_gap_is_out_of_order() {
        let mut sequencer = StreamSequencer::new();
        sequencer.sequence(Fragment::new(0, vec![1; 100], 400)).unwrap();

        let ahead = sequencer.sequence(Fragment::new(300, vec![4; 100], 400)).unwrap();
        assert_eq!(ahead.sequence, 2);
        assert_eq!(sequencer.expected_offset(), 100);

        let next = sequencer.sequence(Fragment::new(100, vec![2; 100], 400)).unwrap();
        assert_eq!(next.sequence, 1);
    }

    #[test]
    fn test_total_must_not_change() {
        let mut sequencer = StreamSequencer::new();
        sequencer.sequence(Fragment::new(0, vec![0; 10], 20)).unwrap();
        assert_eq!(
            sequencer.sequence(Fragment::new(10, vec![0; 10], 30)),
            Err(StreamError::TotalChanged {
                expected: 20,
                received: 30
            })
        );
    }

    #[test]
    fn test_overrun_rejected() {
        let mut sequencer = StreamSequencer::new();
        assert!(matches!(
            sequencer.sequence(Fragment::new(0, vec![0; 30], 20)),
            Err(StreamError::Overrun { total: 20, .. })
        ));
    }

    #[test]
    fn test_fragment_json() {
        let fragment: Fragment =
            serde_json::from_str(r#"{"offset":4,"data":[1,2],"totalLen":6}"#).unwrap();
        assert_eq!(fragment, Fragment::new(4, vec![1, 2], 6));
    }
}
