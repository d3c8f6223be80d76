//! Chunk validation.
//!
//! Classifies a received chunk against the session's expected sequence
//! number. Validation has no side effects; writing happens separately and
//! only for accepted chunks.

use crate::error::ProtocolError;
use crate::model::{Chunk, UpdateSession};

/// Outcome of validating one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Expected chunk, more follow.
    Accept,
    /// Sequence number already consumed.
    Duplicate,
    /// Sequence number ahead of the expected one.
    OutOfOrder,
    /// Expected chunk and the last one of the image.
    Terminal,
}

impl Decision {
    /// Whether the chunk must be written.
    pub fn is_accepted(self) -> bool {
        matches!(self, Decision::Accept | Decision::Terminal)
    }

    /// The sequencing anomaly behind a rejected chunk.
    pub fn protocol_error(self, received: u32, expected: u32) -> Option<ProtocolError> {
        match self {
            Decision::Duplicate => Some(ProtocolError::Duplicate { received, expected }),
            Decision::OutOfOrder => Some(ProtocolError::OutOfOrder { received, expected }),
            Decision::Accept | Decision::Terminal => None,
        }
    }
}

/// Classify `chunk` for `session`.
pub fn validate(chunk: &Chunk, session: &UpdateSession) -> Decision {
    let expected = session.next_expected_sequence();

    if chunk.sequence < expected {
        Decision::Duplicate
    } else if chunk.sequence > expected {
        Decision::OutOfOrder
    } else if chunk.is_terminal() {
        Decision::Terminal
    } else {
        Decision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PartitionHandle, SizeExponent};
    use std::time::Duration;

    fn session_expecting(sequence: u32) -> UpdateSession {
        let mut session = UpdateSession::new(
            PartitionHandle::new("ota_1", 0x110000, 0x10000),
            None,
            Duration::from_secs(5),
        );
        for _ in 0..sequence {
            session.record_accepted(16);
        }
        session
    }

    fn chunk(sequence: u32, more: bool) -> Chunk {
        Chunk::new(sequence, vec![0xAA; 16], more, SizeExponent::new(0).unwrap())
    }

    #[test]
    fn test_expected_chunk_accepted() {
        let session = session_expecting(3);
        assert_eq!(validate(&chunk(3, true), &session), Decision::Accept);
    }

    #[test]
    fn test_expected_last_chunk_is_terminal() {
        let session = session_expecting(3);
        let decision = validate(&chunk(3, false), &session);
        assert_eq!(decision, Decision::Terminal);
        assert!(decision.is_accepted());
    }

    #[test]
    fn test_earlier_chunk_is_duplicate() {
        let session = session_expecting(3);
        assert_eq!(validate(&chunk(2, true), &session), Decision::Duplicate);
        assert_eq!(validate(&chunk(0, false), &session), Decision::Duplicate);
    }

    #[test]
    fn test_later_chunk_is_out_of_order() {
        let session = session_expecting(3);
        let decision = validate(&chunk(5, true), &session);
        assert_eq!(decision, Decision::OutOfOrder);
        assert!(!decision.is_accepted());
    }

    #[test]
    fn test_terminal_flag_ignored_on_mismatch() {
        // A last-chunk marker on the wrong sequence number must not end the transfer.
        let session = session_expecting(1);
        assert_eq!(validate(&chunk(4, false), &session), Decision::OutOfOrder);
    }

    #[test]
    fn test_protocol_error_only_for_rejections() {
        assert_eq!(
            Decision::Duplicate.protocol_error(1, 2),
            Some(ProtocolError::Duplicate {
                received: 1,
                expected: 2
            })
        );
        assert_eq!(Decision::Accept.protocol_error(2, 2), None);
        assert_eq!(Decision::Terminal.protocol_error(2, 2), None);
    }
}
