//! Transport that replays a fixed chunk list.
//!
//! Each poll delivers the next scripted chunk regardless of what was
//! requested, which makes duplicate and out-of-order deliveries easy to set
//! up. Once the list is exhausted every poll is idle.

use std::collections::VecDeque;
use std::time::Duration;

use fota_core::{Chunk, Polled, RequestId, SessionError, SizeExponent, Transport, TransportError};

pub struct ReplayTransport {
    chunks: VecDeque<Chunk>,
    requests: Vec<(u32, SizeExponent)>,
    sessions_closed: u32,
}

impl ReplayTransport {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self {
            chunks: chunks.into(),
            requests: Vec::new(),
            sessions_closed: 0,
        }
    }

    /// Requested sequence numbers in order.
    pub fn requested(&self) -> Vec<u32> {
        self.requests.iter().map(|(sequence, _)| *sequence).collect()
    }

    pub fn requests(&self) -> &[(u32, SizeExponent)] {
        &self.requests
    }

    pub fn sessions_closed(&self) -> u32 {
        self.sessions_closed
    }
}

impl Transport for ReplayTransport {
    type Session = ();

    fn open_session(&mut self, _destination: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn send_chunk_request(
        &mut self,
        _session: &mut (),
        sequence: u32,
        size_exponent: SizeExponent,
    ) -> Result<RequestId, TransportError> {
        self.requests.push((sequence, size_exponent));
        Ok(RequestId(self.requests.len() as u32))
    }

    fn poll(&mut self, _session: &mut (), timeout: Duration) -> Result<Polled, TransportError> {
        Ok(match self.chunks.pop_front() {
            Some(chunk) => Polled::chunk(chunk, Duration::ZERO),
            None => Polled::idle(timeout),
        })
    }

    fn close_session(&mut self, _session: ()) {
        self.sessions_closed += 1;
    }
}
