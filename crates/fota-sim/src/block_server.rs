//! Block-wise image server.
//!
//! Every request travels as an encoded block option, so the codec in
//! `fota-protocol` is on the path in both directions. The server answers
//! each request with the requested block unless a [`Fault`] is scheduled for
//! that request.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

use fota_core::{Polled, RequestId, SessionError, SizeExponent, Transport, TransportError};
use fota_protocol::BlockOption;
use tracing::{debug, warn};

/// Misbehaviour injected for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with the block before the requested one.
    RepeatPrevious,
    /// Answer with a block this many positions ahead.
    JumpAhead(u32),
    /// Never answer.
    Drop,
    /// Fail to send the request.
    SendError,
}

struct Frame {
    option: Vec<u8>,
    payload: Vec<u8>,
}

/// Open session with the simulated server.
pub struct BlockSession {
    id: u32,
    inbox: VecDeque<Frame>,
}

impl BlockSession {
    pub fn id(&self) -> u32 {
        self.id
    }
}

pub struct BlockServer {
    image: Vec<u8>,
    faults: HashMap<usize, Fault>,
    dns_failures: u32,
    unsupported: bool,
    latency: Duration,
    real_time: bool,
    requests: Vec<BlockOption>,
    sessions_opened: u32,
    sessions_closed: u32,
}

impl BlockServer {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            faults: HashMap::new(),
            dns_failures: 0,
            unsupported: false,
            latency: Duration::from_millis(1),
            real_time: false,
            requests: Vec::new(),
            sessions_opened: 0,
            sessions_closed: 0,
        }
    }

    /// Schedule `fault` for the request with the given index (0 = first request).
    pub fn with_fault(mut self, request_index: usize, fault: Fault) -> Self {
        self.faults.insert(request_index, fault);
        self
    }

    /// Fail name resolution for the first `count` session attempts.
    pub fn with_dns_failures(mut self, count: u32) -> Self {
        self.dns_failures = count;
        self
    }

    /// Reject every destination as unsupported.
    pub fn unsupported(mut self) -> Self {
        self.unsupported = true;
        self
    }

    /// Response delay, capped at the poll timeout.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Block the calling thread for the simulated time.
    pub fn real_time(mut self) -> Self {
        self.real_time = true;
        self
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Requests as decoded by the server.
    pub fn requests(&self) -> &[BlockOption] {
        &self.requests
    }

    pub fn requested_blocks(&self) -> Vec<u32> {
        self.requests.iter().map(|option| option.num).collect()
    }

    pub fn sessions_opened(&self) -> u32 {
        self.sessions_opened
    }

    pub fn sessions_closed(&self) -> u32 {
        self.sessions_closed
    }

    fn respond(&self, request: &BlockOption, fault: Option<Fault>) -> Option<Frame> {
        let num = match fault {
            Some(Fault::Drop) => {
                debug!(block = request.num, "Dropping response");
                return None;
            }
            Some(Fault::RepeatPrevious) => request.num.saturating_sub(1),
            Some(Fault::JumpAhead(n)) => request.num.saturating_add(n),
            Some(Fault::SendError) | None => request.num,
        };

        let block_size = request.block_size();
        let start = (num as usize).saturating_mul(block_size).min(self.image.len());
        let end = start.saturating_add(block_size).min(self.image.len());

        match BlockOption::new(num, end < self.image.len(), request.szx) {
            Ok(option) => Some(Frame {
                option: option.to_bytes(),
                payload: self.image[start..end].to_vec(),
            }),
            Err(e) => {
                warn!("Cannot answer block {}: {}", num, e);
                None
            }
        }
    }

    fn pause(&self, duration: Duration) {
        if self.real_time {
            thread::sleep(duration);
        }
    }
}

impl Transport for BlockServer {
    type Session = BlockSession;

    fn open_session(&mut self, destination: &str) -> Result<BlockSession, SessionError> {
        if self.unsupported {
            return Err(SessionError::Unsupported(destination.to_string()));
        }
        if self.dns_failures > 0 {
            self.dns_failures -= 1;
            return Err(SessionError::DnsFailure(destination.to_string()));
        }

        self.sessions_opened += 1;
        debug!(session = self.sessions_opened, "Session opened");
        Ok(BlockSession {
            id: self.sessions_opened,
            inbox: VecDeque::new(),
        })
    }

    fn send_chunk_request(
        &mut self,
        session: &mut BlockSession,
        sequence: u32,
        size_exponent: SizeExponent,
    ) -> Result<RequestId, TransportError> {
        let index = self.requests.len();
        let fault = self.faults.remove(&index);

        if fault == Some(Fault::SendError) {
            return Err(TransportError::Send {
                sequence,
                reason: "network unreachable".to_string(),
            });
        }

        let send_error = |reason: String| TransportError::Send { sequence, reason };
        let wire = BlockOption::request(sequence, size_exponent)
            .map_err(|e| send_error(e.to_string()))?
            .to_bytes();
        let request = BlockOption::from_bytes(&wire).map_err(|e| send_error(e.to_string()))?;

        if let Some(frame) = self.respond(&request, fault) {
            session.inbox.push_back(frame);
        }
        self.requests.push(request);

        Ok(RequestId(index as u32))
    }

    fn poll(&mut self, session: &mut BlockSession, timeout: Duration) -> Result<Polled, TransportError> {
        match session.inbox.pop_front() {
            Some(frame) => {
                let elapsed = self.latency.min(timeout);
                self.pause(elapsed);
                let option = BlockOption::from_bytes(&frame.option)
                    .map_err(|e| TransportError::Poll(e.to_string()))?;
                Ok(Polled::chunk(option.into_chunk(frame.payload), elapsed))
            }
            None => {
                self.pause(timeout);
                Ok(Polled::idle(timeout))
            }
        }
    }

    fn close_session(&mut self, session: BlockSession) {
        self.sessions_closed += 1;
        debug!(session = session.id, "Session closed");
    }
}
