//! Publish/subscribe image delivery.
//!
//! The broker pushes the whole image as one message split into fragments as
//! soon as the first chunk request (the subscription) arrives. Later
//! requests are recorded but have no effect; a stalled publication can only
//! end in a timeout.

use std::collections::VecDeque;
use std::time::Duration;

use fota_core::{Polled, RequestId, SessionError, SizeExponent, Transport, TransportError};
use fota_protocol::{Fragment, StreamSequencer};
use tracing::debug;

pub struct PublishSession {
    queue: VecDeque<Fragment>,
    sequencer: StreamSequencer,
    subscribed: bool,
}

impl PublishSession {
    /// Total announced by the publication, once the first fragment arrived.
    pub fn declared_total(&self) -> Option<u64> {
        self.sequencer.declared_total()
    }
}

pub struct PublishStream {
    image: Vec<u8>,
    fragment_len: usize,
    repeats: Vec<usize>,
    stall_after: Option<usize>,
    requests: Vec<u32>,
    sessions_closed: u32,
}

impl PublishStream {
    pub fn new(image: Vec<u8>, fragment_len: usize) -> Self {
        Self {
            image,
            fragment_len: fragment_len.max(1),
            repeats: Vec::new(),
            stall_after: None,
            requests: Vec::new(),
            sessions_closed: 0,
        }
    }

    /// Deliver fragment `index` twice.
    pub fn with_repeat(mut self, index: usize) -> Self {
        self.repeats.push(index);
        self
    }

    /// Stop publishing after `count` fragments.
    pub fn with_stall_after(mut self, count: usize) -> Self {
        self.stall_after = Some(count);
        self
    }

    pub fn requests(&self) -> &[u32] {
        &self.requests
    }

    pub fn sessions_closed(&self) -> u32 {
        self.sessions_closed
    }

    fn publish(&self) -> VecDeque<Fragment> {
        let total = self.image.len() as u64;
        let mut queue = VecDeque::new();
        for (index, piece) in self.image.chunks(self.fragment_len).enumerate() {
            let offset = (index * self.fragment_len) as u64;
            let fragment = Fragment::new(offset, piece.to_vec(), total);
            if self.repeats.contains(&index) {
                queue.push_back(fragment.clone());
            }
            queue.push_back(fragment);
        }
        if let Some(count) = self.stall_after {
            queue.truncate(count);
        }
        queue
    }
}

impl Transport for PublishStream {
    type Session = PublishSession;

    fn open_session(&mut self, destination: &str) -> Result<PublishSession, SessionError> {
        debug!(topic = destination, "Subscribing");
        Ok(PublishSession {
            queue: VecDeque::new(),
            sequencer: StreamSequencer::new(),
            subscribed: false,
        })
    }

    fn send_chunk_request(
        &mut self,
        session: &mut PublishSession,
        sequence: u32,
        _size_exponent: SizeExponent,
    ) -> Result<RequestId, TransportError> {
        self.requests.push(sequence);
        if !session.subscribed {
            session.subscribed = true;
            session.queue = self.publish();
            debug!(fragments = session.queue.len(), "Publication started");
        }
        Ok(RequestId(self.requests.len() as u32))
    }

    fn poll(&mut self, session: &mut PublishSession, timeout: Duration) -> Result<Polled, TransportError> {
        match session.queue.pop_front() {
            Some(fragment) => {
                let chunk = session
                    .sequencer
                    .sequence(fragment)
                    .map_err(|e| TransportError::Poll(e.to_string()))?;
                Ok(Polled::chunk(chunk, Duration::from_millis(1)))
            }
            None => Ok(Polled::idle(timeout)),
        }
    }

    fn declared_total(&self, session: &PublishSession) -> Option<u64> {
        session.declared_total()
    }

    fn close_session(&mut self, _session: PublishSession) {
        self.sessions_closed += 1;
        debug!("Unsubscribed");
    }
}
