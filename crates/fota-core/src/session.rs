//! Transfer session management.
//!
//! A transfer is a strict one-request-at-a-time exchange: the manager asks
//! for chunk `n`, waits until it arrives or the per-request deadline runs
//! out, hands it to a [`ChunkSink`], and only then asks for the next one.
//!
//! Deadline rules:
//! - Sending a request for a new sequence number re-arms the deadline.
//! - Re-requesting after a duplicate or out-of-order chunk does not.
//! - A poll that reports zero elapsed time is charged its full wait.
//! - When the deadline expires the transfer is aborted and no further
//!   request is sent.
//!
//! The open transport session is owned by an [`OpenSession`] guard and is
//! closed exactly once, whichever way the transfer ends.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::control::UpdateControl;
use crate::error::{FlashError, SessionError, TransportError, UpdateError};
use crate::model::{Chunk, SizeExponent, SupervisorState};
use crate::ports::{Platform, PollEvent, Polled, RequestId, Transport};
use crate::validator::Decision;

/// Consumer of received chunks.
///
/// Implementations validate the chunk and persist it when accepted. The
/// returned decision drives what the session requests next.
pub trait ChunkSink {
    fn on_chunk(&mut self, chunk: &Chunk) -> Result<Decision, FlashError>;

    /// Sequence number the sink will accept next.
    fn expected_sequence(&self) -> u32;

    /// The sender announced the total image size.
    fn on_declared_total(&mut self, _total: u64) -> Result<(), FlashError> {
        Ok(())
    }
}

/// An established transport session, closed on drop.
pub struct OpenSession<'a, T: Transport> {
    transport: &'a mut T,
    session: Option<T::Session>,
}

impl<'a, T: Transport> OpenSession<'a, T> {
    /// Open a session to the configured destination.
    ///
    /// DNS failures are retried after `session_retry_delay`, without limit
    /// unless `max_session_attempts` is set. Other errors are returned
    /// immediately. A pending cancel is honoured before every attempt.
    pub fn establish<P: Platform>(
        transport: &'a mut T,
        platform: &mut P,
        config: &UpdateConfig,
        control: &UpdateControl,
    ) -> Result<Self, UpdateError> {
        control.set_state(SupervisorState::Connecting);
        let mut attempts: u32 = 0;

        loop {
            if control.is_cancel_requested() {
                return Err(UpdateError::Cancelled);
            }
            attempts += 1;

            match transport.open_session(&config.destination) {
                Ok(session) => {
                    info!(destination = %config.destination, attempts, "Transfer session established");
                    return Ok(Self {
                        transport,
                        session: Some(session),
                    });
                }
                Err(e) if e.is_retryable() => {
                    if config.max_session_attempts.is_some_and(|max| attempts >= max) {
                        error!(attempts, "Giving up on session establishment");
                        return Err(SessionError::RetriesExhausted { attempts }.into());
                    }
                    warn!(
                        "Session attempt {} failed: {}, retrying in {:?}",
                        attempts,
                        e,
                        config.session_retry_delay()
                    );
                    platform.feed_watchdog();
                    platform.sleep(config.session_retry_delay());
                }
                Err(e) => {
                    error!("Session setup failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    pub fn request(
        &mut self,
        sequence: u32,
        size_exponent: SizeExponent,
    ) -> Result<RequestId, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        self.transport
            .send_chunk_request(session, sequence, size_exponent)
    }

    pub fn poll(&mut self, timeout: Duration) -> Result<Polled, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        self.transport.poll(session, timeout)
    }

    /// Total image size the peer announced, once known.
    pub fn declared_total(&self) -> Option<u64> {
        let session = self.session.as_ref()?;
        self.transport.declared_total(session)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Closing transfer session");
            self.transport.close_session(session);
        }
    }
}

impl<T: Transport> Drop for OpenSession<'_, T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Result of handling one session event.
#[derive(Debug)]
pub enum SessionStep {
    /// Keep waiting for the outstanding request.
    Continue,
    /// The terminal chunk was accepted.
    Complete,
    /// The transfer cannot continue.
    Abort(UpdateError),
}

/// Drives one transfer over an open session.
pub struct SessionManager<'a, T: Transport, K: ChunkSink> {
    session: OpenSession<'a, T>,
    sink: &'a mut K,
    control: &'a UpdateControl,
    outstanding: u32,
    size_exponent: SizeExponent,
    request_timeout: Duration,
    remaining: Duration,
    poll_slice: Duration,
    liveness_threshold: Duration,
    blocked: Duration,
    requests_sent: u32,
    total_announced: bool,
}

impl<'a, T: Transport, K: ChunkSink> SessionManager<'a, T, K> {
    /// Request chunk 0 and arm the deadline.
    pub fn start(
        session: OpenSession<'a, T>,
        sink: &'a mut K,
        config: &UpdateConfig,
        control: &'a UpdateControl,
    ) -> Result<Self, UpdateError> {
        let mut manager = Self {
            session,
            sink,
            control,
            outstanding: 0,
            size_exponent: config.block_size_exponent,
            request_timeout: config.request_timeout(),
            remaining: config.request_timeout(),
            poll_slice: config.poll_slice(),
            liveness_threshold: config.liveness_threshold(),
            blocked: Duration::ZERO,
            requests_sent: 0,
            total_announced: false,
        };
        manager.send_request()?;
        Ok(manager)
    }

    /// Sequence number of the outstanding request.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Size class used for the next request.
    pub fn size_exponent(&self) -> SizeExponent {
        self.size_exponent
    }

    pub fn requests_sent(&self) -> u32 {
        self.requests_sent
    }

    /// Time left before the outstanding request times out.
    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    fn send_request(&mut self) -> Result<(), TransportError> {
        self.control.set_state(SupervisorState::RequestingChunk);
        self.session.request(self.outstanding, self.size_exponent)?;
        self.requests_sent += 1;
        self.control.set_state(SupervisorState::AwaitingChunk);
        Ok(())
    }

    /// Handle an arrived chunk.
    pub fn on_chunk_received(&mut self, chunk: Chunk) -> SessionStep {
        let decision = match self.sink.on_chunk(&chunk) {
            Ok(decision) => decision,
            Err(e) => return SessionStep::Abort(e.into()),
        };

        match decision {
            Decision::Terminal => {
                info!(
                    chunks = self.outstanding + 1,
                    "Last chunk received, transfer complete"
                );
                SessionStep::Complete
            }
            Decision::Accept => {
                self.size_exponent = chunk.size_exponent;
                self.outstanding += 1;
                self.remaining = self.request_timeout;
                self.request_step()
            }
            Decision::Duplicate | Decision::OutOfOrder => {
                let expected = self.sink.expected_sequence();
                if let Some(anomaly) = decision.protocol_error(chunk.sequence, expected) {
                    if decision == Decision::Duplicate {
                        debug!("{}", anomaly);
                    } else {
                        warn!("{}", anomaly);
                    }
                }
                self.request_step()
            }
        }
    }

    /// Abort after the deadline ran out. Nothing more is requested.
    pub fn on_timeout(&mut self) -> SessionStep {
        error!(
            sequence = self.outstanding,
            "No chunk received within {:?}", self.request_timeout
        );
        SessionStep::Abort(UpdateError::Timeout {
            waited: self.request_timeout,
        })
    }

    fn request_step(&mut self) -> SessionStep {
        match self.send_request() {
            Ok(()) => SessionStep::Continue,
            Err(e) => SessionStep::Abort(e.into()),
        }
    }

    /// Poll until the terminal chunk is accepted or the transfer aborts.
    pub fn run<P: Platform>(&mut self, platform: &mut P) -> Result<(), UpdateError> {
        loop {
            if self.control.is_cancel_requested() {
                info!(sequence = self.outstanding, "Transfer cancelled");
                return Err(UpdateError::Cancelled);
            }

            let step = if self.remaining.is_zero() {
                self.on_timeout()
            } else {
                self.poll_once(platform)?
            };

            match step {
                SessionStep::Continue => {}
                SessionStep::Complete => return Ok(()),
                SessionStep::Abort(e) => return Err(e),
            }
        }
    }

    fn poll_once<P: Platform>(&mut self, platform: &mut P) -> Result<SessionStep, UpdateError> {
        let wait = self.remaining.min(self.poll_slice);
        let polled = self.session.poll(wait)?;

        // A poll that reports no blocking time is charged the full wait, so
        // stale chunks delivered back to back still drain the deadline.
        let charged = if polled.elapsed.is_zero() {
            wait
        } else {
            polled.elapsed
        };
        self.remaining = self.remaining.saturating_sub(charged);

        self.blocked += charged;
        if self.blocked >= self.liveness_threshold {
            platform.feed_watchdog();
            self.blocked = Duration::ZERO;
        }

        Ok(match polled.event {
            PollEvent::ChunkReceived(chunk) => match self.announce_total() {
                Ok(()) => self.on_chunk_received(chunk),
                Err(e) => SessionStep::Abort(e.into()),
            },
            PollEvent::NoEvent => SessionStep::Continue,
        })
    }

    /// Pass a total the peer announced to the sink, once.
    fn announce_total(&mut self) -> Result<(), FlashError> {
        if self.total_announced {
            return Ok(());
        }
        if let Some(total) = self.session.declared_total() {
            self.total_announced = true;
            debug!(total, "Sender announced image size");
            self.sink.on_declared_total(total)?;
        }
        Ok(())
    }

    /// Close the transport session.
    pub fn close(self) {
        self.session.close();
    }

    /// Abandon the transfer and release the transport session now.
    pub fn cancel(self) {
        info!(sequence = self.outstanding, "Transfer abandoned");
        self.session.close();
    }
}
