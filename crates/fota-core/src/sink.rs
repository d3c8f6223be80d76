//! Validate-then-write bridge between the session loop and flash.

use tracing::debug;

use crate::control::UpdateControl;
use crate::error::FlashError;
use crate::flash::FlashWriter;
use crate::model::{Chunk, SupervisorState, UpdateSession};
use crate::ports::BootStorage;
use crate::session::ChunkSink;
use crate::validator::{validate, Decision};

/// Writes accepted chunks into the candidate partition and publishes progress.
pub struct ImageSink<'a, S: BootStorage> {
    session: &'a mut UpdateSession,
    writer: FlashWriter<'a, S>,
    control: &'a UpdateControl,
}

impl<'a, S: BootStorage> ImageSink<'a, S> {
    pub fn new(
        session: &'a mut UpdateSession,
        writer: FlashWriter<'a, S>,
        control: &'a UpdateControl,
    ) -> Self {
        Self {
            session,
            writer,
            control,
        }
    }

    pub fn session(&self) -> &UpdateSession {
        self.session
    }

    /// Hand the writer back for finalization.
    pub fn into_writer(self) -> FlashWriter<'a, S> {
        self.writer
    }
}

impl<S: BootStorage> ChunkSink for ImageSink<'_, S> {
    fn on_chunk(&mut self, chunk: &Chunk) -> Result<Decision, FlashError> {
        let decision = validate(chunk, self.session);
        if !decision.is_accepted() {
            return Ok(decision);
        }

        self.control.set_state(SupervisorState::Writing);
        let cursor = self.writer.write(&chunk.payload)?;
        self.session.record_accepted(chunk.len() as u64);
        self.control.set_status(self.session.progress());

        debug!(
            sequence = chunk.sequence,
            len = chunk.len(),
            offset = cursor.offset(),
            "Chunk written"
        );
        Ok(decision)
    }

    fn expected_sequence(&self) -> u32 {
        self.session.next_expected_sequence()
    }

    fn on_declared_total(&mut self, total: u64) -> Result<(), FlashError> {
        self.writer.declare_size(total)?;
        self.session.set_declared_total_size(total);
        self.control.set_status(self.session.progress());
        Ok(())
    }
}
