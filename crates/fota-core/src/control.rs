//! Shared state between the update task and the host.
//!
//! The update task owns the transfer; the host only ever sees it through an
//! [`UpdateControl`]: a cancel flag it can raise and the status and state
//! snapshots the task publishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{SupervisorState, UpdateStatus};

#[derive(Debug, Default)]
struct Inner {
    cancel: AtomicBool,
    status: Mutex<UpdateStatus>,
    state: Mutex<SupervisorState>,
}

/// Cloneable handle to the update task's published state.
#[derive(Debug, Clone, Default)]
pub struct UpdateControl {
    inner: Arc<Inner>,
}

impl UpdateControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running transfer to stop at its next check point.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_cancel(&self) {
        self.inner.cancel.store(false, Ordering::SeqCst);
    }

    pub fn status(&self) -> UpdateStatus {
        self.inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_status(&self, status: UpdateStatus) {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn state(&self) -> SupervisorState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: SupervisorState) {
        let mut current = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            tracing::trace!(from = ?*current, to = ?state, "Supervisor state change");
            *current = state;
        }
    }
}
