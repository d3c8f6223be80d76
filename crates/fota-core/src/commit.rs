//! Partition commit.
//!
//! After the terminal chunk has been written and the image finalized, the
//! candidate is compared with the running image. An identical image is left
//! alone: no boot switch, no restart. Otherwise the candidate becomes the
//! boot partition and the system restarts into it.

use tracing::{error, info};

use crate::control::UpdateControl;
use crate::error::CommitError;
use crate::flash::CompletedImage;
use crate::model::{PartitionHandle, SupervisorState, UpdateStatus};
use crate::ports::BootStorage;

/// What the commit step did with a completed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The image matches the running one; nothing was changed.
    Redundant,
    /// The boot partition was switched and a restart was requested.
    Restarting,
}

/// Commit `image` or detect that it is already running.
pub fn finalize<S: BootStorage>(
    storage: &mut S,
    image: CompletedImage,
    running: &PartitionHandle,
    control: &UpdateControl,
) -> Result<CommitOutcome, CommitError> {
    let candidate = image.partition();

    if storage.images_identical(candidate, running) {
        info!(
            running = %running,
            "Downloaded image is identical to the running image, not switching"
        );
        return Ok(CommitOutcome::Redundant);
    }

    if let Err(e) = storage.set_boot_partition(candidate) {
        error!("Failed to select {} as boot partition: {}", candidate, e);
        return Err(e);
    }

    info!(
        partition = %candidate,
        size = image.size(),
        "Boot partition switched, restarting"
    );
    control.set_status(UpdateStatus::Succeeded);
    control.set_state(SupervisorState::Restarting);
    storage.restart_system();

    Ok(CommitOutcome::Restarting)
}
