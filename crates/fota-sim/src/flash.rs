//! Two-slot OTA partition table held in memory.
//!
//! Writes are staged in the update handle and only become a bootable image
//! when the update is ended. Beginning an update erases the target slot, so
//! an aborted update leaves it empty and unselectable.

use std::collections::HashMap;

use fota_core::{BootStorage, CommitError, FlashError, PartitionHandle};
use tracing::{debug, info, warn};

const FIRST_SLOT_OFFSET: u32 = 0x10000;

/// Write state for one update.
pub struct FlashHandle {
    label: String,
    staged: Vec<u8>,
}

pub struct MemoryFlash {
    slots: [PartitionHandle; 2],
    images: HashMap<String, Vec<u8>>,
    running: usize,
    boot: usize,
    fail_write_at: Option<usize>,
    writes: usize,
    aborts: u32,
    boot_switches: Vec<PartitionHandle>,
    restarts: u32,
}

impl MemoryFlash {
    /// Two empty slots of `capacity` bytes, running from the first.
    pub fn new(capacity: u64) -> Self {
        let span = u32::try_from(capacity).unwrap_or(u32::MAX);
        Self {
            slots: [
                PartitionHandle::new("ota_0", FIRST_SLOT_OFFSET, capacity),
                PartitionHandle::new("ota_1", FIRST_SLOT_OFFSET.saturating_add(span), capacity),
            ],
            images: HashMap::new(),
            running: 0,
            boot: 0,
            fail_write_at: None,
            writes: 0,
            aborts: 0,
            boot_switches: Vec::new(),
            restarts: 0,
        }
    }

    pub fn with_running_image(mut self, image: &[u8]) -> Self {
        let label = self.slots[self.running].label.clone();
        self.images.insert(label, image.to_vec());
        self
    }

    /// Point the boot configuration at the other slot without running it.
    pub fn with_boot_drift(mut self) -> Self {
        self.boot = 1 - self.running;
        self
    }

    /// Fail the write call with this index (0 = first write).
    pub fn with_write_failure_at(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    pub fn image(&self, label: &str) -> Option<&[u8]> {
        self.images.get(label).map(Vec::as_slice)
    }

    pub fn running_image(&self) -> Option<&[u8]> {
        self.image(&self.slots[self.running].label)
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn aborts(&self) -> u32 {
        self.aborts
    }

    pub fn boot_switches(&self) -> &[PartitionHandle] {
        &self.boot_switches
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    fn slot_index(&self, partition: &PartitionHandle) -> Option<usize> {
        self.slots.iter().position(|slot| slot == partition)
    }
}

impl BootStorage for MemoryFlash {
    type Handle = FlashHandle;

    fn running_partition(&self) -> PartitionHandle {
        self.slots[self.running].clone()
    }

    fn boot_partition(&self) -> PartitionHandle {
        self.slots[self.boot].clone()
    }

    fn next_update_partition(&self) -> Option<PartitionHandle> {
        Some(self.slots[1 - self.running].clone())
    }

    fn begin_update(
        &mut self,
        target: &PartitionHandle,
        declared_size: Option<u64>,
    ) -> Result<FlashHandle, FlashError> {
        match self.slot_index(target) {
            Some(index) if index == self.running => {
                Err(FlashError::Begin(format!("{} is the running partition", target)))
            }
            Some(_) => {
                self.images.remove(&target.label);
                debug!(partition = %target, ?declared_size, "Slot erased");
                Ok(FlashHandle {
                    label: target.label.clone(),
                    staged: Vec::new(),
                })
            }
            None => Err(FlashError::Begin(format!("unknown partition {}", target))),
        }
    }

    fn write(&mut self, handle: &mut FlashHandle, bytes: &[u8]) -> Result<(), FlashError> {
        let index = self.writes;
        self.writes += 1;
        if self.fail_write_at == Some(index) {
            return Err(FlashError::Write {
                offset: handle.staged.len() as u64,
                reason: "flash program error".to_string(),
            });
        }
        handle.staged.extend_from_slice(bytes);
        Ok(())
    }

    fn end_update(&mut self, handle: FlashHandle) -> Result<(), FlashError> {
        if handle.staged.is_empty() {
            return Err(FlashError::End("image is empty".to_string()));
        }
        debug!(partition = %handle.label, bytes = handle.staged.len(), "Image validated");
        self.images.insert(handle.label, handle.staged);
        Ok(())
    }

    fn abort_update(&mut self, handle: FlashHandle) {
        self.aborts += 1;
        warn!(partition = %handle.label, "Update aborted, slot left erased");
    }

    fn images_identical(&self, a: &PartitionHandle, b: &PartitionHandle) -> bool {
        match (self.images.get(&a.label), self.images.get(&b.label)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn set_boot_partition(&mut self, partition: &PartitionHandle) -> Result<(), CommitError> {
        let index = self.slot_index(partition).ok_or_else(|| CommitError::SetBoot {
            partition: partition.label.clone(),
            reason: "unknown partition".to_string(),
        })?;
        if !self.images.contains_key(&partition.label) {
            return Err(CommitError::SetBoot {
                partition: partition.label.clone(),
                reason: "no valid image".to_string(),
            });
        }
        self.boot = index;
        self.boot_switches.push(partition.clone());
        Ok(())
    }

    fn restart_system(&mut self) {
        self.restarts += 1;
        self.running = self.boot;
        info!(running = %self.slots[self.running], "Simulated restart");
    }
}
