//! OTA partition access through ESP-IDF.
//!
//! Partitions are addressed by label. The partition table lives in flash
//! for the lifetime of the program, so every call looks its entry up again
//! instead of holding raw pointers across threads.

use std::ffi::{CStr, CString};

use anyhow::{anyhow, Result};
use esp_idf_svc::sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_boot_partition,
    esp_ota_get_next_update_partition, esp_ota_get_running_partition, esp_ota_handle_t,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_check_identity,
    esp_partition_find_first, esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, esp_restart, EspError, OTA_SIZE_UNKNOWN,
};
use fota_core::{BootStorage, CommitError, FlashError, PartitionHandle};
use log::{info, warn};

/// Open `esp_ota_*` write session for one partition.
#[derive(Debug)]
pub struct EspOtaHandle {
    handle: esp_ota_handle_t,
    label: String,
    written: u64,
}

/// Boot storage backed by the device's OTA partition table.
#[derive(Debug)]
pub struct EspBootStorage {
    running: PartitionHandle,
}

impl EspBootStorage {
    /// Look up the running partition and log where the firmware booted from.
    pub fn new() -> Result<Self> {
        let running = unsafe { esp_ota_get_running_partition() };
        let running = describe(running).ok_or_else(|| anyhow!("No running partition"))?;
        info!(
            "Running partition {} (offset 0x{:08x}, {} bytes)",
            running.label, running.offset, running.capacity
        );
        Ok(Self { running })
    }

    fn lookup(partition: &PartitionHandle) -> Option<*const esp_partition_t> {
        let label = CString::new(partition.label.as_str()).ok()?;
        let found = unsafe {
            esp_partition_find_first(
                esp_partition_type_t_ESP_PARTITION_TYPE_APP,
                esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
                label.as_ptr(),
            )
        };
        let found_handle = describe(found)?;
        (found_handle == *partition).then_some(found)
    }
}

/// Convert a partition table entry into a handle. `None` for a null entry.
fn describe(partition: *const esp_partition_t) -> Option<PartitionHandle> {
    // SAFETY: non-null entries point into the partition table, which is
    // loaded once and never freed.
    let partition = unsafe { partition.as_ref() }?;
    let label = unsafe { CStr::from_ptr(partition.label.as_ptr()) };
    Some(PartitionHandle::new(
        &label.to_string_lossy(),
        partition.address,
        u64::from(partition.size),
    ))
}

fn reason(err: EspError) -> String {
    err.to_string()
}

impl BootStorage for EspBootStorage {
    type Handle = EspOtaHandle;

    fn running_partition(&self) -> PartitionHandle {
        self.running.clone()
    }

    fn boot_partition(&self) -> PartitionHandle {
        describe(unsafe { esp_ota_get_boot_partition() }).unwrap_or_else(|| self.running.clone())
    }

    fn next_update_partition(&self) -> Option<PartitionHandle> {
        describe(unsafe { esp_ota_get_next_update_partition(core::ptr::null()) })
    }

    fn begin_update(
        &mut self,
        target: &PartitionHandle,
        declared_size: Option<u64>,
    ) -> Result<EspOtaHandle, FlashError> {
        let partition = Self::lookup(target)
            .ok_or_else(|| FlashError::Begin(format!("partition {} not found", target)))?;
        let image_size = match declared_size {
            Some(size) => usize::try_from(size)
                .map_err(|_| FlashError::Begin(format!("image size {} too large", size)))?,
            None => OTA_SIZE_UNKNOWN as usize,
        };

        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(partition, image_size, &mut handle) })
            .map_err(|e| FlashError::Begin(reason(e)))?;
        info!("Writing to partition {}", target);

        Ok(EspOtaHandle {
            handle,
            label: target.label.clone(),
            written: 0,
        })
    }

    fn write(&mut self, handle: &mut EspOtaHandle, bytes: &[u8]) -> Result<(), FlashError> {
        esp!(unsafe { esp_ota_write(handle.handle, bytes.as_ptr().cast(), bytes.len()) })
            .map_err(|e| FlashError::Write {
                offset: handle.written,
                reason: reason(e),
            })?;
        handle.written += bytes.len() as u64;
        Ok(())
    }

    fn end_update(&mut self, handle: EspOtaHandle) -> Result<(), FlashError> {
        // esp_ota_end releases the handle whether or not validation passes.
        esp!(unsafe { esp_ota_end(handle.handle) }).map_err(|e| FlashError::End(reason(e)))
    }

    fn abort_update(&mut self, handle: EspOtaHandle) {
        if let Err(e) = esp!(unsafe { esp_ota_abort(handle.handle) }) {
            warn!("Failed to abort update of {}: {}", handle.label, e);
        }
    }

    fn images_identical(&self, a: &PartitionHandle, b: &PartitionHandle) -> bool {
        match (Self::lookup(a), Self::lookup(b)) {
            (Some(a), Some(b)) => unsafe { esp_partition_check_identity(a, b) },
            _ => false,
        }
    }

    fn set_boot_partition(&mut self, partition: &PartitionHandle) -> Result<(), CommitError> {
        let found = Self::lookup(partition).ok_or_else(|| CommitError::SetBoot {
            partition: partition.label.clone(),
            reason: "partition not found".to_string(),
        })?;
        esp!(unsafe { esp_ota_set_boot_partition(found) }).map_err(|e| CommitError::SetBoot {
            partition: partition.label.clone(),
            reason: reason(e),
        })
    }

    fn restart_system(&mut self) {
        info!("Restarting system");
        unsafe { esp_restart() }
    }
}
