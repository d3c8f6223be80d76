//! Append-only writer for the candidate partition.
//!
//! [`FlashWriter`] owns the storage write handle for the lifetime of one
//! transfer. Every write is bounds-checked against the partition capacity
//! (and the declared image size, when known) before any byte reaches
//! storage. A writer that is dropped without [`FlashWriter::finish`] aborts
//! the update, so error and cancellation paths release the handle exactly
//! once and never leave a candidate that looks complete.

use tracing::{debug, warn};

use crate::error::FlashError;
use crate::model::PartitionHandle;
use crate::ports::BootStorage;

/// Byte offset into the candidate partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashWriteCursor {
    offset: u64,
    capacity: u64,
}

impl FlashWriteCursor {
    pub fn new(capacity: u64) -> Self {
        Self {
            offset: 0,
            capacity,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.offset
    }

    /// Cursor after appending `len` bytes, or the capacity violation.
    pub fn advance(self, len: u64) -> Result<Self, FlashError> {
        match self.offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(Self {
                offset: end,
                capacity: self.capacity,
            }),
            _ => Err(FlashError::CapacityExceeded {
                offset: self.offset,
                len,
                capacity: self.capacity,
            }),
        }
    }
}

/// A fully written and finalized candidate image.
///
/// Only [`FlashWriter::finish`] produces one, so a partition can only be
/// committed after its terminal chunk has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedImage {
    partition: PartitionHandle,
    size: u64,
}

impl CompletedImage {
    pub fn partition(&self) -> &PartitionHandle {
        &self.partition
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Append-only writer into one candidate partition.
pub struct FlashWriter<'s, S: BootStorage> {
    storage: &'s mut S,
    handle: Option<S::Handle>,
    partition: PartitionHandle,
    cursor: FlashWriteCursor,
    declared_size: Option<u64>,
}

impl<'s, S: BootStorage> FlashWriter<'s, S> {
    /// Open `partition` for writing.
    pub fn begin(
        storage: &'s mut S,
        partition: PartitionHandle,
        declared_size: Option<u64>,
    ) -> Result<Self, FlashError> {
        if let Some(declared) = declared_size {
            if declared > partition.capacity {
                return Err(FlashError::CapacityExceeded {
                    offset: 0,
                    len: declared,
                    capacity: partition.capacity,
                });
            }
        }

        let handle = storage.begin_update(&partition, declared_size)?;
        debug!(partition = %partition, ?declared_size, "Candidate partition opened");

        Ok(Self {
            storage,
            handle: Some(handle),
            cursor: FlashWriteCursor::new(partition.capacity),
            partition,
            declared_size,
        })
    }

    pub fn partition(&self) -> &PartitionHandle {
        &self.partition
    }

    pub fn cursor(&self) -> FlashWriteCursor {
        self.cursor
    }

    pub fn bytes_written(&self) -> u64 {
        self.cursor.offset()
    }

    /// Bound the image by a size announced once writing has started.
    pub fn declare_size(&mut self, total: u64) -> Result<(), FlashError> {
        match self.declared_size {
            Some(declared) if declared == total => return Ok(()),
            Some(declared) => {
                return Err(FlashError::SizeConflict {
                    declared,
                    announced: total,
                });
            }
            None => {}
        }
        if total > self.cursor.capacity() {
            return Err(FlashError::CapacityExceeded {
                offset: self.cursor.offset(),
                len: total,
                capacity: self.cursor.capacity(),
            });
        }
        if total < self.cursor.offset() {
            return Err(FlashError::SizeMismatch {
                declared: total,
                written: self.cursor.offset(),
            });
        }
        self.declared_size = Some(total);
        Ok(())
    }

    /// Append `payload` at the cursor and return the advanced cursor.
    ///
    /// Nothing is persisted when the payload would run past the partition
    /// capacity or the declared image size.
    pub fn write(&mut self, payload: &[u8]) -> Result<FlashWriteCursor, FlashError> {
        let len = payload.len() as u64;
        let next = self.cursor.advance(len)?;

        if let Some(declared) = self.declared_size {
            if next.offset() > declared {
                return Err(FlashError::DeclaredSizeExceeded {
                    offset: self.cursor.offset(),
                    len,
                    declared,
                });
            }
        }

        let handle = self.handle.as_mut().ok_or_else(|| FlashError::Write {
            offset: self.cursor.offset(),
            reason: "update handle already released".to_string(),
        })?;

        if !payload.is_empty() {
            self.storage.write(handle, payload)?;
        }
        self.cursor = next;
        Ok(next)
    }

    /// Finalize the image.
    pub fn finish(mut self) -> Result<CompletedImage, FlashError> {
        let written = self.cursor.offset();

        if let Some(declared) = self.declared_size {
            if written != declared {
                // Drop aborts the update.
                return Err(FlashError::SizeMismatch { declared, written });
            }
        }

        let handle = self
            .handle
            .take()
            .ok_or_else(|| FlashError::End("update handle already released".to_string()))?;
        self.storage.end_update(handle)?;

        Ok(CompletedImage {
            partition: self.partition.clone(),
            size: written,
        })
    }

    /// Abandon the partially written image.
    pub fn abort(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!(
                partition = %self.partition,
                bytes = self.cursor.offset(),
                "Aborting partially written update"
            );
            self.storage.abort_update(handle);
        }
    }
}

impl<S: BootStorage> Drop for FlashWriter<'_, S> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStorage;

    #[test]
    fn test_cursor_advances() {
        let cursor = FlashWriteCursor::new(10);
        let cursor = cursor.advance(4).unwrap();
        let cursor = cursor.advance(6).unwrap();
        assert_eq!(cursor.offset(), 10);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_cursor_rejects_overflow() {
        let cursor = FlashWriteCursor::new(10).advance(8).unwrap();
        assert_eq!(
            cursor.advance(4),
            Err(FlashError::CapacityExceeded {
                offset: 8,
                len: 4,
                capacity: 10
            })
        );
        assert!(FlashWriteCursor::new(10).advance(u64::MAX).is_err());
    }

    #[test]
    fn test_appends_in_order() {
        let mut storage = MemoryStorage::new(64);
        let candidate = storage.candidate();
        {
            let mut writer = FlashWriter::begin(&mut storage, candidate, None).unwrap();
            writer.write(b"abcd").unwrap();
            let cursor = writer.write(b"ef").unwrap();
            assert_eq!(cursor.offset(), 6);
            let image = writer.finish().unwrap();
            assert_eq!(image.size(), 6);
        }
        assert_eq!(storage.candidate_bytes(), b"abcdef");
        assert_eq!(storage.ended, 1);
        assert_eq!(storage.aborted, 0);
    }

    #[test]
    fn test_over_capacity_write_persists_nothing() {
        let mut storage = MemoryStorage::new(10);
        let candidate = storage.candidate();
        {
            let mut writer = FlashWriter::begin(&mut storage, candidate, None).unwrap();
            writer.write(&[1; 8]).unwrap();
            let err = writer.write(&[2; 4]).unwrap_err();
            assert!(matches!(err, FlashError::CapacityExceeded { .. }));
            assert_eq!(writer.bytes_written(), 8);
        }
        assert_eq!(storage.candidate_bytes(), vec![1; 8]);
        assert_eq!(storage.aborted, 1);
    }

    #[test]
    fn test_declared_size_bounds_writes() {
        let mut storage = MemoryStorage::new(64);
        let candidate = storage.candidate();
        let mut writer = FlashWriter::begin(&mut storage, candidate, Some(6)).unwrap();
        writer.write(b"abcd").unwrap();
        let err = writer.write(b"efgh").unwrap_err();
        assert!(matches!(err, FlashError::DeclaredSizeExceeded { declared: 6, .. }));
    }

    #[test]
    fn test_declared_size_larger_than_partition() {
        let mut storage = MemoryStorage::new(16);
        let candidate = storage.candidate();
        let result = FlashWriter::begin(&mut storage, candidate, Some(32));
        assert!(matches!(result, Err(FlashError::CapacityExceeded { .. })));
        drop(result);
        assert_eq!(storage.begun, 0);
    }

    #[test]
    fn test_announced_size_bounds_later_writes() {
        let mut storage = MemoryStorage::new(64);
        let candidate = storage.candidate();
        let mut writer = FlashWriter::begin(&mut storage, candidate, None).unwrap();
        writer.write(b"abcd").unwrap();

        writer.declare_size(6).unwrap();
        writer.declare_size(6).unwrap();
        assert!(matches!(
            writer.declare_size(8),
            Err(FlashError::SizeConflict {
                declared: 6,
                announced: 8
            })
        ));
        assert!(matches!(
            writer.write(b"efgh"),
            Err(FlashError::DeclaredSizeExceeded { declared: 6, .. })
        ));
    }

    #[test]
    fn test_announced_size_checked_against_partition() {
        let mut storage = MemoryStorage::new(16);
        let candidate = storage.candidate();
        let mut writer = FlashWriter::begin(&mut storage, candidate, None).unwrap();
        writer.write(b"abcdefgh").unwrap();

        assert!(matches!(
            writer.declare_size(32),
            Err(FlashError::CapacityExceeded { len: 32, capacity: 16, .. })
        ));
        assert!(matches!(
            writer.declare_size(4),
            Err(FlashError::SizeMismatch { declared: 4, written: 8 })
        ));
    }

    #[test]
    fn test_short_image_rejected_at_finish() {
        let mut storage = MemoryStorage::new(64);
        let candidate = storage.candidate();
        {
            let mut writer = FlashWriter::begin(&mut storage, candidate, Some(8)).unwrap();
            writer.write(b"abcd").unwrap();
            assert_eq!(
                writer.finish(),
                Err(FlashError::SizeMismatch {
                    declared: 8,
                    written: 4
                })
            );
        }
        assert_eq!(storage.ended, 0);
        assert_eq!(storage.aborted, 1);
    }

    #[test]
    fn test_storage_write_failure_keeps_cursor() {
        let mut storage = MemoryStorage::new(64);
        storage.fail_write_at = Some(1);
        let candidate = storage.candidate();
        let mut writer = FlashWriter::begin(&mut storage, candidate, None).unwrap();
        writer.write(b"abcd").unwrap();
        assert!(matches!(writer.write(b"efgh"), Err(FlashError::Write { .. })));
        assert_eq!(writer.bytes_written(), 4);
    }

    #[test]
    fn test_drop_releases_once() {
        let mut storage = MemoryStorage::new(64);
        let candidate = storage.candidate();
        {
            let mut writer = FlashWriter::begin(&mut storage, candidate, None).unwrap();
            writer.write(b"ab").unwrap();
            writer.abort();
        }
        assert_eq!(storage.aborted, 1);
        assert_eq!(storage.ended, 0);
    }
}
