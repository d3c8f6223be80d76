//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::{CommitError, FlashError, SessionError, TransportError};
use crate::model::{Chunk, PartitionHandle, SizeExponent};
use crate::ports::{BootStorage, Platform, Polled, RequestId, Transport};

/// Cut chunk `sequence` out of `image` at the given size class.
pub fn image_chunk(image: &[u8], sequence: u32, szx: SizeExponent) -> Chunk {
    let block = szx.block_size();
    let start = (sequence as usize * block).min(image.len());
    let end = (start + block).min(image.len());
    Chunk::new(sequence, image[start..end].to_vec(), end < image.len(), szx)
}

pub struct MemoryStorage {
    pub running: PartitionHandle,
    pub boot: PartitionHandle,
    pub next: Option<PartitionHandle>,
    pub images: HashMap<String, Vec<u8>>,
    pub begun: u32,
    pub ended: u32,
    pub aborted: u32,
    pub writes: usize,
    pub fail_write_at: Option<usize>,
    pub fail_set_boot: bool,
    pub boot_switches: Vec<PartitionHandle>,
    pub restarts: u32,
}

impl MemoryStorage {
    pub fn new(capacity: u64) -> Self {
        let running = PartitionHandle::new("ota_0", 0x10000, capacity);
        let candidate = PartitionHandle::new("ota_1", 0x10000 + capacity as u32, capacity);
        Self {
            boot: running.clone(),
            running,
            next: Some(candidate),
            images: HashMap::new(),
            begun: 0,
            ended: 0,
            aborted: 0,
            writes: 0,
            fail_write_at: None,
            fail_set_boot: false,
            boot_switches: Vec::new(),
            restarts: 0,
        }
    }

    pub fn with_running_image(mut self, image: &[u8]) -> Self {
        self.images
            .insert(self.running.label.clone(), image.to_vec());
        self
    }

    pub fn candidate(&self) -> PartitionHandle {
        self.next.clone().expect("test storage has no candidate")
    }

    pub fn candidate_bytes(&self) -> Vec<u8> {
        self.images
            .get(&self.candidate().label)
            .cloned()
            .unwrap_or_default()
    }
}

impl BootStorage for MemoryStorage {
    type Handle = String;

    fn running_partition(&self) -> PartitionHandle {
        self.running.clone()
    }

    fn boot_partition(&self) -> PartitionHandle {
        self.boot.clone()
    }

    fn next_update_partition(&self) -> Option<PartitionHandle> {
        self.next.clone()
    }

    fn begin_update(
        &mut self,
        target: &PartitionHandle,
        _declared_size: Option<u64>,
    ) -> Result<String, FlashError> {
        self.begun += 1;
        self.images.insert(target.label.clone(), Vec::new());
        Ok(target.label.clone())
    }

    fn write(&mut self, handle: &mut String, bytes: &[u8]) -> Result<(), FlashError> {
        let index = self.writes;
        self.writes += 1;
        if self.fail_write_at == Some(index) {
            return Err(FlashError::Write {
                offset: 0,
                reason: "injected".to_string(),
            });
        }
        self.images
            .entry(handle.clone())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn end_update(&mut self, _handle: String) -> Result<(), FlashError> {
        self.ended += 1;
        Ok(())
    }

    fn abort_update(&mut self, _handle: String) {
        self.aborted += 1;
    }

    fn images_identical(&self, a: &PartitionHandle, b: &PartitionHandle) -> bool {
        match (self.images.get(&a.label), self.images.get(&b.label)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn set_boot_partition(&mut self, partition: &PartitionHandle) -> Result<(), CommitError> {
        if self.fail_set_boot {
            return Err(CommitError::SetBoot {
                partition: partition.label.clone(),
                reason: "injected".to_string(),
            });
        }
        self.boot_switches.push(partition.clone());
        self.boot = partition.clone();
        Ok(())
    }

    fn restart_system(&mut self) {
        self.restarts += 1;
    }
}

/// Transport that replays scripted poll results, then serves `image` in
/// answer to the most recent request.
#[derive(Default)]
pub struct ScriptedTransport {
    pub open_results: VecDeque<Result<(), SessionError>>,
    pub polls: VecDeque<Result<Polled, TransportError>>,
    pub image: Option<Vec<u8>>,
    pub fail_send: Option<u32>,
    pub announced_total: Option<u64>,
    pub requests: Vec<(u32, SizeExponent)>,
    pub opened: u32,
    pub closed: u32,
    pending: Option<(u32, SizeExponent)>,
}

impl ScriptedTransport {
    pub fn serving(image: &[u8]) -> Self {
        Self {
            image: Some(image.to_vec()),
            ..Default::default()
        }
    }

    pub fn requested_sequences(&self) -> Vec<u32> {
        self.requests.iter().map(|(seq, _)| *seq).collect()
    }
}

impl Transport for ScriptedTransport {
    type Session = u32;

    fn open_session(&mut self, _destination: &str) -> Result<u32, SessionError> {
        if let Some(result) = self.open_results.pop_front() {
            result?;
        }
        self.opened += 1;
        Ok(self.opened)
    }

    fn send_chunk_request(
        &mut self,
        _session: &mut u32,
        sequence: u32,
        size_exponent: SizeExponent,
    ) -> Result<RequestId, TransportError> {
        if self.fail_send == Some(sequence) {
            return Err(TransportError::Send {
                sequence,
                reason: "injected".to_string(),
            });
        }
        self.requests.push((sequence, size_exponent));
        self.pending = Some((sequence, size_exponent));
        Ok(RequestId(self.requests.len() as u32))
    }

    fn poll(&mut self, _session: &mut u32, timeout: Duration) -> Result<Polled, TransportError> {
        if let Some(scripted) = self.polls.pop_front() {
            return scripted;
        }
        match (&self.image, self.pending.take()) {
            (Some(image), Some((sequence, szx))) => Ok(Polled::chunk(
                image_chunk(image, sequence, szx),
                Duration::from_millis(1),
            )),
            _ => Ok(Polled::idle(timeout)),
        }
    }

    fn declared_total(&self, _session: &u32) -> Option<u64> {
        self.announced_total
    }

    fn close_session(&mut self, _session: u32) {
        self.closed += 1;
    }
}

#[derive(Default)]
pub struct TestPlatform {
    pub sleeps: Vec<Duration>,
    pub watchdog_feeds: u32,
}

impl Platform for TestPlatform {
    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }

    fn feed_watchdog(&mut self) {
        self.watchdog_feeds += 1;
    }
}
