//! Update supervisor.
//!
//! [`UpdateEngine`] runs one retrieve-then-commit update to completion on
//! the calling thread. [`UpdateSupervisor`] wraps it in a single background
//! task and gives the host a start / cancel / status interface.
//!
//! State flow:
//! ```text
//! Idle -> Connecting -> RequestingChunk -> AwaitingChunk -> Writing
//!      -> (RequestingChunk | Committing) -> Restarting
//! ```
//! `Failed` is reachable from every step and is terminal for the task
//! instance. An identical image ends in `Redundant`, which waits for the next
//! trigger instead of restarting.

use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::commit::{finalize, CommitOutcome};
use crate::config::{ConfigError, UpdateConfig};
use crate::control::UpdateControl;
use crate::error::{FlashError, SupervisorError, UpdateError};
use crate::flash::FlashWriter;
use crate::model::{
    FailureReason, SupervisorState, TriggerContext, UpdateSession, UpdateStatus,
};
use crate::ports::{BootStorage, Platform, Transport};
use crate::session::{OpenSession, SessionManager};
use crate::sink::ImageSink;

/// The update pipeline and the collaborators it drives.
pub struct UpdateEngine<T, S, P> {
    transport: T,
    storage: S,
    platform: P,
    config: UpdateConfig,
}

impl<T: Transport, S: BootStorage, P: Platform> UpdateEngine<T, S, P> {
    pub fn new(transport: T, storage: S, platform: P, config: UpdateConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            transport,
            storage,
            platform,
            config,
        })
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn into_parts(self) -> (T, S, P) {
        (self.transport, self.storage, self.platform)
    }

    /// Run one update and publish its outcome through `control`.
    pub fn run(&mut self, trigger: &TriggerContext, control: &UpdateControl) -> UpdateStatus {
        info!(source = ?trigger.source, declared_size = ?trigger.declared_size, "Update triggered");
        control.set_status(UpdateStatus::InProgress {
            bytes_written: 0,
            total: trigger.declared_size,
        });

        let status = match self.transfer(trigger, control) {
            Ok(CommitOutcome::Restarting) => UpdateStatus::Succeeded,
            Ok(CommitOutcome::Redundant) => {
                control.set_state(SupervisorState::Redundant);
                UpdateStatus::RedundantImage
            }
            Err(UpdateError::Cancelled) => {
                info!("Update cancelled, resources released");
                control.set_state(SupervisorState::Idle);
                UpdateStatus::Idle
            }
            Err(e) => {
                error!("Update failed: {}", e);
                control.set_state(SupervisorState::Failed);
                let reason = e
                    .reason()
                    .unwrap_or_else(|| FailureReason::Task(e.to_string()));
                UpdateStatus::Failed { reason }
            }
        };

        control.set_status(status.clone());
        status
    }

    fn transfer(
        &mut self,
        trigger: &TriggerContext,
        control: &UpdateControl,
    ) -> Result<CommitOutcome, UpdateError> {
        let running = self.storage.running_partition();
        let configured = self.storage.boot_partition();
        if configured != running {
            warn!(
                "Configured boot partition {} differs from running partition {}",
                configured, running
            );
        }
        info!(running = %running, "Running partition");

        let candidate = self
            .storage
            .next_update_partition()
            .ok_or(FlashError::NoUpdatePartition)?;
        info!(candidate = %candidate, "Writing to partition");

        let open = OpenSession::establish(&mut self.transport, &mut self.platform, &self.config, control)?;

        let mut session = UpdateSession::new(
            candidate.clone(),
            trigger.declared_size,
            self.config.request_timeout(),
        );
        let writer = FlashWriter::begin(&mut self.storage, candidate, trigger.declared_size)?;
        let mut sink = ImageSink::new(&mut session, writer, control);

        let mut manager = SessionManager::start(open, &mut sink, &self.config, control)?;
        manager.run(&mut self.platform)?;
        manager.close();

        control.set_state(SupervisorState::Committing);
        let image = sink.into_writer().finish()?;
        info!(bytes = image.size(), "Image written to {}", image.partition());

        Ok(finalize(&mut self.storage, image, &running, control)?)
    }
}

/// Host-facing handle that runs the engine on a background task.
pub struct UpdateSupervisor<T, S, P> {
    engine: Option<UpdateEngine<T, S, P>>,
    task: Option<JoinHandle<UpdateEngine<T, S, P>>>,
    control: UpdateControl,
}

impl<T, S, P> UpdateSupervisor<T, S, P>
where
    T: Transport + Send + 'static,
    S: BootStorage + Send + 'static,
    P: Platform + Send + 'static,
{
    pub fn new(engine: UpdateEngine<T, S, P>) -> Self {
        Self {
            engine: Some(engine),
            task: None,
            control: UpdateControl::new(),
        }
    }

    /// Shared handle for status readers on other threads.
    pub fn control(&self) -> UpdateControl {
        self.control.clone()
    }

    pub fn status(&self) -> UpdateStatus {
        self.control.status()
    }

    pub fn state(&self) -> SupervisorState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// The engine, when no task currently owns it.
    pub fn engine(&self) -> Option<&UpdateEngine<T, S, P>> {
        self.engine.as_ref()
    }

    /// Start an update on the background task.
    pub fn start_update(&mut self, trigger: TriggerContext) -> Result<(), SupervisorError> {
        self.reap();

        if self.task.is_some() {
            return Err(SupervisorError::Busy);
        }
        match self.control.status() {
            UpdateStatus::Failed { reason } => return Err(SupervisorError::TaskFailed(reason)),
            UpdateStatus::Succeeded => return Err(SupervisorError::AlreadyCommitted),
            _ => {}
        }

        let mut engine = self.engine.take().ok_or_else(|| {
            SupervisorError::TaskFailed(FailureReason::Task("update engine lost".to_string()))
        })?;

        self.control.clear_cancel();
        self.control.set_status(UpdateStatus::InProgress {
            bytes_written: 0,
            total: trigger.declared_size,
        });

        let control = self.control.clone();
        let spawned = thread::Builder::new()
            .name("fota-update".to_string())
            .spawn(move || {
                engine.run(&trigger, &control);
                engine
            });

        match spawned {
            Ok(task) => {
                self.task = Some(task);
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn update task: {}", e);
                self.control.set_state(SupervisorState::Failed);
                self.control.set_status(UpdateStatus::Failed {
                    reason: FailureReason::Task(e.to_string()),
                });
                Err(SupervisorError::Spawn(e.to_string()))
            }
        }
    }

    /// Ask the running update to stop. Returns whether a task was running.
    pub fn cancel_update(&self) -> bool {
        if self.is_running() {
            info!("Cancelling update");
            self.control.cancel();
            true
        } else {
            false
        }
    }

    /// Block until the running task finishes and return its final status.
    pub fn wait(&mut self) -> Result<UpdateStatus, SupervisorError> {
        let task = self.task.take().ok_or(SupervisorError::NotRunning)?;
        self.join(task)
    }

    fn reap(&mut self) {
        if self.task.as_ref().is_some_and(|task| task.is_finished()) {
            if let Some(task) = self.task.take() {
                // A panic is recorded in the published status.
                let _ = self.join(task);
            }
        }
    }

    fn join(
        &mut self,
        task: JoinHandle<UpdateEngine<T, S, P>>,
    ) -> Result<UpdateStatus, SupervisorError> {
        match task.join() {
            Ok(engine) => {
                self.engine = Some(engine);
                Ok(self.control.status())
            }
            Err(_) => {
                error!("Update task panicked");
                self.control.set_state(SupervisorState::Failed);
                self.control.set_status(UpdateStatus::Failed {
                    reason: FailureReason::Task("update task panicked".to_string()),
                });
                Err(SupervisorError::TaskPanicked)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SessionError, TransportError};
    use crate::model::{PartitionHandle, SizeExponent};
    use crate::ports::Polled;
    use crate::testing::{MemoryStorage, ScriptedTransport, TestPlatform};
    use pretty_assertions::assert_eq;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::time::Duration;

    type TestEngine = UpdateEngine<ScriptedTransport, MemoryStorage, TestPlatform>;

    fn config() -> UpdateConfig {
        let mut config = UpdateConfig::new("coap://fw.local/app.bin");
        config.block_size_exponent = SizeExponent::new(0).unwrap();
        config
    }

    fn engine(transport: ScriptedTransport, storage: MemoryStorage) -> TestEngine {
        UpdateEngine::new(transport, storage, TestPlatform::default(), config()).unwrap()
    }

    fn image(len: u8) -> Vec<u8> {
        (0..len).collect()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = UpdateEngine::new(
            ScriptedTransport::default(),
            MemoryStorage::new(64),
            TestPlatform::default(),
            UpdateConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_engine_commits_new_image() {
        let new_image = image(40);
        let storage = MemoryStorage::new(256).with_running_image(b"old firmware");
        let mut engine = engine(ScriptedTransport::serving(&new_image), storage);
        let control = UpdateControl::new();

        let status = engine.run(&TriggerContext::button(), &control);

        assert_eq!(status, UpdateStatus::Succeeded);
        assert_eq!(control.state(), SupervisorState::Restarting);
        let storage = engine.storage();
        assert_eq!(storage.candidate_bytes(), new_image);
        assert_eq!(storage.boot_switches.len(), 1);
        assert_eq!(storage.restarts, 1);
        assert_eq!(engine.transport().closed, 1);
    }

    #[test]
    fn test_engine_redundant_image() {
        let same = image(40);
        let storage = MemoryStorage::new(256).with_running_image(&same);
        let mut engine = engine(ScriptedTransport::serving(&same), storage);
        let control = UpdateControl::new();

        let status = engine.run(&TriggerContext::button(), &control);

        assert_eq!(status, UpdateStatus::RedundantImage);
        assert_eq!(control.state(), SupervisorState::Redundant);
        assert!(engine.storage().boot_switches.is_empty());
        assert_eq!(engine.storage().restarts, 0);
    }

    #[test]
    fn test_engine_without_update_partition() {
        let mut storage = MemoryStorage::new(256);
        storage.next = None;
        let mut engine = engine(ScriptedTransport::serving(&image(40)), storage);
        let control = UpdateControl::new();

        let status = engine.run(&TriggerContext::button(), &control);

        assert_eq!(
            status,
            UpdateStatus::Failed {
                reason: FailureReason::Flash("No update partition available".to_string())
            }
        );
        assert_eq!(engine.transport().opened, 0);
    }

    #[test]
    fn test_engine_capacity_failure_aborts_flash() {
        let storage = MemoryStorage::new(32);
        let mut engine = engine(ScriptedTransport::serving(&image(40)), storage);
        let control = UpdateControl::new();

        let status = engine.run(&TriggerContext::button(), &control);

        assert!(matches!(
            status,
            UpdateStatus::Failed {
                reason: FailureReason::Flash(_)
            }
        ));
        assert_eq!(control.state(), SupervisorState::Failed);
        let storage = engine.storage();
        assert_eq!(storage.candidate_bytes().len(), 32);
        assert_eq!(storage.aborted, 1);
        assert_eq!(storage.restarts, 0);
        assert_eq!(engine.transport().closed, 1);
    }

    #[test]
    fn test_engine_short_image_against_declared_size() {
        let storage = MemoryStorage::new(256).with_running_image(b"old");
        let mut engine = engine(ScriptedTransport::serving(&image(40)), storage);
        let control = UpdateControl::new();

        let status = engine.run(&TriggerContext::button().with_declared_size(48), &control);

        match status {
            UpdateStatus::Failed {
                reason: FailureReason::Flash(msg),
            } => assert!(msg.contains("declared 48")),
            other => panic!("Expected flash failure, got {:?}", other),
        }
        assert_eq!(engine.storage().aborted, 1);
        assert!(engine.storage().boot_switches.is_empty());
    }

    #[test]
    fn test_engine_transport_error_does_not_commit() {
        let mut transport = ScriptedTransport::default();
        transport.polls.push_back(Err(TransportError::Poll("socket reset".to_string())));
        let storage = MemoryStorage::new(256).with_running_image(b"old");
        let mut engine = engine(transport, storage);
        let control = UpdateControl::new();

        let status = engine.run(&TriggerContext::button(), &control);

        assert!(matches!(
            status,
            UpdateStatus::Failed {
                reason: FailureReason::Transport(_)
            }
        ));
        assert!(engine.storage().boot_switches.is_empty());
    }

    #[test]
    fn test_engine_cancel_returns_to_idle() {
        let storage = MemoryStorage::new(256);
        let mut engine = engine(ScriptedTransport::serving(&image(40)), storage);
        let control = UpdateControl::new();
        control.cancel();

        let status = engine.run(&TriggerContext::button(), &control);

        assert_eq!(status, UpdateStatus::Idle);
        assert_eq!(control.status(), UpdateStatus::Idle);
        assert_eq!(control.state(), SupervisorState::Idle);
        assert_eq!(engine.transport().opened, 0);
    }

    #[test]
    fn test_engine_drift_is_not_fatal() {
        let mut storage = MemoryStorage::new(256).with_running_image(b"old");
        storage.boot = PartitionHandle::new("ota_1", 0x20000, 256);
        let mut engine = engine(ScriptedTransport::serving(&image(40)), storage);
        let control = UpdateControl::new();

        assert_eq!(
            engine.run(&TriggerContext::button(), &control),
            UpdateStatus::Succeeded
        );
    }

    #[test]
    fn test_supervisor_success_then_already_committed() {
        let storage = MemoryStorage::new(256).with_running_image(b"old");
        let mut supervisor = UpdateSupervisor::new(engine(ScriptedTransport::serving(&image(40)), storage));

        supervisor.start_update(TriggerContext::button()).unwrap();
        assert_eq!(supervisor.wait(), Ok(UpdateStatus::Succeeded));
        assert_eq!(supervisor.status(), UpdateStatus::Succeeded);

        assert_eq!(
            supervisor.start_update(TriggerContext::button()),
            Err(SupervisorError::AlreadyCommitted)
        );
    }

    #[test]
    fn test_supervisor_failed_task_refuses_restart() {
        let mut transport = ScriptedTransport::default();
        transport
            .open_results
            .push_back(Err(SessionError::Unsupported("coap+tcp".to_string())));
        let mut supervisor = UpdateSupervisor::new(engine(transport, MemoryStorage::new(256)));

        supervisor.start_update(TriggerContext::button()).unwrap();
        let status = supervisor.wait().unwrap();
        assert!(matches!(status, UpdateStatus::Failed { .. }));

        assert!(matches!(
            supervisor.start_update(TriggerContext::button()),
            Err(SupervisorError::TaskFailed(FailureReason::Session(_)))
        ));
    }

    #[test]
    fn test_supervisor_redundant_allows_new_trigger() {
        let same = image(40);
        let storage = MemoryStorage::new(256).with_running_image(&same);
        let mut supervisor = UpdateSupervisor::new(engine(ScriptedTransport::serving(&same), storage));

        supervisor.start_update(TriggerContext::button()).unwrap();
        assert_eq!(supervisor.wait(), Ok(UpdateStatus::RedundantImage));
        assert_eq!(supervisor.state(), SupervisorState::Redundant);

        supervisor.start_update(TriggerContext::button()).unwrap();
        assert_eq!(supervisor.wait(), Ok(UpdateStatus::RedundantImage));
    }

    #[test]
    fn test_wait_without_task() {
        let mut supervisor = UpdateSupervisor::new(engine(
            ScriptedTransport::default(),
            MemoryStorage::new(256),
        ));
        assert_eq!(supervisor.wait(), Err(SupervisorError::NotRunning));
        assert!(!supervisor.cancel_update());
    }

    /// Transport whose session setup blocks until the test releases it.
    struct GatedTransport {
        gate: Receiver<()>,
        inner: ScriptedTransport,
    }

    impl Transport for GatedTransport {
        type Session = u32;

        fn open_session(&mut self, destination: &str) -> Result<u32, SessionError> {
            self.gate
                .recv()
                .map_err(|_| SessionError::Failed("gate dropped".to_string()))?;
            self.inner.open_session(destination)
        }

        fn send_chunk_request(
            &mut self,
            session: &mut u32,
            sequence: u32,
            size_exponent: SizeExponent,
        ) -> Result<crate::ports::RequestId, TransportError> {
            self.inner.send_chunk_request(session, sequence, size_exponent)
        }

        fn poll(&mut self, session: &mut u32, timeout: Duration) -> Result<Polled, TransportError> {
            self.inner.poll(session, timeout)
        }

        fn close_session(&mut self, session: u32) {
            self.inner.close_session(session)
        }
    }

    fn gated_supervisor() -> (
        Sender<()>,
        UpdateSupervisor<GatedTransport, MemoryStorage, TestPlatform>,
    ) {
        let (tx, rx) = mpsc::channel();
        let transport = GatedTransport {
            gate: rx,
            inner: ScriptedTransport::serving(&image(40)),
        };
        let engine = UpdateEngine::new(
            transport,
            MemoryStorage::new(256).with_running_image(b"old"),
            TestPlatform::default(),
            config(),
        )
        .unwrap();
        (tx, UpdateSupervisor::new(engine))
    }

    #[test]
    fn test_supervisor_busy_while_running() {
        let (gate, mut supervisor) = gated_supervisor();

        supervisor.start_update(TriggerContext::button()).unwrap();
        assert!(supervisor.is_running());
        assert_eq!(
            supervisor.start_update(TriggerContext::button()),
            Err(SupervisorError::Busy)
        );
        assert!(matches!(supervisor.status(), UpdateStatus::InProgress { .. }));

        gate.send(()).unwrap();
        assert_eq!(supervisor.wait(), Ok(UpdateStatus::Succeeded));
    }

    #[test]
    fn test_supervisor_cancel_mid_transfer() {
        let (gate, mut supervisor) = gated_supervisor();

        supervisor.start_update(TriggerContext::button()).unwrap();
        assert!(supervisor.cancel_update());
        gate.send(()).unwrap();

        assert_eq!(supervisor.wait(), Ok(UpdateStatus::Idle));
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        // Depending on where the task saw the flag, the session and flash may
        // never have been opened; whatever was opened must be released.
        let engine = supervisor.engine().unwrap();
        let transport = &engine.transport().inner;
        assert_eq!(transport.closed, transport.opened);
        assert_eq!(engine.storage().aborted, engine.storage().begun);
        assert_eq!(engine.storage().ended, 0);
        assert_eq!(engine.storage().restarts, 0);

        // A cancelled update can be triggered again.
        gate.send(()).unwrap();
        supervisor.start_update(TriggerContext::button()).unwrap();
        assert_eq!(supervisor.wait(), Ok(UpdateStatus::Succeeded));
    }
}
