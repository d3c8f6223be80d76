//! ESP-IDF adapters for the firmware update engine.
//!
//! This crate provides the platform side of [`fota_core`] on ESP32 targets:
//! - [`EspBootStorage`]: OTA partitions and boot selection over the `esp_ota_*` API
//! - [`EspPlatform`]: FreeRTOS delays and the task watchdog
//!
//! The transport is supplied by the firmware (CoAP client, MQTT subscriber)
//! and is not part of this crate.
//!
//! # Example
//!
//! ```ignore
//! use fota_core::{TriggerContext, TriggerSource, UpdateEngine, UpdateSupervisor};
//! use fota_esp32::{EspBootStorage, EspPlatform};
//!
//! let storage = EspBootStorage::new()?;
//! let engine = UpdateEngine::new(transport, storage, EspPlatform::new(), config)?;
//! let mut supervisor = UpdateSupervisor::new(engine);
//! supervisor.start_update(TriggerContext::new(TriggerSource::Button))?;
//! ```

pub mod platform;
pub mod storage;

pub use platform::EspPlatform;
pub use storage::{EspBootStorage, EspOtaHandle};
