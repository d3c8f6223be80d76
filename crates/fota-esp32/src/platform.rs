//! Scheduler services on ESP-IDF.

use std::time::Duration;

use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::sys::{esp_task_wdt_reset, ESP_OK};
use fota_core::Platform;
use log::debug;

/// FreeRTOS delays plus the task watchdog.
///
/// Feeding only succeeds for a task subscribed to the watchdog. An
/// unsubscribed update task logs the failure once and carries on.
#[derive(Debug, Default)]
pub struct EspPlatform {
    unsubscribed_logged: bool,
}

impl EspPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Platform for EspPlatform {
    fn sleep(&mut self, duration: Duration) {
        FreeRtos::delay_ms(u32::try_from(duration.as_millis()).unwrap_or(u32::MAX));
    }

    fn feed_watchdog(&mut self) {
        let result = unsafe { esp_task_wdt_reset() };
        if result != ESP_OK as i32 && !self.unsubscribed_logged {
            debug!("Task watchdog reset returned {}", result);
            self.unsubscribed_logged = true;
        }
    }
}
