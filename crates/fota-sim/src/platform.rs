//! Time accounting platform for host runs.

use std::time::Duration;

use fota_core::Platform;

/// Platform that only accounts for time.
#[derive(Debug, Default)]
pub struct VirtualPlatform {
    slept: Duration,
    watchdog_feeds: u32,
}

impl VirtualPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total time the update task asked to sleep.
    pub fn slept(&self) -> Duration {
        self.slept
    }

    pub fn watchdog_feeds(&self) -> u32 {
        self.watchdog_feeds
    }
}

impl Platform for VirtualPlatform {
    fn sleep(&mut self, duration: Duration) {
        self.slept += duration;
    }

    fn feed_watchdog(&mut self) {
        self.watchdog_feeds += 1;
    }
}
