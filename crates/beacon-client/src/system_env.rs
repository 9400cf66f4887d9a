//! Production environment.
//!
//! Reads the tokio clock rather than `std::time::Instant` so that a paused
//! test runtime (`tokio::time::pause`) controls both timers and timestamps.

use std::time::Duration;

use beacon_core::Environment;

/// Production environment using the tokio clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}
