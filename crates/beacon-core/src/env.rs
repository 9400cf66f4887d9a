//! Environment abstraction for deterministic testing.
//!
//! Decouples the connection logic from the system clock. Production code uses
//! the tokio clock; tests run the same code on a paused clock so backoff timers
//! and connect timeouts resolve instantly and reproducibly.

use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

/// Monotonic point in time understood by the state machines.
///
/// Blanket-implemented for anything that behaves like `std::time::Instant`
/// (including `tokio::time::Instant`).
pub trait Timestamp:
    Copy + Ord + Debug + Send + Sync + 'static + Sub<Output = Duration> + Add<Duration, Output = Self>
{
}

impl<T> Timestamp for T where
    T: Copy + Ord + Debug + Send + Sync + 'static + Sub<Output = Duration> + Add<Duration, Output = Self>
{
}

/// Abstract environment providing time and async sleeping.
///
/// # Invariants
///
/// - `now()` never goes backwards
/// - `sleep()` completes no earlier than `now() + duration`
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    type Instant: Timestamp;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (timers) awaits this; the state machines never do.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;
}
