//! Deterministic simulation harness for Beacon.
//!
//! A scripted [`SimTransport`] stands in for the server, and tests run on a
//! paused tokio clock (`#[tokio::test(start_paused = true)]`), so backoff
//! delays, capacity windows and connect timeouts elapse instantly and in a
//! reproducible order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credentials;
pub mod sim_transport;

use std::time::Duration;

use beacon_client::{Realtime, RealtimeConfig};
pub use credentials::SwappableCredential;
pub use sim_transport::{OpenOutcome, OpenRecord, SentRecord, SimTransport};

/// Runtime under test.
pub type SimRealtime = Realtime<SimTransport, SwappableCredential>;

/// Polling step for [`wait_until`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest [`wait_until`] waits, in (virtual) time.
pub const WAIT_LIMIT: Duration = Duration::from_secs(600);

/// Runtime over `transport` with default tuning.
pub fn realtime(transport: &SimTransport, credentials: &SwappableCredential) -> SimRealtime {
    realtime_with(RealtimeConfig::new("sim://beacon"), transport, credentials)
}

/// Runtime over `transport` with custom tuning.
pub fn realtime_with(
    config: RealtimeConfig,
    transport: &SimTransport,
    credentials: &SwappableCredential,
) -> SimRealtime {
    Realtime::new(config, transport.clone(), credentials.clone())
}

/// Poll `condition` until it holds or [`WAIT_LIMIT`] elapses.
///
/// On a paused clock the runtime auto-advances to the next due timer, so
/// this also lets scheduled retries and timeouts fire.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    condition()
}

/// Let spawned tasks run for `duration` of (virtual) time.
pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
}
