//! Error types for the Beacon connection core.
//!
//! Two layers: [`ConnectFailure`] is how a transport reports a failed attempt
//! (the machine classifies it), [`ConnectError`] is what a caller of
//! `connect()` gets back. Transient failures never reach callers directly;
//! they are retried with backoff and only surface as
//! [`ConnectError::RetriesExhausted`].

use std::time::Duration;

use thiserror::Error;

/// Why a single transport attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Server rejected the credential (invalid or expired session).
    #[error("authentication rejected by server")]
    Auth,

    /// Server refused the connection because it is at capacity or rate
    /// limiting this client.
    #[error("server at capacity")]
    Capacity {
        /// Retry hint supplied by the server, if any.
        retry_after: Option<Duration>,
    },

    /// Network-level failure (DNS, refused, reset, TLS, handshake I/O).
    #[error("network error: {0}")]
    Network(String),

    /// Attempt neither succeeded nor failed within the connect timeout.
    #[error("connection attempt timed out after {elapsed:?}")]
    Timeout {
        /// How long we waited
        elapsed: Duration,
    },
}

impl ConnectFailure {
    /// Returns true if this failure should be retried with backoff.
    ///
    /// Authentication and capacity failures are never transient: the server
    /// has told us retrying now will not help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. })
    }
}

/// Result of a `connect()` call that did not end in a live connection.
///
/// `Clone` so a single in-flight attempt can resolve every concurrent waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Credential source returned nothing; no attempt was made.
    #[error("no credential available")]
    NoCredential,

    /// The attempt was rejected as unauthenticated. Reconnection is now
    /// suppressed until `reset_block()`.
    #[error("server rejected the credential")]
    Authentication,

    /// A previous authentication failure is still blocking reconnection.
    #[error("reconnection blocked after an authentication failure")]
    AuthBlocked,

    /// The attempt was refused for capacity reasons.
    #[error("server at capacity, try again in {retry_after:?}")]
    Capacity {
        /// Length of the block window that was applied.
        retry_after: Duration,
    },

    /// A capacity block from an earlier attempt is still active.
    #[error("capacity block active for another {retry_after:?}")]
    CapacityBlocked {
        /// Time left in the block window.
        retry_after: Duration,
    },

    /// Automatic reconnection gave up.
    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The attempt was torn down by `disconnect()`, a suspend, or shutdown
    /// before it settled.
    #[error("connection attempt aborted")]
    Aborted,
}

impl ConnectError {
    /// True for errors that mean the user must re-authenticate.
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::Authentication | Self::AuthBlocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_timeout_failures_are_transient() {
        assert!(ConnectFailure::Network("connection reset".to_string()).is_transient());
        assert!(ConnectFailure::Timeout { elapsed: Duration::from_secs(60) }.is_transient());
    }

    #[test]
    fn server_rejections_are_not_transient() {
        assert!(!ConnectFailure::Auth.is_transient());
        assert!(!ConnectFailure::Capacity { retry_after: None }.is_transient());
        assert!(
            !ConnectFailure::Capacity { retry_after: Some(Duration::from_secs(5)) }.is_transient()
        );
    }

    #[test]
    fn only_auth_errors_require_login() {
        assert!(ConnectError::Authentication.requires_login());
        assert!(ConnectError::AuthBlocked.requires_login());
        assert!(!ConnectError::NoCredential.requires_login());
        assert!(!ConnectError::RetriesExhausted { attempts: 10 }.requires_login());
    }
}
