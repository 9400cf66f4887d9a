//! Credential sources.
//!
//! The runtime asks for a credential on every explicit `connect()`. Automatic
//! retries reuse the snapshot taken then, so a source is never polled in a
//! tight loop.

use std::future::Future;

use beacon_core::Credential;

/// Supplies the bearer credential on demand.
///
/// `None` means "do not attempt a connection" (signed out).
pub trait CredentialSource: Send + Sync + 'static {
    /// Current credential, if any.
    fn credential(&self) -> impl Future<Output = Option<Credential>> + Send;
}

impl<F, Fut> CredentialSource for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Credential>> + Send,
{
    fn credential(&self) -> impl Future<Output = Option<Credential>> + Send {
        self()
    }
}

/// A fixed credential (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<Credential>);

impl StaticCredential {
    /// Always returns `credential`.
    pub fn new(credential: impl Into<Credential>) -> Self {
        Self(Some(credential.into()))
    }

    /// Always returns `None`.
    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialSource for StaticCredential {
    fn credential(&self) -> impl Future<Output = Option<Credential>> + Send {
        std::future::ready(self.0.clone())
    }
}
