//! Test credential sources.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use beacon_client::CredentialSource;
use beacon_core::Credential;
use parking_lot::Mutex;

/// Credential source a test can swap (sign in, sign out, rotate) while the
/// runtime holds it. Counts how often it was asked.
#[derive(Debug, Clone, Default)]
pub struct SwappableCredential {
    current: Arc<Mutex<Option<Credential>>>,
    calls: Arc<AtomicUsize>,
}

impl SwappableCredential {
    /// Source currently returning `credential`.
    pub fn new(credential: &str) -> Self {
        let source = Self::default();
        source.set(Some(credential));
        source
    }

    /// Replace the credential; `None` signs out.
    pub fn set(&self, credential: Option<&str>) {
        *self.current.lock() = credential.map(Credential::new);
    }

    /// How many times the runtime asked for a credential.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialSource for SwappableCredential {
    fn credential(&self) -> impl Future<Output = Option<Credential>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(self.current.lock().clone())
    }
}
