//! Transport seam.
//!
//! A transport opens one channel to the server and hands back a
//! [`TransportLink`]: an outbound channel of envelopes, an inbound channel of
//! events and close notifications, and an abort handle for its I/O task. The
//! runtime never looks past this interface, so the same logic drives a real
//! WebSocket or a scripted simulation.

use std::future::Future;

use beacon_core::{AttemptId, CloseReason, ConnectFailure, Credential, Envelope};
use tokio::{sync::mpsc, task::AbortHandle};

/// Parameters for a single transport attempt.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Server endpoint.
    pub url: String,
    /// Identity, carried out of band (e.g. as a header).
    pub credential: Credential,
    /// Attempt generation, for logging.
    pub attempt: AttemptId,
}

/// Message from an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Named event from the server.
    Event(Envelope),
    /// The transport went away. Nothing follows.
    Closed(CloseReason),
}

/// Handle to an open transport.
#[derive(Debug)]
pub struct TransportLink {
    /// Send envelopes to the server.
    pub outbound: mpsc::UnboundedSender<Envelope>,
    /// Receive events from the server.
    pub inbound: mpsc::Receiver<Inbound>,
    /// Abort handle of the I/O task, if the transport runs one.
    pub closer: Option<AbortHandle>,
}

impl TransportLink {
    /// Stop the transport immediately: drop the outbound channel and abort
    /// the I/O task.
    pub fn close(self) {
        drop(self.outbound);
        if let Some(closer) = self.closer {
            closer.abort();
        }
    }
}

/// Opens transports to the server.
pub trait Transport: Clone + Send + Sync + 'static {
    /// Open a transport. Resolves once it is usable or has definitively
    /// failed; the runtime enforces the connect timeout.
    fn open(
        &self,
        request: OpenRequest,
    ) -> impl Future<Output = Result<TransportLink, ConnectFailure>> + Send;
}
