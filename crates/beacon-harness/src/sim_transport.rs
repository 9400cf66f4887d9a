//! Scripted in-memory transport.
//!
//! [`SimTransport`] plays the server side of every link the runtime opens.
//! Each open consumes the next scripted [`OpenOutcome`] (falling back to a
//! default once the script runs out), and every envelope the client sends is
//! recorded in order. Tests push events and closes into the newest live
//! session.

use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};

use beacon_client::{Inbound, OpenRequest, Transport, TransportLink};
use beacon_core::{AttemptId, CloseReason, ConnectFailure, Credential, Envelope};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

const INBOUND_CAPACITY: usize = 64;

/// What the simulated server does with an open request.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// Accept immediately.
    Accept,
    /// Accept after a delay.
    Delay(Duration),
    /// Reject with this failure.
    Reject(ConnectFailure),
    /// Never answer.
    Hang,
}

/// An open request the server received.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRecord {
    /// Attempt generation.
    pub attempt: AttemptId,
    /// Credential presented.
    pub credential: Credential,
}

/// An envelope the client sent.
#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    /// Link it arrived on.
    pub attempt: AttemptId,
    /// The envelope.
    pub envelope: Envelope,
}

struct Session {
    attempt: AttemptId,
    inbound: mpsc::Sender<Inbound>,
}

impl Session {
    fn is_live(&self) -> bool {
        !self.inbound.is_closed()
    }
}

struct SimState {
    script: VecDeque<OpenOutcome>,
    fallback: OpenOutcome,
    opens: Vec<OpenRecord>,
    sessions: Vec<Session>,
    sent: Vec<SentRecord>,
}

/// Scripted transport shared by a test and the runtime under test.
#[derive(Clone)]
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimTransport")
            .field("opens", &state.opens.len())
            .field("sessions", &state.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SimTransport {
    /// Transport that accepts every open.
    pub fn new() -> Self {
        Self::with_fallback(OpenOutcome::Accept)
    }

    /// Transport answering unscripted opens with `fallback`.
    pub fn with_fallback(fallback: OpenOutcome) -> Self {
        let state = SimState {
            script: VecDeque::new(),
            fallback,
            opens: Vec::new(),
            sessions: Vec::new(),
            sent: Vec::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Queue outcomes for the next opens, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Change the answer for unscripted opens.
    pub fn set_fallback(&self, fallback: OpenOutcome) {
        self.state.lock().fallback = fallback;
    }

    /// Number of open requests received.
    pub fn open_count(&self) -> usize {
        self.state.lock().opens.len()
    }

    /// Every open request received, in order.
    pub fn opens(&self) -> Vec<OpenRecord> {
        self.state.lock().opens.clone()
    }

    /// Sessions the client still holds open.
    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.iter().filter(|session| session.is_live()).count()
    }

    /// Everything the client sent, in order.
    pub fn sent(&self) -> Vec<SentRecord> {
        self.state.lock().sent.clone()
    }

    /// Envelopes named `event` the client sent, across all sessions.
    pub fn sent_events(&self, event: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|record| record.envelope.event == event)
            .map(|record| record.envelope.clone())
            .collect()
    }

    /// Push a server event into the newest live session.
    ///
    /// Returns `false` if no session is live.
    pub fn server_event(&self, event: &str, data: Value) -> bool {
        self.push(Inbound::Event(Envelope::new(event, data)))
    }

    /// Close the newest live session from the server side.
    pub fn drop_connection(&self, reason: CloseReason) -> bool {
        self.push(Inbound::Closed(reason))
    }

    fn push(&self, message: Inbound) -> bool {
        let state = self.state.lock();
        match state.sessions.iter().rev().find(|session| session.is_live()) {
            Some(session) => {
                tracing::debug!(attempt = session.attempt.get(), ?message, "sim push");
                session.inbound.try_send(message).is_ok()
            },
            None => false,
        }
    }

    fn accept(state: &Arc<Mutex<SimState>>, attempt: AttemptId) -> TransportLink {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);

        let log = Arc::clone(state);
        let pump = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                log.lock().sent.push(SentRecord { attempt, envelope });
            }
        });

        state.lock().sessions.push(Session { attempt, inbound: inbound_tx });
        TransportLink { outbound, inbound, closer: Some(pump.abort_handle()) }
    }
}

impl Transport for SimTransport {
    fn open(
        &self,
        request: OpenRequest,
    ) -> impl Future<Output = Result<TransportLink, ConnectFailure>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let outcome = {
                let mut state = state.lock();
                state.opens.push(OpenRecord {
                    attempt: request.attempt,
                    credential: request.credential.clone(),
                });
                match state.script.pop_front() {
                    Some(outcome) => outcome,
                    None => state.fallback.clone(),
                }
            };
            tracing::debug!(attempt = request.attempt.get(), ?outcome, "sim open");

            match outcome {
                OpenOutcome::Accept => Ok(Self::accept(&state, request.attempt)),
                OpenOutcome::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(Self::accept(&state, request.attempt))
                },
                OpenOutcome::Reject(failure) => Err(failure),
                OpenOutcome::Hang => std::future::pending().await,
            }
        }
    }
}
