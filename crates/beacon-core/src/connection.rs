//! Connection state machine.
//!
//! Owns the lifecycle of the single shared transport: backoff, auth-failure
//! containment, capacity blocks, the connect timeout, and room replay. Uses
//! the action pattern: methods take time as input and return
//! [`ConnectionAction`]s for the driver to execute. No I/O happens here.
//!
//! Every transport attempt and every timer carries a generation number
//! ([`AttemptId`], [`TimerId`]). Callbacks for anything but the current
//! generation are stale and ignored, which is how a `disconnect()` racing an
//! unsettled attempt stays clean.
//!
//! # State Machine
//!
//! ```text
//!                  connect()                 opened
//! ┌──────────────┐─────────>┌────────────┐─────────>┌───────────┐
//! │ Disconnected │          │ Connecting │          │ Connected │
//! └──────────────┘<─────────└────────────┘          └───────────┘
//!     ^    ^   network failure  │    │                   │
//!     │    │   (retry timer)    │    │ auth / capacity   │ network drop: retry
//!     │    │                    │    v                   │ server close: no retry
//!     │    │               ┌─────────────────┐           │
//!     │    └───────────────│ Blocked(kind)   │<──────────┘ (rejection close)
//!     │  reset_block() /   └─────────────────┘
//!     │  window elapses
//!     └──────── disconnect() from anywhere
//! ```

use std::{fmt, time::Duration};

use crate::{
    backoff::{Backoff, BackoffConfig},
    credential::Credential,
    env::Timestamp,
    envelope::Envelope,
    error::{ConnectError, ConnectFailure},
    rooms::{RoomKind, RoomProtocol, RoomTracker},
};

/// Time allowed for a transport attempt to open.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity block applied when the server gives no retry hint.
pub const DEFAULT_CAPACITY_BLOCK: Duration = Duration::from_secs(60);

/// Why reconnection is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Credential rejected. Sticky until `reset_block()`.
    Auth,
    /// Server at capacity. Lifts when the window elapses.
    Capacity,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Transport attempt in flight.
    Connecting,
    /// Transport open.
    Connected,
    /// Reconnection suppressed.
    Blocked(BlockKind),
}

impl ConnectionState {
    /// True only for [`ConnectionState::Connected`].
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// True while a transport exists or is being opened.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// True in either blocked state.
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// Why an open transport went away.
///
/// This is the explicit network-versus-server classification: network
/// reasons are retried with backoff, everything else is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server closed the channel deliberately (kick, deploy drain, logout
    /// elsewhere). Not retried.
    ServerDisconnect,
    /// We closed it. Not retried.
    ClientDisconnect,
    /// Heartbeat went unanswered. Retried.
    PingTimeout,
    /// Underlying stream ended without a close handshake. Retried.
    TransportClose,
    /// Underlying stream failed. Retried.
    TransportError(String),
    /// Server revoked the session mid-stream. Treated as an auth failure.
    Unauthorized,
    /// Server shed load mid-stream. Treated as a capacity failure.
    OverCapacity {
        /// Retry hint supplied by the server, if any.
        retry_after: Option<Duration>,
    },
}

impl CloseReason {
    /// Whether this close was caused by the network rather than a decision
    /// of either peer.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::PingTimeout | Self::TransportClose | Self::TransportError(_))
    }

    /// The equivalent connect failure if the server rejected us.
    pub fn rejection(&self) -> Option<ConnectFailure> {
        match self {
            Self::Unauthorized => Some(ConnectFailure::Auth),
            Self::OverCapacity { retry_after } => {
                Some(ConnectFailure::Capacity { retry_after: *retry_after })
            },
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerDisconnect => f.write_str("server disconnect"),
            Self::ClientDisconnect => f.write_str("client disconnect"),
            Self::PingTimeout => f.write_str("ping timeout"),
            Self::TransportClose => f.write_str("transport close"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::Unauthorized => f.write_str("unauthorized"),
            Self::OverCapacity { .. } => f.write_str("over capacity"),
        }
    }
}

/// Generation number of a transport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    /// Raw generation number.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Generation number of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Raw generation number.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fails the current attempt if it has not opened yet.
    ConnectTimeout,
    /// Reopens after a transient failure.
    Retry,
    /// Lifts a capacity block.
    Unblock,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed for an attempt to open before it counts as a network
    /// failure.
    pub connect_timeout: Duration,
    /// Capacity block applied when the server gives no retry hint.
    pub capacity_block: Duration,
    /// Retry policy for transient failures.
    pub backoff: BackoffConfig,
    /// Wire primitives for room joins.
    pub rooms: RoomProtocol,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            capacity_block: DEFAULT_CAPACITY_BLOCK,
            backoff: BackoffConfig::default(),
            rooms: RoomProtocol::default(),
        }
    }
}

/// Actions returned by the connection state machine.
///
/// The driver executes these in order:
/// - `Open`: start a transport attempt with this credential
/// - `Close`: tear down the attempt (open or still opening)
/// - `Send`: write an envelope on the attempt's transport
/// - `ScheduleTimer` / `CancelTimer`: manage timers, feed firings back via
///   [`Connection::timer_fired`]
/// - `StateChanged`: notify state observers
/// - `Settle`: resolve the in-flight `connect()` call, if any
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Open a transport.
    Open {
        /// Attempt generation; tag every callback with it.
        attempt: AttemptId,
        /// Identity to present out of band.
        credential: Credential,
    },

    /// Close a transport (or abort its opening).
    Close {
        /// Attempt to close.
        attempt: AttemptId,
    },

    /// Send an envelope.
    Send {
        /// Attempt whose transport carries it.
        attempt: AttemptId,
        /// Event to send.
        envelope: Envelope,
    },

    /// Start a timer.
    ScheduleTimer {
        /// Timer generation; pass back to `timer_fired`.
        timer: TimerId,
        /// Purpose, for logging.
        kind: TimerKind,
        /// Delay until firing.
        delay: Duration,
    },

    /// Cancel a timer. It must not fire afterwards.
    CancelTimer {
        /// Timer to cancel.
        timer: TimerId,
    },

    /// The boolean connected status changed.
    StateChanged {
        /// New status.
        connected: bool,
    },

    /// Resolve the pending `connect()` call.
    Settle(Result<(), ConnectError>),
}

/// Connection state machine
///
/// Pure: no I/O, no clock. Generic over `I` so tests can drive it with
/// virtual time.
#[derive(Debug, Clone)]
pub struct Connection<I> {
    state: ConnectionState,
    config: ConnectionConfig,
    backoff: Backoff<I>,
    rooms: RoomTracker,
    /// Credential of the current (or last, while suspended) transport.
    credential: Option<Credential>,
    attempt: Option<AttemptId>,
    attempt_started: Option<I>,
    connect_timer: Option<TimerId>,
    retry_timer: Option<TimerId>,
    unblock_timer: Option<TimerId>,
    suspended: bool,
    next_generation: u64,
}

impl<I: Timestamp> Connection<I> {
    /// Create a new machine in [`ConnectionState::Disconnected`].
    pub fn new(config: ConnectionConfig) -> Self {
        let rooms = RoomTracker::new(config.rooms.clone());
        Self {
            state: ConnectionState::Disconnected,
            config,
            backoff: Backoff::new(),
            rooms,
            credential: None,
            attempt: None,
            attempt_started: None,
            connect_timer: None,
            retry_timer: None,
            unblock_timer: None,
            suspended: false,
            next_generation: 1,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Shorthand for `state().is_connected()`.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Configuration in use.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Backoff bookkeeping.
    pub fn backoff(&self) -> &Backoff<I> {
        &self.backoff
    }

    /// Tracked rooms.
    pub fn rooms(&self) -> &RoomTracker {
        &self.rooms
    }

    /// Credential snapshot of the current transport. Retained while
    /// suspended, dropped on auth failure and `disconnect()`.
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Generation of the live or opening transport.
    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.attempt
    }

    /// Whether the app is backgrounded.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Ask for a connection with `credential`.
    ///
    /// Returns `Ok` with no `Open` action when a transport with the same
    /// credential is already connecting or connected; the caller should wait
    /// for that attempt's `Settle`. An explicit request also refills an
    /// exhausted retry budget.
    ///
    /// # Errors
    ///
    /// - `ConnectError::NoCredential` if `credential` is `None`
    /// - `ConnectError::AuthBlocked` after an authentication failure
    /// - `ConnectError::CapacityBlocked` inside a capacity window
    pub fn request_connect(
        &mut self,
        credential: Option<Credential>,
        now: I,
    ) -> Result<Vec<ConnectionAction>, ConnectError> {
        let Some(credential) = credential else {
            tracing::debug!("connect requested without a credential");
            return Err(ConnectError::NoCredential);
        };

        if self.backoff.is_auth_blocked() {
            tracing::debug!("connect refused: auth block active");
            return Err(ConnectError::AuthBlocked);
        }

        if let Some(retry_after) = self.backoff.capacity_remaining(now) {
            tracing::debug!(?retry_after, "connect refused: capacity block active");
            return Err(ConnectError::CapacityBlocked { retry_after });
        }

        let mut actions = Vec::new();

        if self.state == ConnectionState::Blocked(BlockKind::Capacity) {
            // Window elapsed before the unblock timer was delivered.
            self.lift_capacity_block(&mut actions);
        }

        if self.state.is_active() {
            if self.credential.as_ref() == Some(&credential) {
                if self.state.is_connected() {
                    actions.push(ConnectionAction::Settle(Ok(())));
                }
                return Ok(actions);
            }

            tracing::info!("credential changed, replacing transport");
            self.release_attempt(&mut actions);
            self.transition(ConnectionState::Disconnected, &mut actions);
        }

        self.suspended = false;
        self.backoff.reset_attempts();
        self.cancel_retry(&mut actions);
        self.open(credential, now, &mut actions);
        Ok(actions)
    }

    /// The transport for `attempt` opened.
    ///
    /// Replays every tracked room and settles the pending connect. A stale
    /// attempt gets a `Close` and nothing else.
    pub fn transport_opened(&mut self, attempt: AttemptId, _now: I) -> Vec<ConnectionAction> {
        if self.attempt != Some(attempt) {
            tracing::debug!(attempt = attempt.get(), "stale attempt opened, closing it");
            return vec![ConnectionAction::Close { attempt }];
        }
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.cancel_connect_timer(&mut actions);
        self.backoff.reset_attempts();
        self.transition(ConnectionState::Connected, &mut actions);

        let replay = self.rooms.replay();
        tracing::info!(attempt = attempt.get(), rooms = self.rooms.len(), "connected");
        actions.extend(replay.into_iter().map(|envelope| ConnectionAction::Send { attempt, envelope }));
        actions.push(ConnectionAction::Settle(Ok(())));
        actions
    }

    /// The transport for `attempt` failed to open.
    pub fn transport_failed(
        &mut self,
        attempt: AttemptId,
        failure: ConnectFailure,
        now: I,
    ) -> Vec<ConnectionAction> {
        if self.attempt != Some(attempt) {
            tracing::debug!(attempt = attempt.get(), %failure, "ignoring failure of stale attempt");
            return Vec::new();
        }
        self.fail(failure, now)
    }

    /// The transport for `attempt` closed.
    pub fn transport_closed(
        &mut self,
        attempt: AttemptId,
        reason: CloseReason,
        now: I,
    ) -> Vec<ConnectionAction> {
        if self.attempt != Some(attempt) {
            tracing::debug!(attempt = attempt.get(), %reason, "ignoring close of stale attempt");
            return Vec::new();
        }

        if let Some(failure) = reason.rejection() {
            return self.fail(failure, now);
        }

        match self.state {
            ConnectionState::Connecting => {
                self.fail(ConnectFailure::Network(reason.to_string()), now)
            },
            ConnectionState::Connected => {
                let mut actions = Vec::new();
                self.release_attempt(&mut actions);
                self.transition(ConnectionState::Disconnected, &mut actions);

                if reason.is_network() {
                    tracing::info!(%reason, "connection lost");
                    self.schedule_retry(&mut actions);
                } else {
                    tracing::info!(%reason, "connection closed, not retrying");
                }
                actions
            },
            ConnectionState::Disconnected | ConnectionState::Blocked(_) => Vec::new(),
        }
    }

    /// A timer scheduled by this machine fired.
    ///
    /// Cancelled or superseded timers are ignored.
    pub fn timer_fired(&mut self, timer: TimerId, now: I) -> Vec<ConnectionAction> {
        if self.connect_timer == Some(timer) {
            self.connect_timer = None;
            if self.state != ConnectionState::Connecting {
                return Vec::new();
            }
            let elapsed =
                self.attempt_started.map_or(self.config.connect_timeout, |started| now - started);
            return self.fail(ConnectFailure::Timeout { elapsed }, now);
        }

        if self.retry_timer == Some(timer) {
            self.retry_timer = None;
            return self.retry(now);
        }

        if self.unblock_timer == Some(timer) {
            self.unblock_timer = None;
            let mut actions = Vec::new();
            if self.state == ConnectionState::Blocked(BlockKind::Capacity) {
                self.lift_capacity_block(&mut actions);
            }
            return actions;
        }

        tracing::debug!(timer = timer.get(), "ignoring stale timer");
        Vec::new()
    }

    /// Tear everything down: transport, timers, rooms, credential, backoff.
    ///
    /// Idempotent. Any pending connect is settled with
    /// [`ConnectError::Aborted`].
    pub fn disconnect(&mut self, _now: I) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.release_attempt(&mut actions);
        self.cancel_retry(&mut actions);
        if let Some(timer) = self.unblock_timer.take() {
            actions.push(ConnectionAction::CancelTimer { timer });
        }

        self.rooms.clear();
        self.credential = None;
        self.backoff.reset();
        self.suspended = false;
        self.transition(ConnectionState::Disconnected, &mut actions);
        actions.push(ConnectionAction::Settle(Err(ConnectError::Aborted)));

        tracing::info!("disconnected");
        actions
    }

    /// Clear an auth or capacity block (e.g. after the user signed in again).
    pub fn reset_block(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.backoff.reset();
        if let Some(timer) = self.unblock_timer.take() {
            actions.push(ConnectionAction::CancelTimer { timer });
        }
        if self.state.is_blocked() {
            tracing::info!(state = ?self.state, "block reset");
            self.transition(ConnectionState::Disconnected, &mut actions);
        }
        actions
    }

    /// App went to the background.
    ///
    /// Closes the transport but keeps rooms and the credential snapshot so
    /// [`Connection::resume`] can restore the same intent.
    pub fn suspend(&mut self, _now: I) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.suspended {
            return actions;
        }
        self.suspended = true;

        let was_opening = self.state == ConnectionState::Connecting;
        self.release_attempt(&mut actions);
        self.cancel_retry(&mut actions);
        if self.state.is_active() {
            self.transition(ConnectionState::Disconnected, &mut actions);
        }
        if was_opening {
            actions.push(ConnectionAction::Settle(Err(ConnectError::Aborted)));
        }

        tracing::info!("suspended");
        actions
    }

    /// App returned to the foreground.
    ///
    /// Returns `true` if the driver should call `connect()`: a credential
    /// snapshot exists and nothing blocks reconnection.
    pub fn resume(&mut self) -> bool {
        self.suspended = false;
        let eligible = self.credential.is_some()
            && !self.state.is_blocked()
            && !self.state.is_active()
            && !self.backoff.is_auth_blocked();
        tracing::info!(eligible, "resumed");
        eligible
    }

    /// Track `id`; send the join immediately if connected.
    pub fn join_room(&mut self, kind: RoomKind, id: &str) -> Vec<ConnectionAction> {
        if !self.rooms.join(kind, id) {
            return Vec::new();
        }
        match self.live_attempt() {
            Some(attempt) => {
                let envelope = self.rooms.join_instruction(kind, id);
                vec![ConnectionAction::Send { attempt, envelope }]
            },
            None => Vec::new(),
        }
    }

    /// Stop tracking `id`; send a leave if connected and the kind has one.
    pub fn leave_room(&mut self, kind: RoomKind, id: &str) -> Vec<ConnectionAction> {
        if !self.rooms.leave(kind, id) {
            return Vec::new();
        }
        match (self.live_attempt(), self.rooms.leave_instruction(kind, id)) {
            (Some(attempt), Some(envelope)) => vec![ConnectionAction::Send { attempt, envelope }],
            _ => Vec::new(),
        }
    }

    /// Best-effort send. `None` (dropped) unless connected.
    pub fn emit(&self, envelope: Envelope) -> Option<ConnectionAction> {
        let Some(attempt) = self.live_attempt() else {
            tracing::debug!(event = %envelope.event, "not connected, dropping emit");
            return None;
        };
        Some(ConnectionAction::Send { attempt, envelope })
    }

    fn live_attempt(&self) -> Option<AttemptId> {
        if self.state.is_connected() { self.attempt } else { None }
    }

    fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Vec<ConnectionAction>) {
        if self.state == next {
            return;
        }
        let was_connected = self.state.is_connected();
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
        if was_connected != next.is_connected() {
            actions.push(ConnectionAction::StateChanged { connected: next.is_connected() });
        }
    }

    fn schedule(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        actions: &mut Vec<ConnectionAction>,
    ) -> TimerId {
        let timer = TimerId(self.next_generation());
        actions.push(ConnectionAction::ScheduleTimer { timer, kind, delay });
        timer
    }

    fn open(&mut self, credential: Credential, now: I, actions: &mut Vec<ConnectionAction>) {
        let attempt = AttemptId(self.next_generation());
        self.attempt = Some(attempt);
        self.attempt_started = Some(now);
        self.credential = Some(credential.clone());
        self.transition(ConnectionState::Connecting, actions);

        tracing::info!(attempt = attempt.get(), retry = self.backoff.attempts(), "connecting");
        actions.push(ConnectionAction::Open { attempt, credential });

        let timeout = self.config.connect_timeout;
        self.connect_timer = Some(self.schedule(TimerKind::ConnectTimeout, timeout, actions));
    }

    /// Close the current attempt, if any, and cancel its timeout.
    fn release_attempt(&mut self, actions: &mut Vec<ConnectionAction>) {
        self.cancel_connect_timer(actions);
        if let Some(attempt) = self.attempt.take() {
            actions.push(ConnectionAction::Close { attempt });
        }
        self.attempt_started = None;
    }

    fn cancel_connect_timer(&mut self, actions: &mut Vec<ConnectionAction>) {
        if let Some(timer) = self.connect_timer.take() {
            actions.push(ConnectionAction::CancelTimer { timer });
        }
    }

    fn cancel_retry(&mut self, actions: &mut Vec<ConnectionAction>) {
        if let Some(timer) = self.retry_timer.take() {
            actions.push(ConnectionAction::CancelTimer { timer });
        }
    }

    fn lift_capacity_block(&mut self, actions: &mut Vec<ConnectionAction>) {
        self.backoff.clear_capacity();
        if let Some(timer) = self.unblock_timer.take() {
            actions.push(ConnectionAction::CancelTimer { timer });
        }
        tracing::info!("capacity block lifted");
        self.transition(ConnectionState::Disconnected, actions);
    }

    /// Classify a failure of the current attempt.
    fn fail(&mut self, failure: ConnectFailure, now: I) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        self.release_attempt(&mut actions);

        match failure {
            ConnectFailure::Auth => {
                tracing::warn!("authentication rejected, suppressing reconnection");
                self.backoff.block_auth();
                self.credential = None;
                self.cancel_retry(&mut actions);
                self.transition(ConnectionState::Blocked(BlockKind::Auth), &mut actions);
                actions.push(ConnectionAction::Settle(Err(ConnectError::Authentication)));
            },
            ConnectFailure::Capacity { retry_after } => {
                let window = retry_after.unwrap_or(self.config.capacity_block);
                tracing::warn!(?window, "server at capacity, blocking reconnection");
                self.backoff.block_until(now + window);
                self.cancel_retry(&mut actions);
                if let Some(timer) = self.unblock_timer.take() {
                    actions.push(ConnectionAction::CancelTimer { timer });
                }
                self.unblock_timer = Some(self.schedule(TimerKind::Unblock, window, &mut actions));
                self.transition(ConnectionState::Blocked(BlockKind::Capacity), &mut actions);
                actions.push(ConnectionAction::Settle(Err(ConnectError::Capacity {
                    retry_after: window,
                })));
            },
            ConnectFailure::Network(_) | ConnectFailure::Timeout { .. } => {
                tracing::info!(%failure, "connection attempt failed");
                self.transition(ConnectionState::Disconnected, &mut actions);
                self.schedule_retry(&mut actions);
            },
        }
        actions
    }

    fn schedule_retry(&mut self, actions: &mut Vec<ConnectionAction>) {
        if self.suspended {
            return;
        }
        self.cancel_retry(actions);
        match self.backoff.next_retry(&self.config.backoff) {
            Some(delay) => {
                tracing::info!(?delay, attempt = self.backoff.attempts(), "scheduling reconnect");
                self.retry_timer = Some(self.schedule(TimerKind::Retry, delay, actions));
            },
            None => {
                let attempts = self.backoff.attempts();
                tracing::warn!(attempts, "reconnect attempts exhausted, giving up");
                actions.push(ConnectionAction::Settle(Err(ConnectError::RetriesExhausted {
                    attempts,
                })));
            },
        }
    }

    fn retry(&mut self, now: I) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.state != ConnectionState::Disconnected || self.suspended {
            return actions;
        }
        let Some(credential) = self.credential.clone() else {
            return actions;
        };
        self.open(credential, now, &mut actions);
        actions
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;

    use super::*;

    #[allow(clippy::disallowed_methods)]
    fn t0() -> Instant {
        Instant::now()
    }

    fn cred(value: &str) -> Option<Credential> {
        Some(Credential::new(value))
    }

    fn opened_attempt(actions: &[ConnectionAction]) -> AttemptId {
        actions
            .iter()
            .find_map(|a| match a {
                ConnectionAction::Open { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .expect("expected an Open action")
    }

    fn scheduled(actions: &[ConnectionAction], wanted: TimerKind) -> Option<(TimerId, Duration)> {
        actions.iter().find_map(|a| match a {
            ConnectionAction::ScheduleTimer { timer, kind, delay } if *kind == wanted => {
                Some((*timer, *delay))
            },
            _ => None,
        })
    }

    fn sends(actions: &[ConnectionAction]) -> Vec<Envelope> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Send { envelope, .. } => Some(envelope.clone()),
                _ => None,
            })
            .collect()
    }

    fn connected(now: Instant) -> (Connection<Instant>, AttemptId) {
        let mut conn = Connection::new(ConnectionConfig::default());
        let actions = conn.request_connect(cred("sess=abc"), now).unwrap();
        let attempt = opened_attempt(&actions);
        conn.transport_opened(attempt, now);
        (conn, attempt)
    }

    #[test]
    fn connection_lifecycle() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        let actions = conn.request_connect(cred("sess=abc"), now).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        let attempt = opened_attempt(&actions);
        assert!(scheduled(&actions, TimerKind::ConnectTimeout).is_some());

        let actions = conn.transport_opened(attempt, now);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(actions.contains(&ConnectionAction::StateChanged { connected: true }));
        assert!(actions.contains(&ConnectionAction::Settle(Ok(()))));
        assert!(actions.iter().any(|a| matches!(a, ConnectionAction::CancelTimer { .. })));

        let actions = conn.disconnect(now);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(actions.contains(&ConnectionAction::Close { attempt }));
        assert!(actions.contains(&ConnectionAction::StateChanged { connected: false }));
    }

    #[test]
    fn missing_credential_makes_no_attempt() {
        let mut conn: Connection<Instant> = Connection::new(ConnectionConfig::default());
        assert_eq!(conn.request_connect(None, t0()), Err(ConnectError::NoCredential));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn same_credential_while_connecting_is_a_no_op() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        conn.request_connect(cred("sess=abc"), now).unwrap();

        let actions = conn.request_connect(cred("sess=abc"), now).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn same_credential_while_connected_settles_immediately() {
        let now = t0();
        let (mut conn, _) = connected(now);
        let actions = conn.request_connect(cred("sess=abc"), now).unwrap();
        assert_eq!(actions, vec![ConnectionAction::Settle(Ok(()))]);
    }

    #[test]
    fn changed_credential_replaces_transport() {
        let now = t0();
        let (mut conn, first) = connected(now);

        let actions = conn.request_connect(cred("sess=xyz"), now).unwrap();
        let close_at = actions.iter().position(|a| *a == ConnectionAction::Close { attempt: first });
        let open_at = actions.iter().position(|a| matches!(a, ConnectionAction::Open { .. }));
        assert!(close_at.unwrap() < open_at.unwrap(), "old transport must close first");
        assert_eq!(conn.credential(), Some(&Credential::new("sess=xyz")));
    }

    #[test]
    fn opened_replays_tracked_rooms() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        assert!(conn.join_room(RoomKind::Post, "p1").is_empty(), "not connected yet");
        conn.join_room(RoomKind::Conversation, "c1");

        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());
        let actions = conn.transport_opened(attempt, now);

        assert_eq!(sends(&actions), vec![
            Envelope::new("joinPost", json!("p1")),
            Envelope::new("joinConversations", json!(["c1"])),
        ]);
    }

    #[test]
    fn join_while_connected_sends_once() {
        let now = t0();
        let (mut conn, attempt) = connected(now);

        let actions = conn.join_room(RoomKind::Post, "p1");
        assert_eq!(actions, vec![ConnectionAction::Send {
            attempt,
            envelope: Envelope::new("joinPost", json!("p1")),
        }]);
        assert!(conn.join_room(RoomKind::Post, "p1").is_empty());
    }

    #[test]
    fn leave_without_primitive_only_drops_intent() {
        let now = t0();
        let (mut conn, _) = connected(now);
        conn.join_room(RoomKind::Conversation, "c1");

        assert!(conn.leave_room(RoomKind::Conversation, "c1").is_empty());
        assert!(!conn.rooms().contains(RoomKind::Conversation, "c1"));
    }

    #[test]
    fn leave_with_primitive_sends_leave() {
        let now = t0();
        let (mut conn, _) = connected(now);
        conn.join_room(RoomKind::Post, "p1");

        let actions = conn.leave_room(RoomKind::Post, "p1");
        assert_eq!(sends(&actions), vec![Envelope::new("leavePost", json!("p1"))]);
    }

    #[test]
    fn emit_is_dropped_unless_connected() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        assert!(conn.emit(Envelope::new("typing", json!(null))).is_none());

        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());
        assert!(conn.emit(Envelope::new("typing", json!(null))).is_none(), "still connecting");

        conn.transport_opened(attempt, now);
        assert!(conn.emit(Envelope::new("typing", json!(null))).is_some());
    }

    #[test]
    fn network_failure_schedules_retry_with_cached_credential() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());

        let actions =
            conn.transport_failed(attempt, ConnectFailure::Network("refused".into()), now);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let (timer, delay) = scheduled(&actions, TimerKind::Retry).unwrap();
        assert_eq!(delay, Duration::from_secs(1));
        assert!(!actions.iter().any(|a| matches!(a, ConnectionAction::Settle(_))));

        let actions = conn.timer_fired(timer, now + delay);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(actions.iter().any(|a| matches!(
            a,
            ConnectionAction::Open { credential, .. } if credential.expose() == "sess=abc"
        )));
    }

    #[test]
    fn auth_failure_blocks_and_discards_credential() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());

        let actions = conn.transport_failed(attempt, ConnectFailure::Auth, now);
        assert_eq!(conn.state(), ConnectionState::Blocked(BlockKind::Auth));
        assert!(conn.credential().is_none());
        assert!(scheduled(&actions, TimerKind::Retry).is_none());
        assert!(actions.contains(&ConnectionAction::Settle(Err(ConnectError::Authentication))));

        assert_eq!(conn.request_connect(cred("sess=abc"), now), Err(ConnectError::AuthBlocked));

        conn.reset_block();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.request_connect(cred("sess=new"), now).is_ok());
    }

    #[test]
    fn capacity_failure_blocks_for_server_hint() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());

        let hint = Duration::from_secs(5);
        let actions =
            conn.transport_failed(attempt, ConnectFailure::Capacity { retry_after: Some(hint) }, now);
        assert_eq!(conn.state(), ConnectionState::Blocked(BlockKind::Capacity));
        assert!(
            actions.contains(&ConnectionAction::Settle(Err(ConnectError::Capacity {
                retry_after: hint
            })))
        );
        let (timer, delay) = scheduled(&actions, TimerKind::Unblock).unwrap();
        assert_eq!(delay, hint);

        let later = now + Duration::from_secs(2);
        assert_eq!(
            conn.request_connect(cred("sess=abc"), later),
            Err(ConnectError::CapacityBlocked { retry_after: Duration::from_secs(3) })
        );

        let actions = conn.timer_fired(timer, now + hint);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(actions.iter().all(|a| !matches!(a, ConnectionAction::Open { .. })));
    }

    #[test]
    fn capacity_failure_without_hint_uses_default_window() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());

        let actions =
            conn.transport_failed(attempt, ConnectFailure::Capacity { retry_after: None }, now);
        assert_eq!(scheduled(&actions, TimerKind::Unblock).unwrap().1, DEFAULT_CAPACITY_BLOCK);
    }

    #[test]
    fn elapsed_capacity_window_is_honoured_without_timer() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());
        conn.transport_failed(
            attempt,
            ConnectFailure::Capacity { retry_after: Some(Duration::from_secs(1)) },
            now,
        );

        let actions = conn.request_connect(cred("sess=abc"), now + Duration::from_secs(2)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        opened_attempt(&actions);
    }

    #[test]
    fn connect_timeout_counts_as_network_failure() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        let actions = conn.request_connect(cred("sess=abc"), now).unwrap();
        let attempt = opened_attempt(&actions);
        let (timer, delay) = scheduled(&actions, TimerKind::ConnectTimeout).unwrap();
        assert_eq!(delay, DEFAULT_CONNECT_TIMEOUT);

        let actions = conn.timer_fired(timer, now + delay);
        assert!(actions.contains(&ConnectionAction::Close { attempt }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(scheduled(&actions, TimerKind::Retry).is_some());

        // The abandoned attempt opening late must be closed, not adopted.
        let actions = conn.transport_opened(attempt, now + delay);
        assert_eq!(actions, vec![ConnectionAction::Close { attempt }]);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn network_drop_retries_but_server_disconnect_does_not() {
        let now = t0();
        let (mut conn, attempt) = connected(now);
        let actions = conn.transport_closed(attempt, CloseReason::TransportClose, now);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(actions.contains(&ConnectionAction::StateChanged { connected: false }));
        assert!(scheduled(&actions, TimerKind::Retry).is_some());

        let (mut conn, attempt) = connected(now);
        let actions = conn.transport_closed(attempt, CloseReason::ServerDisconnect, now);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(scheduled(&actions, TimerKind::Retry).is_none());
    }

    #[test]
    fn unauthorized_close_is_an_auth_failure() {
        let now = t0();
        let (mut conn, attempt) = connected(now);
        conn.transport_closed(attempt, CloseReason::Unauthorized, now);
        assert_eq!(conn.state(), ConnectionState::Blocked(BlockKind::Auth));
        assert!(conn.backoff().is_auth_blocked());
    }

    #[test]
    fn retries_give_up_after_budget() {
        let now = t0();
        let config = ConnectionConfig {
            backoff: BackoffConfig { max_attempts: 2, ..BackoffConfig::default() },
            ..ConnectionConfig::default()
        };
        let mut conn = Connection::new(config);
        let mut actions = conn.request_connect(cred("sess=abc"), now).unwrap();

        for _ in 0..2 {
            let attempt = opened_attempt(&actions);
            let failed = conn.transport_failed(attempt, ConnectFailure::Network("x".into()), now);
            let (timer, _) = scheduled(&failed, TimerKind::Retry).unwrap();
            actions = conn.timer_fired(timer, now);
        }

        let attempt = opened_attempt(&actions);
        let failed = conn.transport_failed(attempt, ConnectFailure::Network("x".into()), now);
        assert!(scheduled(&failed, TimerKind::Retry).is_none());
        assert!(
            failed.contains(&ConnectionAction::Settle(Err(ConnectError::RetriesExhausted {
                attempts: 2
            })))
        );

        // An explicit connect refills the budget.
        let actions = conn.request_connect(cred("sess=abc"), now).unwrap();
        opened_attempt(&actions);
        assert_eq!(conn.backoff().attempts(), 0);
    }

    #[test]
    fn disconnect_ignores_late_settle_of_abandoned_attempt() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());

        let actions = conn.disconnect(now);
        assert!(actions.contains(&ConnectionAction::Close { attempt }));
        assert!(actions.contains(&ConnectionAction::Settle(Err(ConnectError::Aborted))));

        assert_eq!(conn.transport_opened(attempt, now), vec![ConnectionAction::Close { attempt }]);
        assert!(conn.transport_failed(attempt, ConnectFailure::Auth, now).is_empty());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.backoff().is_auth_blocked());
    }

    #[test]
    fn disconnect_is_idempotent_and_clears_intent() {
        let now = t0();
        let (mut conn, _) = connected(now);
        conn.join_room(RoomKind::Post, "p1");

        conn.disconnect(now);
        let actions = conn.disconnect(now);
        assert!(conn.rooms().is_empty());
        assert!(conn.credential().is_none());
        assert!(!actions.iter().any(|a| matches!(a, ConnectionAction::Close { .. })));
        assert!(!actions.iter().any(|a| matches!(a, ConnectionAction::StateChanged { .. })));
    }

    #[test]
    fn cancelled_retry_timer_is_stale() {
        let now = t0();
        let (mut conn, attempt) = connected(now);
        let actions = conn.transport_closed(attempt, CloseReason::PingTimeout, now);
        let (timer, _) = scheduled(&actions, TimerKind::Retry).unwrap();

        conn.disconnect(now);
        assert!(conn.timer_fired(timer, now).is_empty());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn suspend_keeps_intent_and_resume_reports_eligibility() {
        let now = t0();
        let (mut conn, attempt) = connected(now);
        conn.join_room(RoomKind::Post, "p1");

        let actions = conn.suspend(now);
        assert!(actions.contains(&ConnectionAction::Close { attempt }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.rooms().contains(RoomKind::Post, "p1"));
        assert!(conn.credential().is_some());

        // Late close from the suspended transport must not schedule a retry.
        assert!(conn.transport_closed(attempt, CloseReason::TransportClose, now).is_empty());

        assert!(conn.resume());
    }

    #[test]
    fn suspend_while_connecting_aborts_pending_connect() {
        let now = t0();
        let mut conn = Connection::new(ConnectionConfig::default());
        conn.request_connect(cred("sess=abc"), now).unwrap();

        let actions = conn.suspend(now);
        assert!(actions.contains(&ConnectionAction::Settle(Err(ConnectError::Aborted))));
        assert!(conn.suspend(now).is_empty(), "second suspend is a no-op");
    }

    #[test]
    fn resume_is_not_eligible_when_blocked_or_never_connected() {
        let now = t0();
        let mut conn: Connection<Instant> = Connection::new(ConnectionConfig::default());
        assert!(!conn.resume());

        let attempt = opened_attempt(&conn.request_connect(cred("sess=abc"), now).unwrap());
        conn.transport_failed(attempt, ConnectFailure::Auth, now);
        conn.suspend(now);
        assert!(!conn.resume());
    }
}
