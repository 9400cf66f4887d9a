//! Realtime runtime handle.
//!
//! [`Realtime`] is the single long-lived manager of the shared event channel.
//! It owns the [`Connection`] state machine and executes its actions against a
//! [`Transport`]:
//!
//! ```text
//!   public API ──┐                     ┌── open task    (Transport::open)
//!                │   ┌─────────────┐   ├── reader task  (inbound -> listeners)
//!   transport ───┼──>│ Mutex<Inner>│──>├── timer tasks  (Environment::sleep)
//!   callbacks    │   │  Connection │   └── outbound     (Send actions)
//!   timers ──────┘   └─────────────┘
//! ```
//!
//! All mutable state sits behind one `parking_lot::Mutex`. The lock is never
//! held across an `.await` and is always released before user handlers or
//! state observers run. Spawned tasks hold a `Weak` back-reference, so
//! dropping every handle tears the runtime down.
//!
//! Every spawned task is tagged with the [`AttemptId`] or [`TimerId`] it was
//! created for; the machine drops callbacks for anything but the current
//! generation.
//!
//! Status changes get a revision number while the lock is held and are
//! published after it is released; observers drop revisions older than one
//! they already saw, so racing commits cannot leave them on a stale status.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use beacon_core::{
    AppPhase, AttemptId, CloseReason, ConnectError, ConnectFailure, Connection,
    ConnectionAction, ConnectionState, Credential, Environment, Envelope, LifecycleAction,
    LifecycleBridge, RoomKind, TimerId, TimerKind,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{AbortHandle, JoinHandle},
};

use crate::{
    config::RealtimeConfig,
    credential::CredentialSource,
    listeners::{ErrorObservers, ListenerId, ListenerRegistry, StateObservers, Subscription},
    system_env::SystemEnv,
    transport::{Inbound, OpenRequest, Transport, TransportLink},
};

type ConnectResult = Result<(), ConnectError>;
type ConnectFuture = Shared<BoxFuture<'static, ConnectResult>>;

/// The `connect()` every concurrent caller is waiting on.
struct InFlight {
    id: u64,
    /// Set once the credential was fetched and handed to the machine. Only a
    /// started connect may be settled by the machine.
    started: bool,
    future: ConnectFuture,
    settle: oneshot::Sender<ConnectResult>,
}

/// What to tell observers once the lock is released.
#[derive(Default)]
struct Notices {
    status: Vec<(u64, bool)>,
    failures: Vec<ConnectError>,
}

/// The transport the machine considers open.
struct LiveLink {
    attempt: AttemptId,
    outbound: mpsc::UnboundedSender<Envelope>,
    closer: Option<AbortHandle>,
    reader: AbortHandle,
}

impl LiveLink {
    /// Drop the outbound channel so the I/O task can say goodbye, and stop
    /// reading.
    fn close(self) {
        drop(self.outbound);
        self.reader.abort();
    }

    fn abort(self) {
        if let Some(closer) = &self.closer {
            closer.abort();
        }
        self.close();
    }
}

struct Inner<I> {
    machine: Connection<I>,
    link: Option<LiveLink>,
    opening: Option<(AttemptId, AbortHandle)>,
    timers: HashMap<TimerId, AbortHandle>,
    in_flight: Option<InFlight>,
    bridge: LifecycleBridge,
    next_connect: u64,
    status_revision: u64,
    last_error: Option<ConnectError>,
    shut_down: bool,
}

impl<I> Inner<I> {
    /// Register a new pending connect and return its shared result.
    fn track_connect(&mut self, started: bool) -> (u64, ConnectFuture) {
        let (settle, settled) = oneshot::channel();
        let future =
            settled.map(|result| result.unwrap_or(Err(ConnectError::Aborted))).boxed().shared();

        self.next_connect += 1;
        let id = self.next_connect;
        self.in_flight = Some(InFlight { id, started, future: future.clone(), settle });
        (id, future)
    }

    fn close_attempt(&mut self, attempt: AttemptId) {
        if self.opening.as_ref().is_some_and(|(opening, _)| *opening == attempt) {
            if let Some((_, handle)) = self.opening.take() {
                handle.abort();
            }
        }
        if self.link.as_ref().is_some_and(|link| link.attempt == attempt) {
            if let Some(link) = self.link.take() {
                link.close();
            }
        }
    }

    fn send(&self, attempt: AttemptId, envelope: Envelope) -> bool {
        match &self.link {
            Some(link) if link.attempt == attempt => link.outbound.send(envelope).is_ok(),
            _ => {
                tracing::debug!(attempt = attempt.get(), event = %envelope.event, "no live link, dropping send");
                false
            },
        }
    }

    fn cancel_timer(&mut self, timer: TimerId) {
        if let Some(handle) = self.timers.remove(&timer) {
            handle.abort();
        }
    }

    /// Resolve the in-flight connect if the machine owns it.
    fn settle(&mut self, result: ConnectResult) {
        if !self.in_flight.as_ref().is_some_and(|in_flight| in_flight.started) {
            return;
        }
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.settle.send(result);
        }
    }

    /// Reject whatever connect is pending, started or not.
    fn abort_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.settle.send(Err(ConnectError::Aborted));
        }
    }

    fn abort_tasks(&mut self) {
        if let Some((_, handle)) = self.opening.take() {
            handle.abort();
        }
        if let Some(link) = self.link.take() {
            link.abort();
        }
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl<I> Drop for Inner<I> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// State shared between handles and spawned tasks.
struct Runtime<T, C, E: Environment> {
    transport: T,
    credentials: C,
    env: E,
    url: String,
    inner: Mutex<Inner<E::Instant>>,
    listeners: ListenerRegistry,
    observers: StateObservers,
    errors: ErrorObservers,
}

impl<T, C, E> Runtime<T, C, E>
where
    T: Transport,
    C: CredentialSource,
    E: Environment,
{
    /// Release the lock, then tell observers.
    fn commit(&self, inner: MutexGuard<'_, Inner<E::Instant>>, notices: Notices) {
        drop(inner);
        for (revision, connected) in notices.status {
            self.observers.publish(revision, &connected);
        }
        for error in notices.failures {
            self.errors.notify(&error);
        }
    }

    /// Execute machine actions. Returns what to report once the lock is
    /// released.
    fn execute(
        self: &Arc<Self>,
        inner: &mut Inner<E::Instant>,
        actions: Vec<ConnectionAction>,
    ) -> Notices {
        let mut notices = Notices::default();
        for action in actions {
            match action {
                ConnectionAction::Open { attempt, credential } => {
                    self.spawn_open(inner, attempt, credential);
                },
                ConnectionAction::Close { attempt } => inner.close_attempt(attempt),
                ConnectionAction::Send { attempt, envelope } => {
                    inner.send(attempt, envelope);
                },
                ConnectionAction::ScheduleTimer { timer, kind, delay } => {
                    self.spawn_timer(inner, timer, kind, delay);
                },
                ConnectionAction::CancelTimer { timer } => inner.cancel_timer(timer),
                ConnectionAction::StateChanged { connected } => {
                    inner.status_revision += 1;
                    notices.status.push((inner.status_revision, connected));
                    if connected {
                        inner.last_error = None;
                    }
                },
                ConnectionAction::Settle(result) => {
                    // Terminal failures reach error observers whether or not
                    // a connect() is waiting; sign-out aborts are not failures.
                    if let Err(error) = &result {
                        if *error != ConnectError::Aborted {
                            inner.last_error = Some(error.clone());
                            notices.failures.push(error.clone());
                        }
                    }
                    inner.settle(result);
                },
            }
        }
        notices
    }

    fn spawn_open(
        self: &Arc<Self>,
        inner: &mut Inner<E::Instant>,
        attempt: AttemptId,
        credential: Credential,
    ) {
        let runtime = Arc::downgrade(self);
        let transport = self.transport.clone();
        let request = OpenRequest { url: self.url.clone(), credential, attempt };

        let handle = tokio::spawn(async move {
            let result = transport.open(request).await;
            match runtime.upgrade() {
                Some(runtime) => runtime.on_open_result(attempt, result),
                None => {
                    if let Ok(link) = result {
                        link.close();
                    }
                },
            }
        });

        if let Some((_, previous)) = inner.opening.replace((attempt, handle.abort_handle())) {
            previous.abort();
        }
    }

    fn spawn_timer(
        self: &Arc<Self>,
        inner: &mut Inner<E::Instant>,
        timer: TimerId,
        kind: TimerKind,
        delay: Duration,
    ) {
        let runtime = Arc::downgrade(self);
        let env = self.env.clone();

        let handle = tokio::spawn(async move {
            env.sleep(delay).await;
            if let Some(runtime) = runtime.upgrade() {
                runtime.on_timer(timer);
            }
        });

        tracing::trace!(timer = timer.get(), ?kind, ?delay, "timer scheduled");
        inner.timers.insert(timer, handle.abort_handle());
    }

    async fn run_connect(self: Arc<Self>, id: u64) {
        let credential = self.credentials.credential().await;

        let mut inner = self.inner.lock();
        match &mut inner.in_flight {
            Some(in_flight) if in_flight.id == id && !in_flight.started => {
                in_flight.started = true;
            },
            _ => {
                tracing::debug!("connect superseded while fetching credential");
                return;
            },
        }
        self.start_connect(inner, credential);
    }

    /// Hand a fetched credential to the machine for the started in-flight
    /// connect.
    fn start_connect(
        self: &Arc<Self>,
        mut inner: MutexGuard<'_, Inner<E::Instant>>,
        credential: Option<Credential>,
    ) {
        let now = self.env.now();
        match inner.machine.request_connect(credential, now) {
            Ok(actions) => {
                let notices = self.execute(&mut inner, actions);
                self.commit(inner, notices);
            },
            Err(error) => {
                tracing::debug!(%error, "connect refused");
                inner.settle(Err(error));
            },
        }
    }

    fn on_open_result(self: &Arc<Self>, attempt: AttemptId, result: Result<TransportLink, ConnectFailure>) {
        let mut inner = self.inner.lock();
        if inner.opening.as_ref().is_some_and(|(opening, _)| *opening == attempt) {
            inner.opening = None;
        }

        let now = self.env.now();
        let actions = match result {
            Ok(link) => {
                if inner.machine.current_attempt() != Some(attempt) {
                    tracing::debug!(attempt = attempt.get(), "stale transport opened, closing it");
                    link.close();
                    return;
                }
                self.install_link(&mut inner, attempt, link);
                inner.machine.transport_opened(attempt, now)
            },
            Err(failure) => inner.machine.transport_failed(attempt, failure, now),
        };

        let notices = self.execute(&mut inner, actions);
        self.commit(inner, notices);
    }

    fn install_link(
        self: &Arc<Self>,
        inner: &mut Inner<E::Instant>,
        attempt: AttemptId,
        link: TransportLink,
    ) {
        let TransportLink { outbound, inbound, closer } = link;
        let reader = tokio::spawn(Self::read_loop(Arc::downgrade(self), attempt, inbound));
        let live = LiveLink { attempt, outbound, closer, reader: reader.abort_handle() };
        if let Some(previous) = inner.link.replace(live) {
            previous.close();
        }
    }

    async fn read_loop(runtime: Weak<Self>, attempt: AttemptId, mut inbound: mpsc::Receiver<Inbound>) {
        let reason = loop {
            let Some(message) = inbound.recv().await else {
                break CloseReason::TransportClose;
            };
            let Some(runtime) = runtime.upgrade() else {
                return;
            };
            match message {
                Inbound::Event(envelope) => runtime.dispatch(attempt, &envelope),
                Inbound::Closed(reason) => break reason,
            }
        };

        if let Some(runtime) = runtime.upgrade() {
            runtime.on_closed(attempt, reason);
        }
    }

    fn dispatch(&self, attempt: AttemptId, envelope: &Envelope) {
        let current = self.inner.lock().link.as_ref().is_some_and(|link| link.attempt == attempt);
        if !current {
            tracing::debug!(attempt = attempt.get(), event = %envelope.event, "event from stale transport");
            return;
        }

        let handled = self.listeners.dispatch(&envelope.event, &envelope.data);
        tracing::trace!(event = %envelope.event, handled, "inbound event");
    }

    fn on_closed(self: &Arc<Self>, attempt: AttemptId, reason: CloseReason) {
        let mut inner = self.inner.lock();
        let now = self.env.now();
        let actions = inner.machine.transport_closed(attempt, reason, now);
        let notices = self.execute(&mut inner, actions);
        self.commit(inner, notices);
    }

    fn on_timer(self: &Arc<Self>, timer: TimerId) {
        let mut inner = self.inner.lock();
        if inner.timers.remove(&timer).is_none() {
            return;
        }
        let now = self.env.now();
        let actions = inner.machine.timer_fired(timer, now);
        let notices = self.execute(&mut inner, actions);
        self.commit(inner, notices);
    }

    /// Run a machine input that needs no async follow-up.
    fn drive(
        self: &Arc<Self>,
        input: impl FnOnce(&mut Connection<E::Instant>, E::Instant) -> Vec<ConnectionAction>,
    ) {
        let mut inner = self.inner.lock();
        let now = self.env.now();
        let actions = input(&mut inner.machine, now);
        let notices = self.execute(&mut inner, actions);
        self.commit(inner, notices);
    }
}

/// Handle to the shared realtime connection.
///
/// Cheap to clone; every clone drives the same connection, rooms, and
/// listeners. Construct one per app session and pass it to whatever needs
/// realtime events. Must be used from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// # async fn demo<T: beacon_client::Transport>(transport: T) {
/// use beacon_client::{Realtime, RealtimeConfig, StaticCredential};
/// use beacon_core::RoomKind;
///
/// let realtime = Realtime::new(RealtimeConfig::default(), transport, StaticCredential::new("sess=abc"));
/// let _likes = realtime.subscribe("postLiked", |data| tracing::info!(%data, "liked"));
/// realtime.join_room(RoomKind::Post, "p1");
/// let _ = realtime.connect().await;
/// # }
/// ```
pub struct Realtime<T, C, E: Environment = SystemEnv> {
    runtime: Arc<Runtime<T, C, E>>,
}

impl<T, C, E: Environment> Clone for Realtime<T, C, E> {
    fn clone(&self) -> Self {
        Self { runtime: Arc::clone(&self.runtime) }
    }
}

impl<T, C, E: Environment> std::fmt::Debug for Realtime<T, C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realtime").field("url", &self.runtime.url).finish_non_exhaustive()
    }
}

impl<T, C> Realtime<T, C, SystemEnv>
where
    T: Transport,
    C: CredentialSource,
{
    /// Create a manager on the tokio clock. Nothing connects until
    /// [`Realtime::connect`] is called.
    pub fn new(config: RealtimeConfig, transport: T, credentials: C) -> Self {
        Self::with_env(config, transport, credentials, SystemEnv)
    }
}

impl<T, C, E> Realtime<T, C, E>
where
    T: Transport,
    C: CredentialSource,
    E: Environment,
{
    /// Create a manager on a custom environment.
    pub fn with_env(config: RealtimeConfig, transport: T, credentials: C, env: E) -> Self {
        let RealtimeConfig { base_url, connection } = config;
        let inner = Inner {
            machine: Connection::new(connection),
            link: None,
            opening: None,
            timers: HashMap::new(),
            in_flight: None,
            bridge: LifecycleBridge::new(),
            next_connect: 0,
            status_revision: 0,
            last_error: None,
            shut_down: false,
        };
        let runtime = Runtime {
            transport,
            credentials,
            env,
            url: base_url,
            inner: Mutex::new(inner),
            listeners: ListenerRegistry::new(),
            observers: StateObservers::default(),
            errors: ErrorObservers::default(),
        };
        Self { runtime: Arc::new(runtime) }
    }

    /// Connect, or join the connect already in progress.
    ///
    /// Concurrent calls share one attempt and resolve together. Resolves
    /// `Ok` once connected (rooms have been replayed by then). Transient
    /// failures are retried with backoff before this resolves; auth and
    /// capacity rejections resolve it immediately.
    ///
    /// A call made while an attempt is already running on a credential
    /// snapshot asks the credential source again. If the identity changed,
    /// the running attempt is rejected with [`ConnectError::Aborted`] and a
    /// new one starts with the new credential.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let runtime = &self.runtime;
        let joined = {
            let mut inner = runtime.inner.lock();
            if inner.shut_down {
                return Err(ConnectError::Aborted);
            }
            let running =
                inner.in_flight.as_ref().map(|in_flight| (in_flight.started, in_flight.future.clone()));
            match running {
                // Still fetching a credential; it is as fresh as ours would be.
                Some((false, future)) => Some(future),
                Some((true, _)) => None,
                None => {
                    let (id, future) = inner.track_connect(false);
                    tokio::spawn(Arc::clone(runtime).run_connect(id));
                    Some(future)
                },
            }
        };
        if let Some(future) = joined {
            return future.await;
        }

        let credential = runtime.credentials.credential().await;
        let pending = {
            let mut inner = runtime.inner.lock();
            if inner.shut_down {
                return Err(ConnectError::Aborted);
            }
            let current =
                inner.in_flight.as_ref().map(|in_flight| (in_flight.started, in_flight.future.clone()));
            match current {
                Some((false, future)) => future,
                Some((true, future)) if inner.machine.credential() == credential.as_ref() => future,
                _ => {
                    if inner.in_flight.is_some() {
                        tracing::info!("credential changed during connect, restarting attempt");
                        inner.abort_in_flight();
                    }
                    let (_, future) = inner.track_connect(true);
                    runtime.start_connect(inner, credential);
                    future
                },
            }
        };
        pending.await
    }

    /// Sign out: close the transport, cancel timers, forget rooms, the
    /// credential snapshot, and any block. Idempotent.
    pub fn disconnect(&self) {
        let runtime = &self.runtime;
        let mut inner = runtime.inner.lock();
        let now = runtime.env.now();
        let actions = inner.machine.disconnect(now);
        let notices = runtime.execute(&mut inner, actions);
        inner.abort_in_flight();
        inner.last_error = None;
        runtime.commit(inner, notices);
    }

    /// Disconnect and release everything. Later `connect()` calls fail with
    /// [`ConnectError::Aborted`].
    pub fn shutdown(&self) {
        self.disconnect();
        {
            let mut inner = self.runtime.inner.lock();
            inner.shut_down = true;
            inner.abort_tasks();
        }
        self.runtime.listeners.clear();
        self.runtime.observers.clear();
        self.runtime.errors.clear();
        tracing::info!("realtime shut down");
    }

    /// Track a room; joins immediately when connected and after every
    /// reconnect. Idempotent.
    pub fn join_room(&self, kind: RoomKind, id: &str) {
        self.runtime.drive(|machine, _| machine.join_room(kind, id));
    }

    /// Stop tracking a room; sends a leave when connected and the room kind
    /// has one.
    pub fn leave_room(&self, kind: RoomKind, id: &str) {
        self.runtime.drive(|machine, _| machine.leave_room(kind, id));
    }

    /// Tracked rooms of `kind`.
    pub fn joined_rooms(&self, kind: RoomKind) -> Vec<String> {
        self.runtime.inner.lock().machine.rooms().rooms(kind).map(str::to_string).collect()
    }

    /// Best-effort send on the current transport.
    ///
    /// Returns `false` (and drops the event) unless connected.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        let inner = self.runtime.inner.lock();
        match inner.machine.emit(Envelope::new(event, data)) {
            Some(ConnectionAction::Send { attempt, envelope }) => inner.send(attempt, envelope),
            _ => false,
        }
    }

    /// Register an event handler. It survives reconnects.
    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        self.runtime.listeners.on(event, handler)
    }

    /// Remove an event handler.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.runtime.listeners.off(event, id)
    }

    /// Register an event handler removed when the guard drops.
    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.runtime.listeners.subscribe(event, handler)
    }

    /// Observe the connected status. Called on every change, in commit
    /// order.
    pub fn add_state_listener(&self, handler: impl Fn(bool) + Send + Sync + 'static) -> ListenerId {
        self.runtime.observers.add(move |connected: &bool| handler(*connected))
    }

    /// Remove a state observer.
    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.runtime.observers.remove(id)
    }

    /// Observe terminal failures: authentication and capacity rejections
    /// and exhausted retries, including those after a drop that no
    /// `connect()` was waiting on. Each failure is reported once.
    pub fn add_error_listener(
        &self,
        handler: impl Fn(&ConnectError) + Send + Sync + 'static,
    ) -> ListenerId {
        self.runtime.errors.add(handler)
    }

    /// Remove an error observer.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.runtime.errors.remove(id)
    }

    /// Most recent terminal failure, cleared by the next successful connect,
    /// [`Realtime::reset_block`] or [`Realtime::disconnect`].
    ///
    /// `Disconnected` with `Some(RetriesExhausted)` means the manager gave
    /// up; with `None` it is waiting on a backoff timer (or idle).
    pub fn last_error(&self) -> Option<ConnectError> {
        self.runtime.inner.lock().last_error.clone()
    }

    /// Full state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.runtime.inner.lock().machine.state()
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Lift an auth or capacity block (e.g. after re-authenticating).
    pub fn reset_block(&self) {
        self.runtime.inner.lock().last_error = None;
        self.runtime.drive(|machine, _| machine.reset_block());
    }

    /// Feed a platform phase change.
    ///
    /// Background closes the transport but keeps rooms and the credential
    /// snapshot; foreground reconnects if that snapshot exists and nothing
    /// blocks reconnection.
    pub fn set_app_phase(&self, phase: AppPhase) {
        let runtime = &self.runtime;
        let mut inner = runtime.inner.lock();
        match inner.bridge.transition(phase) {
            Some(LifecycleAction::Suspend) => {
                let now = runtime.env.now();
                let actions = inner.machine.suspend(now);
                let notices = runtime.execute(&mut inner, actions);
                inner.abort_in_flight();
                runtime.commit(inner, notices);
            },
            Some(LifecycleAction::Resume) => {
                let eligible = inner.machine.resume();
                drop(inner);
                if eligible {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(error) = this.connect().await {
                            tracing::warn!(%error, "reconnect after resume failed");
                        }
                    });
                }
            },
            None => {},
        }
    }

    /// Drive [`Realtime::set_app_phase`] from a phase stream until its
    /// sender is dropped.
    pub fn attach_lifecycle(&self, mut phases: watch::Receiver<AppPhase>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let phase = *phases.borrow_and_update();
            this.set_app_phase(phase);
            while phases.changed().await.is_ok() {
                let phase = *phases.borrow_and_update();
                this.set_app_phase(phase);
            }
        })
    }
}
