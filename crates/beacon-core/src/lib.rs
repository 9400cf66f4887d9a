//! Beacon Core
//!
//! Sans-IO state machines for a single shared realtime event channel:
//! connection lifecycle with backoff and block handling, room subscription
//! intent, and the application-lifecycle bridge.
//!
//! # Architecture
//!
//! Nothing in this crate performs I/O or reads a clock. Every input carries
//! the current time, and every decision comes back as a list of
//! [`ConnectionAction`]s for a driver (see `beacon-client`) to execute. The
//! same machine therefore runs unchanged against a real socket or a scripted
//! simulation on a paused clock.
//!
//! # Components
//!
//! - [`Connection`]: lifecycle, backoff, auth/capacity blocks, room replay
//! - [`RoomTracker`]: idempotent room intent and replay instructions
//! - [`LifecycleBridge`]: background suspend / foreground resume decisions
//! - [`Envelope`]: `{"event", "data"}` wire frame
//! - [`ConnectError`] / [`ConnectFailure`]: error taxonomy

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod connection;
pub mod credential;
pub mod env;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod rooms;

pub use backoff::{Backoff, BackoffConfig};
pub use connection::{
    AttemptId, BlockKind, CloseReason, Connection, ConnectionAction, ConnectionConfig,
    ConnectionState, TimerId, TimerKind,
};
pub use credential::Credential;
pub use env::{Environment, Timestamp};
pub use envelope::Envelope;
pub use error::{ConnectError, ConnectFailure};
pub use lifecycle::{AppPhase, LifecycleAction, LifecycleBridge};
pub use rooms::{JoinShape, RoomKind, RoomPrimitives, RoomProtocol, RoomTracker};
