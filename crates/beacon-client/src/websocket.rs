//! WebSocket transport.
//!
//! One text frame per [`Envelope`]. The credential travels as a `Cookie`
//! header on the upgrade request. Handshake status codes and close codes are
//! mapped onto the connection's failure classes:
//!
//! | signal                    | classified as                        |
//! |---------------------------|--------------------------------------|
//! | HTTP 401 / 403            | `ConnectFailure::Auth`               |
//! | HTTP 429 / 503            | `ConnectFailure::Capacity` + hint    |
//! | other handshake failure   | `ConnectFailure::Network`            |
//! | close 4401                | `CloseReason::Unauthorized`          |
//! | close 4429                | `CloseReason::OverCapacity`          |
//! | any other close frame     | `CloseReason::ServerDisconnect`      |
//! | read/write error          | `CloseReason::TransportError`        |
//! | stream ends, no close     | `CloseReason::TransportClose`        |
//! | heartbeat unanswered      | `CloseReason::PingTimeout`           |

use std::{future::Future, time::Duration};

use beacon_core::{CloseReason, ConnectFailure, Credential, Envelope};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header},
        protocol::CloseFrame,
    },
};

use crate::transport::{Inbound, OpenRequest, Transport, TransportLink};

/// Close code the server uses to revoke a session.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Close code the server uses to shed load. The close reason may carry a
/// retry hint in seconds.
pub const CLOSE_OVER_CAPACITY: u16 = 4429;

/// Interval between client pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Extra silence tolerated after a ping before the link is declared dead.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(20);

const INBOUND_CAPACITY: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors building the upgrade request.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint is not a valid WebSocket URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Credential cannot be carried in a header.
    #[error("credential is not a valid header value")]
    InvalidCredential(#[from] header::InvalidHeaderValue),
}

/// Heartbeat settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Interval between client pings.
    pub interval: Duration,
    /// Extra silence tolerated after a ping.
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self { interval: DEFAULT_PING_INTERVAL, timeout: DEFAULT_PING_TIMEOUT }
    }
}

/// [`Transport`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport {
    heartbeat: Heartbeat,
}

impl WebSocketTransport {
    /// Transport with default heartbeat settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override heartbeat settings.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

impl Transport for WebSocketTransport {
    fn open(
        &self,
        request: OpenRequest,
    ) -> impl Future<Output = Result<TransportLink, ConnectFailure>> + Send {
        let heartbeat = self.heartbeat;
        async move {
            let upgrade = build_request(&request.url, &request.credential)
                .map_err(|e| ConnectFailure::Network(e.to_string()))?;

            let (socket, _response) = connect_async(upgrade).await.map_err(classify_error)?;
            tracing::debug!(attempt = request.attempt.get(), url = %request.url, "websocket open");

            let (outbound, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
            let task = tokio::spawn(run_socket(socket, outbound_rx, inbound_tx, heartbeat));

            Ok(TransportLink { outbound, inbound, closer: Some(task.abort_handle()) })
        }
    }
}

fn build_request(url: &str, credential: &Credential) -> Result<Request, TransportError> {
    let mut request =
        url.into_client_request().map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let cookie = HeaderValue::from_str(credential.expose())?;
    request.headers_mut().insert(header::COOKIE, cookie);
    Ok(request)
}

fn classify_error(error: tungstenite::Error) -> ConnectFailure {
    match error {
        tungstenite::Error::Http(response) => {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            classify_handshake(response.status().as_u16(), retry_after.as_deref())
        },
        other => ConnectFailure::Network(other.to_string()),
    }
}

/// Classify a rejected upgrade by HTTP status.
pub fn classify_handshake(status: u16, retry_after: Option<&str>) -> ConnectFailure {
    match status {
        401 | 403 => ConnectFailure::Auth,
        429 | 503 => ConnectFailure::Capacity { retry_after: retry_after.and_then(parse_seconds) },
        _ => ConnectFailure::Network(format!("handshake rejected with status {status}")),
    }
}

/// Classify a close frame. `None` is a close frame without a code.
pub fn classify_close(code: Option<u16>, reason: &str) -> CloseReason {
    match code {
        Some(CLOSE_UNAUTHORIZED) => CloseReason::Unauthorized,
        Some(CLOSE_OVER_CAPACITY) => CloseReason::OverCapacity { retry_after: parse_seconds(reason) },
        _ => CloseReason::ServerDisconnect,
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn close_frame_reason(frame: Option<&CloseFrame>) -> CloseReason {
    match frame {
        Some(frame) => classify_close(Some(u16::from(frame.code)), &frame.reason),
        None => classify_close(None, ""),
    }
}

/// Pump frames between the socket and the link channels until either side
/// goes away.
async fn run_socket(
    mut socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    inbound: mpsc::Sender<Inbound>,
    heartbeat: Heartbeat,
) {
    let mut ticker = tokio::time::interval(heartbeat.interval);
    ticker.tick().await;
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                let Some(envelope) = outgoing else {
                    // Client side closed the link.
                    let _ = socket.close(None).await;
                    return;
                };
                match envelope.to_json() {
                    Ok(json) => {
                        if let Err(e) = socket.send(Message::text(json)).await {
                            break CloseReason::TransportError(e.to_string());
                        }
                    },
                    Err(e) => tracing::warn!(event = %envelope.event, error = %e, "unencodable envelope"),
                }
            },
            incoming = socket.next() => {
                last_seen = Instant::now();
                match incoming {
                    Some(Ok(Message::Text(text))) => match Envelope::from_json(&text) {
                        Ok(envelope) => {
                            if inbound.send(Inbound::Event(envelope)).await.is_err() {
                                return;
                            }
                        },
                        Err(e) => tracing::debug!(error = %e, "dropping malformed frame"),
                    },
                    Some(Ok(Message::Close(frame))) => break close_frame_reason(frame.as_ref()),
                    Some(Ok(_)) => {},
                    Some(Err(e)) => break CloseReason::TransportError(e.to_string()),
                    None => break CloseReason::TransportClose,
                }
            },
            _ = ticker.tick() => {
                if last_seen.elapsed() > heartbeat.interval + heartbeat.timeout {
                    break CloseReason::PingTimeout;
                }
                if let Err(e) = socket.send(Message::Ping(Vec::new().into())).await {
                    break CloseReason::TransportError(e.to_string());
                }
            },
        }
    };

    tracing::debug!(%reason, "websocket closed");
    let _ = inbound.send(Inbound::Closed(reason)).await;
}
