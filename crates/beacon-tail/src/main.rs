//! Beacon tail binary.
//!
//! Connects to a realtime endpoint, joins the rooms named on the command
//! line and logs every watched event until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Follow likes on one post
//! BEACON_CREDENTIAL='sess=abc' beacon-tail --post p1 --event postLiked
//!
//! # Follow two conversations against a remote server
//! beacon-tail --url ws://chat.local:3000/realtime --credential 'sess=abc' \
//!     --conversation c1 --conversation c2 --event newMessage --event typing
//! ```

use std::time::Duration;

use beacon_client::{
    DEFAULT_BASE_URL, Realtime, RealtimeConfig, StaticCredential, websocket::WebSocketTransport,
};
use beacon_core::{BackoffConfig, ConnectionConfig, RoomKind};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Beacon realtime tail
#[derive(Parser, Debug)]
#[command(name = "beacon-tail")]
#[command(about = "Follow rooms on a Beacon realtime endpoint")]
#[command(version)]
struct Args {
    /// Realtime endpoint
    #[arg(short, long, default_value = DEFAULT_BASE_URL)]
    url: String,

    /// Session credential, sent as a cookie
    #[arg(short, long, env = "BEACON_CREDENTIAL", hide_env_values = true)]
    credential: String,

    /// Post to follow (repeatable)
    #[arg(long = "post")]
    posts: Vec<String>,

    /// Conversation to follow (repeatable)
    #[arg(long = "conversation")]
    conversations: Vec<String>,

    /// Event name to log (repeatable)
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Reconnect attempts before giving up
    #[arg(long, default_value = "10")]
    max_attempts: u32,

    /// Seconds to wait for the transport to open
    #[arg(long, default_value = "60")]
    connect_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> RealtimeConfig {
        RealtimeConfig {
            base_url: self.url.clone(),
            connection: ConnectionConfig {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                backoff: BackoffConfig {
                    max_attempts: self.max_attempts,
                    ..BackoffConfig::default()
                },
                ..ConnectionConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(url = %args.url, "beacon tail starting");

    let realtime = Realtime::new(
        args.config(),
        WebSocketTransport::new(),
        StaticCredential::new(args.credential.as_str()),
    );

    realtime.add_state_listener(|connected| tracing::info!(connected, "status"));
    realtime.add_error_listener(|error| tracing::warn!(%error, "connection failed"));
    let _subscriptions: Vec<_> = args
        .events
        .iter()
        .map(|event| {
            let name = event.clone();
            realtime.subscribe(event, move |data| tracing::info!(event = %name, %data, "event"))
        })
        .collect();
    if args.events.is_empty() {
        tracing::warn!("no --event given, inbound events will not be logged");
    }

    for post in &args.posts {
        realtime.join_room(RoomKind::Post, post);
    }
    for conversation in &args.conversations {
        realtime.join_room(RoomKind::Conversation, conversation);
    }

    realtime.connect().await?;
    tracing::info!(
        posts = args.posts.len(),
        conversations = args.conversations.len(),
        "connected, waiting for events"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("interrupted, disconnecting");
    realtime.shutdown();

    Ok(())
}
