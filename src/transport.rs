use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone)]
pub enum TransportError {
    /// Transient network failure (timeout, connection reset, non-2xx).
    Network(String),
    /// The lounge token / screen pairing has expired. Terminal for the
    /// current session: the caller must re-pair before reconnecting.
    AuthExpired,
    /// The transport is not linked to a screen yet.
    NotLinked,
    /// Unexpected response from the remote endpoint.
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Network(msg) => write!(f, "transport network: {msg}"),
            TransportError::AuthExpired => write!(f, "transport: auth expired"),
            TransportError::NotLinked => write!(f, "transport: not linked to a screen"),
            TransportError::Protocol(msg) => write!(f, "transport protocol: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

// ---------------------------------------------------------------------------
// Wire-shaped types
// ---------------------------------------------------------------------------

/// A single event received from the lounge long-poll stream.
///
/// The remote protocol tags every event with a string type name and a flat
/// key/value payload; everything beyond that (chunk framing, session ids)
/// is owned by the transport implementation.
#[derive(Debug, Clone)]
pub struct LoungeEvent {
    pub event_type: String,
    pub payload: HashMap<String, String>,
}

impl LoungeEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.payload.insert(key.into(), val.into());
        self
    }
}

/// An outbound remote command.
///
/// `seq` is the per-session monotonically increasing command counter; the
/// remote protocol rejects out-of-order sequence numbers, which is why all
/// sends are serialized through the session's command mutex.
#[derive(Debug, Clone)]
pub struct OutgoingCommand {
    pub seq: u64,
    pub name: &'static str,
    pub args: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Transport interface
// ---------------------------------------------------------------------------

/// The long-poll lounge transport, injected into the session.
///
/// Implementations own the HTTP client, the bind/SID bookkeeping and the
/// wire framing. The session only sees typed events and commands.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Pair with a screen by its persistent screen id.
    async fn pair(&self, screen_id: &str, screen_name: &str) -> Result<()>;

    /// Refresh the lounge token for the paired screen.
    async fn refresh_auth(&self) -> Result<()>;

    /// Whether a usable lounge token is held.
    fn linked(&self) -> bool;

    /// Whether a bound session to the screen exists.
    fn connected(&self) -> bool;

    /// Whether the screen is currently reachable.
    async fn is_available(&self) -> Result<bool>;

    /// Establish (or re-establish) the bound session.
    async fn connect(&self) -> Result<()>;

    /// Open the long-poll event stream. Events arrive strictly in wire
    /// order; the channel closing means the subscription dropped.
    async fn subscribe(&self) -> Result<mpsc::Receiver<LoungeEvent>>;

    /// Send one remote command. Callers must serialize sends themselves.
    async fn send_command(&self, command: OutgoingCommand) -> Result<()>;

    /// Drop the session identifiers without closing the transport. Used
    /// when a blacklisted remote client is detected: the subscription dies
    /// and the outer loop re-pairs from scratch.
    fn clear_session(&self);

    /// Tear down the transport entirely.
    async fn close(&self);
}
