//! Per-connection protocol state

use super::address::Network;
use super::event::{JsonRpcEvent, JsonRpcResponse};
use super::jobs::MiningState;
use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{field, Span};
use uuid::Uuid;

/// Write half of a miner transport
pub type MinerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handshake progress of a connection
///
/// `Subscribed` is reached from `New` on `mining.subscribe`. `Authorized`
/// holds until disconnect: a later subscribe only updates the reported
/// client software and never moves an authorized connection back to
/// `Subscribed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing received yet
    New,
    /// `mining.subscribe` acknowledged
    Subscribed,
    /// Wallet address accepted
    Authorized,
}

/// State and outbound primitives of one miner connection
///
/// Owned by the connection's task and mutated only by handlers running on
/// that task, so nothing here is synchronized.
pub struct ConnectionContext {
    id: ConnectionId,
    remote_addr: String,
    wallet_addr: String,
    worker_name: String,
    remote_app: String,
    /// Assigned nonce-space prefix, empty until assigned
    pub extranonce: String,
    /// Jobs sent to this connection
    pub mining: MiningState,
    state: HandshakeState,
    span: Span,
    writer: MinerWriter,
}

impl ConnectionContext {
    /// Create the context for a freshly accepted connection
    pub fn new(remote_addr: impl Into<String>, writer: MinerWriter) -> Self {
        let id = ConnectionId::new();
        let remote_addr = remote_addr.into();
        let span = tracing::info_span!(
            "connection",
            id = %id,
            remote = %remote_addr,
            worker = field::Empty,
            addr = field::Empty,
        );

        Self {
            id,
            remote_addr,
            wallet_addr: String::new(),
            worker_name: String::new(),
            remote_app: String::new(),
            extranonce: String::new(),
            mining: MiningState::default(),
            state: HandshakeState::New,
            span,
            writer,
        }
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address as reported by the transport
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Normalized payout address, empty until authorized
    pub fn wallet_addr(&self) -> &str {
        &self.wallet_addr
    }

    /// Worker name parsed from `<address>.<worker>`
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Client software name reported on subscribe
    pub fn remote_app(&self) -> &str {
        &self.remote_app
    }

    /// Current handshake state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Whether the connection has completed authorization
    pub fn is_authorized(&self) -> bool {
        self.state == HandshakeState::Authorized
    }

    /// Logging annotation carrying the connection's worker and address
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn mark_subscribed(&mut self, remote_app: Option<&str>) {
        if let Some(app) = remote_app {
            self.remote_app = app.to_string();
        }
        if self.state == HandshakeState::New {
            self.state = HandshakeState::Subscribed;
        }
    }

    /// Record a successful authorization
    ///
    /// `wallet_addr` must already have passed [`super::address::normalize`]
    /// for `network`; the network is recorded on the logging annotation only.
    pub(crate) fn mark_authorized(&mut self, wallet_addr: String, worker_name: String, network: Network) {
        self.span.record("worker", field::display(&worker_name));
        self.span.record("addr", field::display(&wallet_addr));
        tracing::trace!(parent: &self.span, "authorized on {}", network);
        self.wallet_addr = wallet_addr;
        self.worker_name = worker_name;
        self.state = HandshakeState::Authorized;
    }

    /// Send a response correlated to the request it answers
    pub async fn reply(&mut self, response: JsonRpcResponse) -> Result<()> {
        let line = serde_json::to_string(&response)?;
        self.write_line(line, "response").await
    }

    /// Send an unsolicited event with no id correlation
    pub async fn push(&mut self, method: &str, params: Vec<Value>) -> Result<()> {
        let event = JsonRpcEvent::notification(method, params);
        let line = serde_json::to_string(&event)?;
        self.write_line(line, method).await
    }

    async fn write_line(&mut self, mut line: String, what: &str) -> Result<()> {
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::send_failure(what, e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::send_failure(what, e))
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("wallet_addr", &self.wallet_addr)
            .field("worker_name", &self.worker_name)
            .field("remote_app", &self.remote_app)
            .field("extranonce", &self.extranonce)
            .field("state", &self.state)
            .finish()
    }
}
