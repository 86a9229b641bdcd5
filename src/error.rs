//! Error handling for the stratum bridge
//!
//! Covers both sides of the bridge: miner-facing handler failures, which stay
//! local to one connection, and upstream node failures, which the bridge
//! recovers from by retrying.

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the stratum bridge
#[derive(Error, Debug)]
pub enum Error {
    /// Inbound event is missing parameters or carries the wrong types
    #[error("malformed event from miner: {message}")]
    MalformedEvent { message: String },

    /// Wallet address failed normalization for the configured network
    #[error("invalid wallet format {address}: {message}")]
    InvalidWallet { address: String, message: String },

    /// Writing a reply or push to the miner transport failed
    #[error("failed to send {what}: {source}")]
    SendFailure {
        what: String,
        #[source]
        source: std::io::Error,
    },

    /// A call to the node RPC failed
    #[error("{context}: {message}")]
    UpstreamUnavailable { context: String, message: String },

    /// Node is reachable but has not caught up with the network
    #[error("node at {address} is not synced")]
    NotSynced { address: String },

    /// Block template returned by the node cannot be turned into a job
    #[error("invalid block template: {message}")]
    InvalidTemplate { message: String },

    /// No handler is registered for the event's method
    #[error("unhandled method {method}")]
    UnknownMethod { method: String },

    /// Work submission from a connection that never authorized
    #[error("unauthorized worker: {message}")]
    Unauthorized { message: String },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// HTTP request errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a malformed event error
    pub fn malformed_event(message: impl Into<String>) -> Self {
        Self::MalformedEvent {
            message: message.into(),
        }
    }

    /// Create an invalid wallet error
    pub fn invalid_wallet(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidWallet {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a send failure error
    pub fn send_failure(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::SendFailure {
            what: what.into(),
            source,
        }
    }

    /// Create an upstream error, wrapping the underlying cause with context
    pub fn upstream(context: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::UpstreamUnavailable {
            context: context.into(),
            message: cause.to_string(),
        }
    }

    /// Create a not-synced error
    pub fn not_synced(address: impl Into<String>) -> Self {
        Self::NotSynced {
            address: address.into(),
        }
    }

    /// Create an invalid template error
    pub fn invalid_template(message: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            message: message.into(),
        }
    }

    /// Create an unknown method error
    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self::UnknownMethod {
            method: method.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if the error is worth retrying on the next loop iteration
    ///
    /// A dead miner transport ([`Error::SendFailure`]) is never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UpstreamUnavailable { .. }
            | Error::NotSynced { .. }
            | Error::InvalidTemplate { .. } => true,
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::MalformedEvent { .. } => "malformed_event",
            Error::InvalidWallet { .. } => "invalid_wallet",
            Error::SendFailure { .. } => "send_failure",
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::NotSynced { .. } => "not_synced",
            Error::InvalidTemplate { .. } => "invalid_template",
            Error::UnknownMethod { .. } => "unknown_method",
            Error::Unauthorized { .. } => "unauthorized",
            Error::Config { .. } => "config",
            Error::Http(_) => "http",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Io(_) => "io",
        }
    }
}
