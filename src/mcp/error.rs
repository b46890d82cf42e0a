//! Error types for the tool client.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::protocol::{error_codes, JsonRpcError};
use crate::core::{Interrupted, Retryable};

/// Errors from a single transport exchange.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to spawn server process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Remote(JsonRpcError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported transport: {0}")]
    Unsupported(String),

    #[error("Invalid transport settings: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the same request could succeed if sent again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout(_) | Self::Request(_) => true,
            Self::Http { status, .. } => matches!(status, 408 | 429) || (500..600).contains(status),
            Self::Remote(error) => error.is_server_defined(),
            Self::Spawn(_)
            | Self::Protocol(_)
            | Self::Serialization(_)
            | Self::Unsupported(_)
            | Self::Config(_) => false,
        }
    }

    /// Whether the transport could never be built from its settings.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Unsupported(_) | Self::Config(_))
    }

    /// Whether this is a "method not found" reply (the peer is alive).
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Remote(e) if e.code == error_codes::METHOD_NOT_FOUND)
    }
}

/// Broad category of a failure, for callers deciding what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    Authorization,
    Transient,
    Permanent,
    BreakerOpen,
    Cancelled,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Configuration => "configuration",
            Self::Authorization => "authorization",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::BreakerOpen => "breaker_open",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by the client manager.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Server already connected: {0}")]
    AlreadyConnected(String),

    #[error("Server not connected: {0}")]
    ServerNotConnected(String),

    #[error("Tool not found: {server}/{tool}")]
    ToolNotFound { server: String, tool: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not authorized to use {tool} (requires {capability})")]
    Unauthorized { tool: String, capability: String },

    #[error("Circuit open for {server}, retry after {}ms", .retry_after.as_millis())]
    CircuitOpen { server: String, retry_after: Duration },

    #[error("Call deadline exceeded")]
    Timeout,

    #[error("Call cancelled")]
    Cancelled,

    #[error("{server}/{tool} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        server: String,
        tool: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("{server} rejected the request: {source}")]
    Remote {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: TransportError,
    },

    #[error("Tool discovery failed for {server}: {source}")]
    Discovery {
        server: String,
        #[source]
        source: TransportError,
    },
}

impl ClientError {
    /// Category of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadyConnected(_)
            | Self::ServerNotConnected(_)
            | Self::ToolNotFound { .. }
            | Self::InvalidArguments(_)
            | Self::InvalidConfig(_) => ErrorClass::Configuration,
            Self::Unauthorized { .. } => ErrorClass::Authorization,
            Self::CircuitOpen { .. } => ErrorClass::BreakerOpen,
            Self::Timeout | Self::Cancelled => ErrorClass::Cancelled,
            Self::RetriesExhausted { .. } => ErrorClass::Transient,
            Self::Remote { .. } => ErrorClass::Permanent,
            Self::Connect { source, .. } | Self::Discovery { source, .. } => {
                if source.is_configuration() {
                    ErrorClass::Configuration
                } else if source.is_transient() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
        }
    }
}

impl From<Interrupted> for ClientError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Cancelled => Self::Cancelled,
            Interrupted::DeadlineExceeded => Self::Timeout,
        }
    }
}

impl Retryable for TransportError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}
