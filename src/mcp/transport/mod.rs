//! Transports carry one JSON-RPC exchange to a tool server.
//!
//! Every variant presents the same [`Transport`] trait; a [`Connector`]
//! turns a [`ServerConfig`] into a live transport.

#[cfg(feature = "http")]
mod http;
mod memory;
mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use memory::{InMemoryTransport, RequestHandler};
pub use stdio::StdioTransport;

use super::error::TransportError;
use crate::core::{ServerConfig, TransportConfig};

/// Which mechanism a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    InMemory,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::InMemory => "memory",
        }
    }
}

/// One request/response channel to a server.
///
/// Implementations must allow concurrent `request` calls. Dropping a
/// `request` future abandons the exchange; a late reply is discarded.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its result.
    ///
    /// JSON-RPC error replies come back as [`TransportError::Remote`].
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError>;

    /// Send a notification; no reply is expected.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    /// Release the underlying resources.
    async fn close(&self) -> Result<(), TransportError>;

    fn kind(&self) -> TransportKind;
}

/// Builds transports from server configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Connector for the stdio and HTTP transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, TransportError> {
        match &config.transport {
            TransportConfig::Stdio { .. } => Ok(Arc::new(StdioTransport::spawn(config)?)),
            #[cfg(feature = "http")]
            TransportConfig::Http { url } => {
                Ok(Arc::new(HttpTransport::new(&config.name, url, &config.credentials)?))
            }
            #[cfg(not(feature = "http"))]
            TransportConfig::Http { .. } => Err(TransportError::Unsupported(
                "http transport requires the `http` feature".to_string(),
            )),
        }
    }
}
