//! In-process transport backed by a handler closure.
//!
//! Used to embed local servers without a process or socket, and as the
//! scripted peer in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use super::{Transport, TransportKind};
use crate::mcp::error::TransportError;

/// Handles one request: `(method, params) -> result`.
pub type RequestHandler =
    Arc<dyn Fn(String, Option<Value>) -> BoxFuture<'static, Result<Value, TransportError>> + Send + Sync>;

/// Transport that dispatches requests to a closure.
pub struct InMemoryTransport {
    handler: RequestHandler,
    closed: AtomicBool,
}

impl InMemoryTransport {
    /// Wrap an async handler.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, TransportError>> + Send + 'static,
    {
        Self::from_handler(Arc::new(move |method: String, params: Option<Value>| {
            handler(method, params).boxed()
        }))
    }

    /// Wrap an already boxed handler.
    pub fn from_handler(handler: RequestHandler) -> Self {
        Self { handler, closed: AtomicBool::new(false) }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        (self.handler)(method.to_string(), params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        // Notifications get no reply; a handler error is only logged.
        if let Err(e) = (self.handler)(method.to_string(), params).await {
            tracing::debug!(method, error = %e, "In-memory notification handler failed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::InMemory
    }
}
