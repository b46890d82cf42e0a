//! JSON-RPC over HTTP POST.
//!
//! Replies may be plain JSON or an SSE stream carrying the response in a
//! `data:` line. The server-assigned `Mcp-Session-Id` is echoed on every
//! later request and used to end the session with `DELETE` on close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use super::{Transport, TransportKind};
use crate::mcp::error::TransportError;
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Streamable-HTTP transport.
pub struct HttpTransport {
    server_name: String,
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    next_id: AtomicI64,
}

impl HttpTransport {
    /// Build a transport; `bearer_token` becomes `Authorization`, other
    /// credentials are sent as headers verbatim.
    pub fn new(
        server_name: &str,
        url: &str,
        credentials: &HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (key, value) in credentials {
            let value = shellexpand::env(value).unwrap_or_else(|_| value.as_str().into());
            if key == "bearer_token" {
                let bearer = HeaderValue::from_str(&format!("Bearer {}", value))
                    .map_err(|e| TransportError::Config(format!("invalid bearer token: {}", e)))?;
                headers.insert(AUTHORIZATION, bearer);
            } else {
                let name = HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| TransportError::Config(format!("invalid header {}: {}", key, e)))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| TransportError::Config(format!("invalid header {}: {}", key, e)))?;
                headers.insert(name, value);
            }
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            server_name: server_name.to_string(),
            url: url.to_string(),
            client,
            headers,
            session_id: RwLock::new(None),
            next_id: AtomicI64::new(1),
        })
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(session_id) = self.session_id.read().clone() {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let response = builder.send().await.map_err(map_reqwest)?;

        if let Some(session_id) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http { status: status.as_u16(), body });
        }
        Ok(response)
    }

    async fn parse_response(
        &self,
        response: reqwest::Response,
        id: i64,
    ) -> Result<JsonRpcResponse, TransportError> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !content_type.contains("text/event-stream") {
            let bytes = response.bytes().await.map_err(map_reqwest)?;
            return serde_json::from_slice(&bytes)
                .map_err(|e| TransportError::Protocol(format!("invalid response body: {}", e)));
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest)?;
            if let Some(response) = decoder.feed(&chunk).iter().find_map(|event| match_response(event, id)) {
                return Ok(response);
            }
        }
        if let Some(response) = decoder.finish().and_then(|event| match_response(&event, id)) {
            return Ok(response);
        }

        Err(TransportError::Protocol(format!("no response for request {} in event stream", id)))
    }
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Works on raw bytes and only decodes whole events, so a character split
/// across network chunks arrives intact. Consecutive `data:` lines are
/// joined with `\n`; a blank line ends the event.
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<u8>,
}

impl SseDecoder {
    /// Feed one chunk and return the payloads of the events it completes.
    fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        // Bytes already pending hold no newline.
        let mut cursor = self.pending.len();
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = buffer[cursor..].iter().position(|&b| b == b'\n') {
            let end = cursor + offset;
            if let Some(event) = self.line(&buffer[start..end]) {
                events.push(event);
            }
            start = end + 1;
            cursor = start;
        }

        buffer.drain(..start);
        self.pending = buffer;
        events
    }

    /// End of stream: an unterminated final event still counts.
    fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.pending);
        if let Some(event) = self.line(&rest) {
            return Some(event);
        }
        (!self.data.is_empty()).then(|| std::mem::take(&mut self.data))
    }

    fn line(&mut self, line: &[u8]) -> Option<Vec<u8>> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return (!self.data.is_empty()).then(|| std::mem::take(&mut self.data));
        }
        if let Some(rest) = line.strip_prefix(b"data:") {
            let rest = rest.strip_prefix(b" ").unwrap_or(rest);
            if !self.data.is_empty() {
                self.data.push(b'\n');
            }
            self.data.extend_from_slice(rest);
        }
        None
    }
}

/// The event payload if it is the response to request `id`.
fn match_response(event: &[u8], id: i64) -> Option<JsonRpcResponse> {
    serde_json::from_slice::<JsonRpcResponse>(event)
        .ok()
        .filter(|response| response.id == Some(RequestId::Number(id)))
}

fn map_reqwest(error: reqwest::Error) -> TransportError {
    let mut chain = error.to_string();
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        chain.push_str(&format!(" -> {}", cause));
        source = cause.source();
    }
    TransportError::Request(chain)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(server = %self.server_name, id, method, "Sending request");

        let response = self.send(self.post(&JsonRpcRequest::new(id, method, params))).await?;
        self.parse_response(response, id).await?.into_value().map_err(TransportError::Remote)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.send(self.post(&JsonRpcNotification::new(method, params))).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let session_id = self.session_id.write().take();
        if let Some(session_id) = session_id {
            let result = self
                .client
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(SESSION_HEADER, session_id)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(server = %self.server_name, error = %e, "Session DELETE failed");
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}
