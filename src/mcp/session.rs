//! One logical connection to a tool server.
//!
//! A session owns the handshake result, the discovered tool list and the
//! per-server resilience state (circuit breaker, health tracker, counters).
//! It performs single exchanges; retries and caching live in the manager.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use super::error::{ClientError, TransportError};
use super::protocol::{
    methods, CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult,
};
use super::transport::Transport;
use crate::core::{
    CallRecord, CallStats, CircuitBreaker, CircuitConfig, CircuitPermit, HealthConfig,
    HealthMonitor, HealthProbe, HealthState, HealthTracker, Rejected, RetryConfig, RetryPolicy,
    ServerConfig, ServerStatus, SharedBreaker,
};

/// Upper bound on `tools/list` pages followed during discovery.
const MAX_DISCOVERY_PAGES: usize = 100;

/// A tool offered by a server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// Server that offers the tool
    pub server: String,
    /// Tool name, unique per server
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema of the arguments, passed through untouched
    pub input_schema: Value,
}

/// Resilience settings a session is opened with.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub health: HealthConfig,
}

/// Live connection state for one server.
pub struct Session {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    server_info: Implementation,
    instructions: Option<String>,
    tools: RwLock<Arc<Vec<ToolDescriptor>>>,
    retry: RetryPolicy,
    breaker: SharedBreaker,
    health: Mutex<HealthTracker>,
    stats: CallStats,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.config.name)
            .field("server_info", &self.server_info)
            .field("tools", &self.tools.read().len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Handshake and discover tools over `transport`.
    ///
    /// On any failure the transport is closed before the error is returned.
    pub async fn open(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        settings: &SessionSettings,
    ) -> Result<Arc<Self>, ClientError> {
        let name = config.name.clone();
        match Self::handshake(&config, transport.as_ref()).await {
            Ok((init, tools)) => {
                tracing::debug!(
                    server = %name,
                    remote = %init.server_info.name,
                    tools = tools.len(),
                    "Session established"
                );
                let retry = config.retry.clone().unwrap_or_else(|| settings.retry.clone());
                let circuit = config.circuit.clone().unwrap_or_else(|| settings.circuit.clone());
                Ok(Arc::new(Self {
                    transport,
                    server_info: init.server_info,
                    instructions: init.instructions,
                    tools: RwLock::new(Arc::new(tools)),
                    retry: RetryPolicy::new(retry),
                    breaker: Arc::new(Mutex::new(CircuitBreaker::new(circuit))),
                    health: Mutex::new(HealthTracker::new(settings.health.unreachable_after)),
                    stats: CallStats::default(),
                    monitor: Mutex::new(None),
                    config,
                }))
            }
            Err(error) => {
                if let Err(e) = transport.close().await {
                    tracing::debug!(server = %name, error = %e, "Failed to close transport");
                }
                Err(error)
            }
        }
    }

    async fn handshake(
        config: &ServerConfig,
        transport: &dyn Transport,
    ) -> Result<(InitializeResult, Vec<ToolDescriptor>), ClientError> {
        let connect_err = |source| ClientError::Connect { server: config.name.clone(), source };

        let params = serde_json::to_value(InitializeParams::default())
            .map_err(|e| connect_err(e.into()))?;
        let value = with_timeout(config.timeout, transport.request(methods::INITIALIZE, Some(params)))
            .await
            .map_err(connect_err)?;
        let init: InitializeResult = serde_json::from_value(value)
            .map_err(|e| connect_err(TransportError::Protocol(format!("invalid initialize result: {}", e))))?;

        with_timeout(config.timeout, transport.notify(methods::INITIALIZED, None))
            .await
            .map_err(connect_err)?;

        let tools = discover(config, transport).await.map_err(|source| ClientError::Discovery {
            server: config.name.clone(),
            source,
        })?;

        Ok((init, tools))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Server name and version reported during the handshake.
    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// Snapshot of the discovered tools.
    pub fn tools(&self) -> Arc<Vec<ToolDescriptor>> {
        Arc::clone(&self.tools.read())
    }

    pub fn find_tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.read().iter().find(|t| t.name == name).cloned()
    }

    /// Re-run discovery and replace the tool list.
    pub async fn refresh_tools(&self) -> Result<Arc<Vec<ToolDescriptor>>, ClientError> {
        let tools = discover(&self.config, self.transport.as_ref()).await.map_err(|source| {
            ClientError::Discovery { server: self.config.name.clone(), source }
        })?;
        let tools = Arc::new(tools);
        *self.tools.write() = Arc::clone(&tools);
        Ok(tools)
    }

    /// One `tools/call` exchange bounded by the per-attempt timeout.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, TransportError> {
        let params = serde_json::to_value(CallToolParams { name: tool.to_string(), arguments })?;
        let value =
            with_timeout(self.config.timeout, self.transport.request(methods::TOOLS_CALL, Some(params)))
                .await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("invalid tools/call result: {}", e)))
    }

    /// Ask the breaker to admit one attempt.
    pub fn admit(&self) -> Result<CircuitPermit, Rejected> {
        CircuitPermit::acquire(&self.breaker)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn health(&self) -> HealthState {
        self.health.lock().state()
    }

    /// Fold a finished call into the counters and log it.
    pub fn record(&self, record: &CallRecord<'_>) {
        record.emit();
        self.stats.record(record);
    }

    pub fn status(&self) -> ServerStatus {
        let (circuit, consecutive_failures) = {
            let mut breaker = self.breaker.lock();
            (breaker.state(), breaker.failure_count())
        };
        ServerStatus {
            name: self.config.name.clone(),
            transport: self.config.transport.kind(),
            health: self.health(),
            circuit,
            consecutive_failures,
            tool_count: self.tools.read().len(),
            stats: self.stats.snapshot(),
        }
    }

    /// Start the periodic health probe.
    pub fn start_monitor(self: &Arc<Self>, config: HealthConfig) {
        let handle = HealthMonitor::spawn(Arc::downgrade(self), config);
        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop probing and release the transport.
    pub async fn close(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(server = %self.config.name, error = %e, "Failed to close transport");
        }
    }
}

#[async_trait]
impl HealthProbe for Session {
    fn probe_name(&self) -> &str {
        &self.config.name
    }

    async fn probe(&self, timeout: Duration) -> bool {
        match with_timeout(timeout, self.transport.request(methods::PING, None)).await {
            Ok(_) => true,
            // The server answered, it just does not implement ping.
            Err(e) if e.is_method_not_found() => true,
            Err(e) => {
                tracing::debug!(server = %self.config.name, error = %e, "Health probe failed");
                false
            }
        }
    }

    fn observe_probe(&self, alive: bool) {
        let Some(transition) = self.health.lock().observe(alive) else {
            return;
        };
        tracing::warn!(
            server = %self.config.name,
            from = %transition.from,
            to = %transition.to,
            "Server health changed"
        );
        if transition.to == HealthState::Unreachable {
            self.breaker.lock().force_open();
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(timeout, fut).await.map_err(|_| TransportError::Timeout(timeout))?
}

/// Follow `tools/list` pages until the server stops returning a cursor.
async fn discover(
    config: &ServerConfig,
    transport: &dyn Transport,
) -> Result<Vec<ToolDescriptor>, TransportError> {
    let mut tools = Vec::new();
    let mut names = HashSet::new();
    let mut seen_cursors = HashSet::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_DISCOVERY_PAGES {
        let params = serde_json::to_value(ListToolsParams { cursor: cursor.clone() })?;
        let value =
            with_timeout(config.timeout, transport.request(methods::TOOLS_LIST, Some(params))).await?;
        let page: ListToolsResult = serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("invalid tools/list result: {}", e)))?;

        for tool in page.tools {
            if !names.insert(tool.name.clone()) {
                tracing::warn!(server = %config.name, tool = %tool.name, "Duplicate tool name ignored");
                continue;
            }
            tools.push(ToolDescriptor {
                server: config.name.clone(),
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                input_schema: tool.input_schema,
            });
        }

        match page.next_cursor {
            Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
            Some(next) => {
                return Err(TransportError::Protocol(format!("tools/list cursor {} repeated", next)));
            }
            None => return Ok(tools),
        }
    }

    Err(TransportError::Protocol(format!("tools/list exceeded {} pages", MAX_DISCOVERY_PAGES)))
}
