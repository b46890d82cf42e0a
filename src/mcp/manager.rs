//! Client manager for handling multiple tool servers.
//!
//! Provides the single thread-safe entry point that connects servers,
//! routes tool calls to them and wraps every call in the result cache,
//! the retry policy and the per-server circuit breaker.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::time::Instant;

use super::bridge::{BridgedTool, Tool, ToolRegistry};
use super::error::{ClientError, TransportError};
use super::protocol::CallToolResult;
use super::session::{Session, SessionSettings, ToolDescriptor};
use super::transport::{Connector, DefaultConnector};
use crate::core::{
    CacheConfig, CacheKey, CacheStats, CallContext, CallOutcomeKind, CallRecord, Config,
    HealthConfig, Interrupted, ResultCache, RetryError, Retryable, ServerConfig, ServerStatus,
};

/// Global resilience settings for every session.
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub session: SessionSettings,
    pub cache: CacheConfig,
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            session: SessionSettings {
                retry: config.retry.clone(),
                circuit: config.circuit.clone(),
                health: config.health.clone(),
            },
            cache: config.cache.clone(),
        }
    }
}

impl ManagerSettings {
    /// Disable periodic health probes.
    pub fn without_health_checks(mut self) -> Self {
        self.session.health = HealthConfig { enabled: false, ..self.session.health };
        self
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Force caching on or off; `None` follows the server's `cacheable_tools`.
    pub cacheable: Option<bool>,
    /// TTL for a result cached by this call.
    pub ttl: Option<Duration>,
}

impl CallOptions {
    pub fn cached() -> Self {
        Self { cacheable: Some(true), ttl: None }
    }

    pub fn uncached() -> Self {
        Self { cacheable: Some(false), ttl: None }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of a successful logical call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// What the tool returned (may carry `isError`)
    pub result: CallToolResult,
    /// Transport attempts made (0 for a cache hit)
    pub attempts: u32,
    /// Whether the result came from the cache
    pub from_cache: bool,
    /// Wall time of the whole call, including backoff
    pub elapsed: Duration,
}

/// Why one attempt failed.
#[derive(Debug)]
enum AttemptError {
    Transport(TransportError),
    CircuitOpen(Duration),
    Interrupted(Interrupted),
}

impl Retryable for AttemptError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_transient())
    }
}

/// Manager for all server sessions.
pub struct ClientManager {
    self_ref: Weak<ClientManager>,
    settings: ManagerSettings,
    connector: Arc<dyn Connector>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    lifecycle: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cache: ResultCache<CallToolResult>,
    registry: Arc<ToolRegistry>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("servers", &self.list_servers())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl ClientManager {
    /// Create a manager that spawns real stdio/HTTP transports.
    pub fn new(settings: ManagerSettings) -> Arc<Self> {
        Self::with_connector(settings, Arc::new(DefaultConnector))
    }

    /// Create a manager with a custom transport factory.
    pub fn with_connector(settings: ManagerSettings, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            cache: ResultCache::new(settings.cache.clone()),
            settings,
            connector,
            sessions: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(HashMap::new()),
            registry: Arc::new(ToolRegistry::new()),
        })
    }

    /// Create a manager from loaded configuration (servers are not connected).
    pub fn from_config(config: &Config) -> Arc<Self> {
        Self::new(ManagerSettings::from(config))
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn lifecycle_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.lifecycle.lock().entry(name.to_string()).or_default())
    }

    fn session(&self, name: &str) -> Result<Arc<Session>, ClientError> {
        self.sessions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::ServerNotConnected(name.to_string()))
    }

    fn bridged_tools(&self, tools: &[ToolDescriptor]) -> Vec<Arc<dyn Tool>> {
        tools
            .iter()
            .map(|d| Arc::new(BridgedTool::new(d.clone(), self.self_ref.clone())) as Arc<dyn Tool>)
            .collect()
    }

    /// Connect to a server, discover its tools and register them.
    pub async fn connect(&self, config: ServerConfig) -> Result<(), ClientError> {
        config.validate().map_err(ClientError::InvalidConfig)?;
        let name = config.name.clone();

        let lock = self.lifecycle_lock(&name);
        let _guard = lock.lock().await;

        if self.sessions.read().contains_key(&name) {
            return Err(ClientError::AlreadyConnected(name));
        }

        tracing::debug!(server = %name, transport = config.transport.kind(), "Connecting");
        let transport = self
            .connector
            .connect(&config)
            .await
            .map_err(|source| ClientError::Connect { server: name.clone(), source })?;
        let session = Session::open(config, transport, &self.settings.session).await?;

        let tools = session.tools();
        {
            let mut sessions = self.sessions.write();
            sessions.insert(name.clone(), Arc::clone(&session));
            self.registry.register_server(&name, self.bridged_tools(&tools));
        }

        if self.settings.session.health.enabled {
            session.start_monitor(self.settings.session.health.clone());
        }

        tracing::info!(server = %name, tools = tools.len(), "Connected");
        Ok(())
    }

    /// Disconnect a server and forget everything scoped to it.
    pub async fn disconnect(&self, name: &str) -> Result<(), ClientError> {
        let lock = self.lifecycle_lock(name);
        let _guard = lock.lock().await;

        let session = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .remove(name)
                .ok_or_else(|| ClientError::ServerNotConnected(name.to_string()))?;
            self.registry.unregister_server(name);
            session
        };

        let purged = self.cache.invalidate_server(name);
        session.close().await;

        tracing::info!(server = %name, purged, "Disconnected");
        Ok(())
    }

    /// Names of connected servers, sorted.
    pub fn list_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.sessions.read().contains_key(name)
    }

    /// Tools discovered on a server.
    pub fn list_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, ClientError> {
        Ok(self.session(name)?.tools().as_ref().clone())
    }

    /// Re-run discovery and re-register the server's bridged tools.
    pub async fn refresh_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, ClientError> {
        let session = self.session(name)?;
        let tools = session.refresh_tools().await?;

        let sessions = self.sessions.read();
        // Skip registration if the server was disconnected meanwhile.
        if sessions.get(name).is_some_and(|current| Arc::ptr_eq(current, &session)) {
            self.registry.register_server(name, self.bridged_tools(&tools));
        }
        Ok(tools.as_ref().clone())
    }

    /// Call a tool with default options.
    pub async fn call(
        &self,
        ctx: &CallContext,
        server: &str,
        tool: &str,
        args: Value,
    ) -> Result<CallOutcome, ClientError> {
        self.call_with(ctx, server, tool, args, CallOptions::default()).await
    }

    /// Call a tool through cache, retry and circuit breaker.
    pub async fn call_with(
        &self,
        ctx: &CallContext,
        server: &str,
        tool: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<CallOutcome, ClientError> {
        let start = Instant::now();
        let session = self.session(server)?;

        if session.find_tool(tool).is_none() {
            return Err(ClientError::ToolNotFound { server: server.to_string(), tool: tool.to_string() });
        }
        let arguments = match args {
            Value::Object(_) => Some(args),
            Value::Null => None,
            other => {
                return Err(ClientError::InvalidArguments(format!(
                    "arguments for {} must be a JSON object, got {}",
                    tool,
                    json_type(&other)
                )));
            }
        };
        ctx.check()?;

        let cacheable = self.cache.is_enabled()
            && options.cacheable.unwrap_or_else(|| session.config().is_cacheable(tool));
        let cache_key = cacheable
            .then(|| CacheKey::new(server, tool, arguments.as_ref().unwrap_or(&Value::Null)));

        if let Some(key) = &cache_key {
            if let Some(result) = self.cache.get(key) {
                let outcome = CallOutcome { result, attempts: 0, from_cache: true, elapsed: start.elapsed() };
                session.record(&CallRecord {
                    server,
                    tool,
                    attempts: 0,
                    elapsed: outcome.elapsed,
                    outcome: CallOutcomeKind::CacheHit,
                });
                return Ok(outcome);
            }
        }

        let session_ref: &Session = &session;
        let retried = session
            .retry_policy()
            .run(ctx, move |attempt| {
                let session = session_ref;
                let arguments = arguments.clone();
                async move {
                    tracing::debug!(server = %server, tool = %tool, attempt, "Calling tool");
                    attempt_call(ctx, session, tool, arguments).await
                }
            })
            .await;

        let attempts = retried.attempts;
        let elapsed = start.elapsed();
        let record = |outcome| {
            session.record(&CallRecord { server, tool, attempts, elapsed, outcome });
        };

        let error = match retried.result {
            Ok(result) => {
                if let Some(key) = cache_key {
                    if !result.is_error() {
                        let ttl = options.ttl.or(session.config().cache_ttl);
                        // Held across the put so a concurrent disconnect purges after it.
                        let sessions = self.sessions.read();
                        if sessions.get(server).is_some_and(|current| Arc::ptr_eq(current, &session)) {
                            self.cache.put(key, result.clone(), ttl);
                        } else {
                            tracing::debug!(server = %server, tool = %tool, "Session gone, result not cached");
                        }
                    }
                }
                record(if result.is_error() { CallOutcomeKind::ToolError } else { CallOutcomeKind::Success });
                return Ok(CallOutcome { result, attempts, from_cache: false, elapsed });
            }
            Err(RetryError::Interrupted(interrupted)) => AttemptError::Interrupted(interrupted),
            Err(RetryError::Exhausted(AttemptError::Transport(source))) => {
                record(CallOutcomeKind::Failed);
                return Err(ClientError::RetriesExhausted {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    attempts,
                    source,
                });
            }
            Err(RetryError::Exhausted(e) | RetryError::Fatal(e)) => e,
        };

        match error {
            AttemptError::Transport(source) => {
                record(CallOutcomeKind::Failed);
                Err(ClientError::Remote { server: server.to_string(), source })
            }
            AttemptError::CircuitOpen(retry_after) => {
                record(CallOutcomeKind::CircuitOpen);
                Err(ClientError::CircuitOpen { server: server.to_string(), retry_after })
            }
            AttemptError::Interrupted(interrupted) => {
                record(CallOutcomeKind::Interrupted);
                Err(interrupted.into())
            }
        }
    }

    /// Status of every connected server, sorted by name.
    pub fn status(&self) -> Vec<ServerStatus> {
        let mut sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.name().cmp(b.name()));
        sessions.iter().map(|s| s.status()).collect()
    }

    pub fn server_status(&self, name: &str) -> Result<ServerStatus, ClientError> {
        Ok(self.session(name)?.status())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached result.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// The registry of bridged tools.
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    /// Disconnect every server.
    pub async fn shutdown(&self) {
        for name in self.list_servers() {
            if let Err(e) = self.disconnect(&name).await {
                tracing::debug!(server = %name, error = %e, "Disconnect during shutdown failed");
            }
        }
    }
}

/// One admitted transport exchange.
async fn attempt_call(
    ctx: &CallContext,
    session: &Session,
    tool: &str,
    arguments: Option<Value>,
) -> Result<CallToolResult, AttemptError> {
    let permit = session.admit().map_err(|rejected| AttemptError::CircuitOpen(rejected.retry_after))?;

    match ctx.run(session.call_tool(tool, arguments)).await {
        // Dropping the permit releases the slot without an outcome.
        Err(interrupted) => Err(AttemptError::Interrupted(interrupted)),
        Ok(Ok(result)) => {
            permit.success();
            Ok(result)
        }
        Ok(Err(error)) if error.is_transient() => {
            permit.failure();
            Err(AttemptError::Transport(error))
        }
        Ok(Err(error)) => {
            // A permanent rejection still proves the server is reachable.
            permit.success();
            Err(AttemptError::Transport(error))
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
