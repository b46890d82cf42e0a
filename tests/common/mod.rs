//! Shared fixtures for integration tests.
//!
//! A scripted in-process tool server and a connector that hands out
//! transports to it, with knobs for injecting failures.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use toolgate::core::ServerConfig;
use toolgate::mcp::{
    error_codes, Connector, InMemoryTransport, JsonRpcError, Transport, TransportError,
};
use toolgate::{ClientManager, ManagerSettings};

/// What the next `tools/call` does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Echo the tool name and arguments.
    Reply,
    /// Reply with `isError: true`.
    ToolError,
    /// Fail with a transient timeout.
    Timeout,
    /// Fail with the connection dropping.
    Closed,
    /// Fail with a permanent invalid-params rejection.
    InvalidParams,
    /// Never answer.
    Hang,
    /// Answer after a delay.
    Slow(Duration),
}

/// In-process tool server driven by a script.
pub struct ScriptedServer {
    tools: Vec<String>,
    script: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    pings: AtomicU32,
    alive: AtomicBool,
    fail_discovery: AtomicBool,
}

impl ScriptedServer {
    pub fn new(tools: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            tools: tools.iter().map(|t| (*t).to_string()).collect(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            pings: AtomicU32::new(0),
            alive: AtomicBool::new(true),
            fail_discovery: AtomicBool::new(false),
        })
    }

    /// Queue steps for upcoming calls; once drained every call replies.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().extend(steps);
    }

    /// `tools/call` requests received so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::SeqCst);
    }

    async fn handle(&self, method: String, params: Option<Value>) -> Result<Value, TransportError> {
        match method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "scripted", "version": "0.1.0"}
            })),
            "notifications/initialized" => Ok(Value::Null),
            "tools/list" => {
                if self.fail_discovery.load(Ordering::SeqCst) {
                    return Err(TransportError::Remote(JsonRpcError::new(
                        error_codes::INTERNAL_ERROR,
                        "listing unavailable",
                    )));
                }
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|name| {
                        json!({
                            "name": name,
                            "description": format!("The {} tool", name),
                            "inputSchema": {"type": "object", "properties": {}}
                        })
                    })
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            "ping" => {
                self.pings.fetch_add(1, Ordering::SeqCst);
                if self.alive.load(Ordering::SeqCst) {
                    Ok(json!({}))
                } else {
                    Err(TransportError::Timeout(Duration::from_secs(5)))
                }
            }
            "tools/call" => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let params = params.unwrap_or(Value::Null);
                let step = self.script.lock().pop_front().unwrap_or(Step::Reply);
                let text = format!(
                    "{}:{}",
                    params["name"].as_str().unwrap_or_default(),
                    params.get("arguments").cloned().unwrap_or(Value::Null)
                );
                match step {
                    Step::Reply => Ok(json!({"content": [{"type": "text", "text": text}]})),
                    Step::ToolError => Ok(json!({
                        "content": [{"type": "text", "text": "tool blew up"}],
                        "isError": true
                    })),
                    Step::Timeout => Err(TransportError::Timeout(Duration::from_secs(30))),
                    Step::Closed => Err(TransportError::ConnectionClosed),
                    Step::InvalidParams => Err(TransportError::Remote(JsonRpcError::new(
                        error_codes::INVALID_PARAMS,
                        "missing required field",
                    ))),
                    Step::Hang => std::future::pending::<Result<Value, TransportError>>().await,
                    Step::Slow(delay) => {
                        tokio::time::sleep(delay).await;
                        Ok(json!({"content": [{"type": "text", "text": text}]}))
                    }
                }
            }
            _ => Err(TransportError::Remote(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("unknown method {}", method),
            ))),
        }
    }
}

/// Connector that routes each server name to a [`ScriptedServer`].
#[derive(Default)]
pub struct StubConnector {
    servers: Mutex<HashMap<String, Arc<ScriptedServer>>>,
    connects: AtomicU32,
    transports: Mutex<Vec<Arc<InMemoryTransport>>>,
}

impl StubConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, name: &str, server: Arc<ScriptedServer>) {
        self.servers.lock().insert(name.to_string(), server);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every transport handed out so far.
    pub fn transports(&self) -> Vec<Arc<InMemoryTransport>> {
        self.transports.lock().clone()
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let server = self
            .servers
            .lock()
            .get(&config.name)
            .cloned()
            .ok_or_else(|| TransportError::Spawn(format!("no such server: {}", config.name)))?;

        let transport = Arc::new(InMemoryTransport::new(move |method, params| {
            let server = Arc::clone(&server);
            async move { server.handle(method, params).await }
        }));
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport as Arc<dyn Transport>)
    }
}

/// A manager without background probes backed by `connector`.
pub fn manager(connector: &Arc<StubConnector>) -> Arc<ClientManager> {
    manager_with(ManagerSettings::default().without_health_checks(), connector)
}

pub fn manager_with(settings: ManagerSettings, connector: &Arc<StubConnector>) -> Arc<ClientManager> {
    ClientManager::with_connector(settings, Arc::clone(connector) as Arc<dyn Connector>)
}

/// Config for a stub server; the command is never run.
pub fn server(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, "unused")
}
