//! Tool bridge: remote tools behind the caller-facing tool interface.
//!
//! Every discovered tool is wrapped in one generic [`BridgedTool`] named
//! `<server>_<tool>`. The [`ToolRegistry`] holds them, checks the caller's
//! capabilities before execution and renders definitions for LLM tool use.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ClientError, ErrorClass};
use super::manager::{CallOutcome, ClientManager};
use super::session::ToolDescriptor;
use crate::core::CallContext;

/// Capability that grants every bridged tool.
pub const BLANKET_CAPABILITY: &str = "integrations";

/// Capability that grants the tools of one server.
pub fn server_capability(server: &str) -> String {
    format!("mcp_{}", server)
}

/// Yes/no view of a caller's capabilities.
pub trait CapabilityCheck: Send + Sync {
    fn has_capability(&self, capability: &str) -> bool;
}

/// A plain set of capability names.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    capabilities: HashSet<String>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

impl<S: Into<String>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self { capabilities: iter.into_iter().map(Into::into).collect() }
    }
}

impl CapabilityCheck for CapabilitySet {
    fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Whether the call was successful
    pub success: bool,
    /// Text content from the result
    pub content: String,
    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category, absent for tool-level errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Whether the result was served from the cache
    #[serde(default)]
    pub from_cache: bool,
    /// Transport attempts made
    #[serde(default)]
    pub attempts: u32,
    /// Wall time of the call
    #[serde(default)]
    pub duration: Duration,
}

impl ToolOutput {
    /// Create a successful result.
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
            error_class: None,
            from_cache: false,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    /// Create an error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()), ..Self::success(String::new()) }
    }

    /// Failed result carrying the category of a client error.
    pub fn from_error(error: &ClientError) -> Self {
        Self { error_class: Some(error.class()), ..Self::error(error.to_string()) }
    }
}

impl From<CallOutcome> for ToolOutput {
    fn from(outcome: CallOutcome) -> Self {
        let content = outcome.result.text_content();
        let base = if outcome.result.is_error() {
            ToolOutput::error(content)
        } else {
            ToolOutput::success(content)
        };
        Self { from_cache: outcome.from_cache, attempts: outcome.attempts, duration: outcome.elapsed, ..base }
    }
}

/// Uniform interface for anything a caller can invoke as a tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Check that `caller` may use this tool.
    fn authorize(&self, caller: &dyn CapabilityCheck) -> Result<(), ClientError>;

    /// Execute the tool. Failures are reported in the output, never panicked.
    async fn execute(&self, ctx: &CallContext, params: Value) -> ToolOutput;
}

/// A remote tool exposed through [`Tool`].
pub struct BridgedTool {
    qualified_name: String,
    descriptor: ToolDescriptor,
    manager: Weak<ClientManager>,
}

impl BridgedTool {
    pub fn new(descriptor: ToolDescriptor, manager: Weak<ClientManager>) -> Self {
        Self { qualified_name: format!("{}_{}", descriptor.server, descriptor.name), descriptor, manager }
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl Tool for BridgedTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn parameters_schema(&self) -> Value {
        self.descriptor.input_schema.clone()
    }

    fn authorize(&self, caller: &dyn CapabilityCheck) -> Result<(), ClientError> {
        let capability = server_capability(&self.descriptor.server);
        if caller.has_capability(BLANKET_CAPABILITY) || caller.has_capability(&capability) {
            Ok(())
        } else {
            Err(ClientError::Unauthorized { tool: self.qualified_name.clone(), capability })
        }
    }

    async fn execute(&self, ctx: &CallContext, params: Value) -> ToolOutput {
        let Some(manager) = self.manager.upgrade() else {
            return ToolOutput::from_error(&ClientError::ServerNotConnected(self.descriptor.server.clone()));
        };
        match manager.call(ctx, &self.descriptor.server, &self.descriptor.name, params).await {
            Ok(outcome) => outcome.into(),
            Err(error) => ToolOutput::from_error(&error),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Qualified name -> (owning server, tool)
    tools: HashMap<String, (String, Arc<dyn Tool>)>,
    /// Server -> qualified names it owns
    by_server: HashMap<String, Vec<String>>,
}

/// Tool registry for tracking available tools.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.names()).finish()
    }
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every tool of `server` in one step.
    ///
    /// A name already owned by another server keeps its first registration.
    pub fn register_server(&self, server: &str, tools: Vec<Arc<dyn Tool>>) {
        let mut inner = self.inner.write();

        if let Some(old) = inner.by_server.remove(server) {
            for name in old {
                inner.tools.remove(&name);
            }
        }

        let mut owned = Vec::with_capacity(tools.len());
        for tool in tools {
            let name = tool.name().to_string();
            if let Some((owner, _)) = inner.tools.get(&name) {
                tracing::warn!(tool = %name, server = %server, owner = %owner, "Tool name collision, keeping first registration");
                continue;
            }
            inner.tools.insert(name.clone(), (server.to_string(), tool));
            owned.push(name);
        }
        inner.by_server.insert(server.to_string(), owned);
    }

    /// Unregister all tools from a server.
    pub fn unregister_server(&self, server: &str) -> usize {
        let mut inner = self.inner.write();
        let Some(names) = inner.by_server.remove(server) else {
            return 0;
        };
        for name in &names {
            inner.tools.remove(name);
        }
        names.len()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.inner.read().tools.get(name).map(|(_, tool)| Arc::clone(tool))
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names registered by one server, sorted.
    pub fn server_tools(&self, server: &str) -> Vec<String> {
        let mut names = self.inner.read().by_server.get(server).cloned().unwrap_or_default();
        names.sort();
        names
    }

    /// Get count of tools.
    pub fn len(&self) -> usize {
        self.inner.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Authorize and run a tool on behalf of `caller`.
    pub async fn execute(
        &self,
        caller: &dyn CapabilityCheck,
        ctx: &CallContext,
        name: &str,
        params: Value,
    ) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            return ToolOutput {
                error_class: Some(ErrorClass::Configuration),
                ..ToolOutput::error(format!("Tool not found: {}", name))
            };
        };
        if let Err(error) = tool.authorize(caller) {
            tracing::warn!(tool = %name, "Unauthorized tool call rejected");
            return ToolOutput::from_error(&error);
        }
        tool.execute(ctx, params).await
    }

    /// Definitions of the tools `caller` may use, in LLM tool-use shape.
    pub fn definitions_for(&self, caller: &dyn CapabilityCheck) -> Vec<Value> {
        let mut tools: Vec<Arc<dyn Tool>> = self
            .inner
            .read()
            .tools
            .values()
            .filter(|(_, tool)| tool.authorize(caller).is_ok())
            .map(|(_, tool)| Arc::clone(tool))
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));

        tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "input_schema": tool.parameters_schema(),
                })
            })
            .collect()
    }
}
