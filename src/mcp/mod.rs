//! MCP (Model Context Protocol) client.
//!
//! Connects an agent runtime to independently operated tool servers,
//! discovers their tools and invokes them, shielding callers from slow,
//! flaky or dead peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │          Caller (agent runtime, CLI)             │
//! │                      │                           │
//! │               ToolRegistry  (authorization)      │
//! │                      ▼                           │
//! │  ┌─────────────────────────────────────────┐    │
//! │  │            ClientManager                 │    │
//! │  │  • result cache lookup                   │    │
//! │  │  • retry with backoff                    │    │
//! │  │  • per-server circuit breaker            │    │
//! │  └─────────────────────────────────────────┘    │
//! │                      │                           │
//! │      ┌───────────────┼───────────────┐          │
//! │      ▼               ▼               ▼          │
//! │   Session         Session         Session       │
//! │   (stdio)         (http)          (memory)      │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use toolgate::core::{CallContext, ServerConfig};
//! use toolgate::mcp::{ClientManager, ManagerSettings};
//!
//! let manager = ClientManager::new(ManagerSettings::default());
//!
//! manager
//!     .connect(ServerConfig::stdio("github", "npx").with_args(vec![
//!         "-y".into(),
//!         "@modelcontextprotocol/server-github".into(),
//!     ]))
//!     .await?;
//!
//! let tools = manager.list_tools("github")?;
//!
//! let outcome = manager
//!     .call(&CallContext::background(), "github", "search_repositories", args)
//!     .await?;
//! ```

mod bridge;
mod error;
mod manager;
mod protocol;
mod session;
pub mod transport;

pub use bridge::{
    server_capability, BridgedTool, CapabilityCheck, CapabilitySet, Tool, ToolOutput,
    ToolRegistry, BLANKET_CAPABILITY,
};
pub use error::{ClientError, ErrorClass, TransportError};
pub use manager::{CallOptions, CallOutcome, ClientManager, ManagerSettings};
pub use protocol::{
    error_codes, methods, CallToolParams, CallToolResult, Implementation, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsParams, ListToolsResult, McpTool, RequestId, ToolContent, PROTOCOL_VERSION,
};
pub use session::{Session, SessionSettings, ToolDescriptor};
pub use transport::{Connector, DefaultConnector, InMemoryTransport, Transport, TransportKind};
