#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

//! # Toolgate
//!
//! Resilient client for MCP (Model Context Protocol) tool servers.
//!
//! Toolgate connects an agent runtime to a set of independently operated
//! tool servers, discovers what tools they offer and invokes them on the
//! agent's behalf. Every call is guarded:
//!
//! - **Retry**: transient failures are retried with jittered exponential backoff
//! - **Circuit breaker**: a server that keeps failing is short-circuited until it recovers
//! - **Health monitoring**: idle servers are pinged and marked degraded or unreachable
//! - **Result cache**: idempotent tool results are memoized (LRU, LFU, FIFO or TTL eviction)
//! - **Tool bridge**: discovered tools are exposed as native tools with capability checks
//!
//! ## Quick Start
//!
//! ```bash
//! # List configured servers
//! toolgate servers
//!
//! # Call a tool
//! toolgate call github search_repositories --args '{"query":"tokio"}'
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::future_not_send)]

pub mod core;
pub mod mcp;

// Re-export commonly used types
pub use core::{CallContext, CancelHandle, Config, ServerConfig, TransportConfig};
pub use mcp::{
    CallOptions, CallOutcome, ClientError, ClientManager, ManagerSettings, Tool, ToolOutput,
    ToolRegistry,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "toolgate";
