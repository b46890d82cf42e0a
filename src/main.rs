//! Toolgate - resilient client for MCP tool servers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toolgate::core::TransportConfig;
use toolgate::mcp::ToolContent;
use toolgate::{CallContext, CallOptions, ClientManager, Config, ManagerSettings};

/// Resilient MCP tool client with retries, circuit breaking and result caching
#[derive(Parser)]
#[command(name = "toolgate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ./toolgate.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers without connecting
    Servers,

    /// Connect and list discovered tools
    Tools {
        /// Only show tools from a specific server
        server: Option<String>,
    },

    /// Call a tool
    Call {
        /// Server name
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,

        /// Serve from and store into the result cache
        #[arg(long)]
        cache: bool,

        /// Overall call deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Connect and show health, circuit and call statistics
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG takes precedence over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Servers => cmd_servers(&config),
        Commands::Tools { server } => {
            let manager = connect_all(&config, server.as_deref()).await?;
            let result = cmd_tools(&manager);
            manager.shutdown().await;
            result
        }
        Commands::Call { server, tool, args, cache, timeout_ms } => {
            let manager = connect_all(&config, Some(&server)).await?;
            let result = cmd_call(&manager, &server, &tool, args.as_deref(), cache, timeout_ms).await;
            manager.shutdown().await;
            result
        }
        Commands::Status { json } => {
            let manager = connect_all(&config, None).await?;
            let result = cmd_status(&manager, json);
            manager.shutdown().await;
            result
        }
    }
}

/// Connect the configured servers (or just `only`), warning about failures.
async fn connect_all(config: &Config, only: Option<&str>) -> Result<Arc<ClientManager>> {
    if config.servers.is_empty() {
        anyhow::bail!("No servers configured.");
    }

    let servers: Vec<_> = match only {
        Some(name) => {
            let server = config
                .server(name)
                .with_context(|| format!("Server '{}' not found in configuration", name))?;
            vec![server.clone()]
        }
        None => config.servers.clone(),
    };

    // One-shot commands do not need background probing
    let manager = ClientManager::new(ManagerSettings::from(config).without_health_checks());
    for server in servers {
        let name = server.name.clone();
        if let Err(e) = manager.connect(server).await {
            if only.is_some() {
                return Err(e).with_context(|| format!("Failed to connect to '{}'", name));
            }
            eprintln!("Warning: {}", e);
        }
    }
    Ok(manager)
}

fn cmd_servers(config: &Config) -> Result<()> {
    println!("Configured servers:\n");

    if config.servers.is_empty() {
        println!("  No servers configured.");
        println!("\n  Add servers to toolgate.toml:");
        println!("    [[servers]]");
        println!("    name = \"my-server\"");
        println!("    transport = \"stdio\"");
        println!("    command = \"/path/to/mcp-server\"");
        return Ok(());
    }

    for server in &config.servers {
        match &server.transport {
            TransportConfig::Stdio { command, args, env, .. } => {
                println!("  {} (stdio) - {}", server.name, command);
                if !args.is_empty() {
                    println!("    Args: {}", args.join(" "));
                }
                if !env.is_empty() {
                    let mut keys: Vec<_> = env.keys().cloned().collect();
                    keys.sort();
                    println!("    Env: {}", keys.join(", "));
                }
            }
            TransportConfig::Http { url } => {
                println!("  {} (http) - {}", server.name, url);
            }
        }
        if !server.cacheable_tools.is_empty() {
            println!("    Cacheable: {}", server.cacheable_tools.join(", "));
        }
    }
    println!("\nTotal: {} server(s)", config.servers.len());
    Ok(())
}

fn cmd_tools(manager: &ClientManager) -> Result<()> {
    println!("Available tools:\n");

    let mut total = 0;
    for server in manager.list_servers() {
        for tool in manager.list_tools(&server)? {
            print!("  [{}] {}", tool.server, tool.name);
            if !tool.description.is_empty() {
                print!(" - {}", tool.description);
            }
            println!();

            if let Some(required) = tool.input_schema.get("required").and_then(|r| r.as_array()) {
                let names: Vec<_> = required.iter().filter_map(|v| v.as_str()).collect();
                if !names.is_empty() {
                    println!("    Required: {}", names.join(", "));
                }
            }
            total += 1;
        }
    }

    if total == 0 {
        println!("  No tools available.");
    } else {
        println!("\nTotal: {} tool(s)", total);
    }
    Ok(())
}

async fn cmd_call(
    manager: &ClientManager,
    server: &str,
    tool: &str,
    args: Option<&str>,
    cache: bool,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let arguments: serde_json::Value = match args {
        Some(raw) => serde_json::from_str(raw).context("Invalid JSON arguments")?,
        None => serde_json::json!({}),
    };

    let ctx = match timeout_ms {
        Some(ms) => CallContext::background().with_timeout(Duration::from_millis(ms)),
        None => CallContext::background(),
    };
    let options = if cache { CallOptions::cached() } else { CallOptions::default() };

    let outcome = manager.call_with(&ctx, server, tool, arguments, options).await?;

    for content in &outcome.result.content {
        match content {
            ToolContent::Text { text } => println!("{}", text),
            ToolContent::Image { mime_type, .. } => println!("[Image: {}]", mime_type),
            ToolContent::Resource { resource } => println!("[Resource: {}]", resource),
        }
    }

    tracing::debug!(
        attempts = outcome.attempts,
        from_cache = outcome.from_cache,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        "Call finished"
    );

    if outcome.result.is_error() {
        anyhow::bail!("Tool '{}' reported an error", tool);
    }
    Ok(())
}

fn cmd_status(manager: &ClientManager, json: bool) -> Result<()> {
    let statuses = manager.status();

    if json {
        let out = serde_json::json!({
            "servers": statuses,
            "cache": manager.cache_stats(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No servers connected.");
        return Ok(());
    }

    for status in &statuses {
        println!(
            "  {:<20} {:<6} health={:<11} circuit={:<9} tools={}",
            status.name, status.transport, status.health, status.circuit, status.tool_count
        );
        println!(
            "    calls={} success={:.1}% retried={} cache_hits={} avg={}ms",
            status.stats.calls,
            status.stats.success_rate(),
            status.stats.retried,
            status.stats.cache_hits,
            status.stats.avg_latency_ms
        );
    }

    let cache = manager.cache_stats();
    println!(
        "\nCache: {} entries, {:.1}% hit rate, {} evictions",
        cache.entries,
        cache.hit_rate() * 100.0,
        cache.evictions
    );
    Ok(())
}
