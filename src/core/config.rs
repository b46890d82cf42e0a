//! Configuration management for toolgate.
//!
//! Handles loading configuration from TOML files. Durations are written as
//! integer milliseconds under `*_ms` keys.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cache::CacheConfig;
use super::circuit::CircuitConfig;
use super::health::HealthConfig;
use super::retry::RetryConfig;

/// Serde helpers for `Duration` as integer milliseconds.
pub mod serde_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    /// Same, for `Option<Duration>`.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

/// Default per-attempt timeout for server calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retry settings shared by all servers
    pub retry: RetryConfig,

    /// Circuit breaker settings shared by all servers
    pub circuit: CircuitConfig,

    /// Result cache settings
    pub cache: CacheConfig,

    /// Health probe settings
    pub health: HealthConfig,

    /// Tool servers to connect to
    pub servers: Vec<ServerConfig>,
}

/// How to reach a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a child process and speak over its stdin/stdout.
    Stdio {
        /// Command to run the server
        command: String,

        /// Command arguments
        #[serde(default)]
        args: Vec<String>,

        /// Environment variables
        #[serde(default)]
        env: HashMap<String, String>,

        /// Working directory (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },

    /// POST JSON-RPC to an HTTP endpoint.
    Http {
        /// Endpoint URL
        url: String,
    },
}

impl TransportConfig {
    /// Short label for logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
        }
    }
}

/// Configuration for a single tool server.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name (unique identifier)
    pub name: String,

    /// Transport settings
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Opaque secrets: env vars for stdio, headers for http
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub credentials: HashMap<String, String>,

    /// Per-attempt timeout
    #[serde(rename = "timeout_ms", with = "serde_ms", default = "default_call_timeout")]
    pub timeout: Duration,

    /// Retry override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Circuit breaker override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitConfig>,

    /// Tools whose results may be cached (exact names or `prefix*`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cacheable_tools: Vec<String>,

    /// TTL for cached results of this server
    #[serde(
        rename = "cache_ttl_ms",
        with = "serde_ms::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_ttl: Option<Duration>,
}

fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut credential_keys: Vec<&String> = self.credentials.keys().collect();
        credential_keys.sort();
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("credentials", &credential_keys)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("circuit", &self.circuit)
            .field("cacheable_tools", &self.cacheable_tools)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl ServerConfig {
    fn with_transport(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            credentials: HashMap::new(),
            timeout: DEFAULT_CALL_TIMEOUT,
            retry: None,
            circuit: None,
            cacheable_tools: Vec::new(),
            cache_ttl: None,
        }
    }

    /// Create a stdio server entry.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    /// Create an HTTP server entry.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(name, TransportConfig::Http { url: url.into() })
    }

    /// Add arguments (stdio only).
    pub fn with_args(mut self, new_args: Vec<String>) -> Self {
        if let TransportConfig::Stdio { args, .. } = &mut self.transport {
            *args = new_args;
        }
        self
    }

    /// Add environment variables (stdio only).
    pub fn with_env(mut self, new_env: HashMap<String, String>) -> Self {
        if let TransportConfig::Stdio { env, .. } = &mut self.transport {
            *env = new_env;
        }
        self
    }

    /// Add a credential.
    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Override the circuit breaker settings.
    pub fn with_circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = Some(circuit);
        self
    }

    /// Mark tools as cacheable.
    pub fn with_cacheable_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cacheable_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Set the cache TTL for this server.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Whether results of `tool` may be cached.
    pub fn is_cacheable(&self, tool: &str) -> bool {
        self.cacheable_tools.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => tool.starts_with(prefix),
            None => pattern == tool,
        })
    }

    /// Check the entry for obvious mistakes.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("server name must not be empty".to_string());
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(format!("server name '{}' must not contain whitespace", self.name));
        }
        if self.timeout.is_zero() {
            return Err(format!("server '{}': timeout must be positive", self.name));
        }
        match &self.transport {
            TransportConfig::Stdio { command, .. } if command.trim().is_empty() => {
                Err(format!("server '{}': command must not be empty", self.name))
            }
            TransportConfig::Http { url }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                Err(format!("server '{}': url must be http(s), got '{}'", self.name, url))
            }
            _ => Ok(()),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `toolgate.toml` in current directory
    /// 2. `~/.config/toolgate/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = Path::new("toolgate.toml");
        if local_config.exists() {
            return Self::load_from_file(local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duplicate or malformed server entries.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate().map_err(anyhow::Error::msg)?;
            if !seen.insert(server.name.as_str()) {
                anyhow::bail!("Duplicate server name '{}'", server.name);
            }
        }
        Ok(())
    }

    /// Look up a server entry by name.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|d| d.join("toolgate"))
    }
}
