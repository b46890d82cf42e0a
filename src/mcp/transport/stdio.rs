//! JSON-RPC over a child process's stdin/stdout.
//!
//! One JSON object per line. Requests from many callers share the pipe: a
//! writer mutex serializes outgoing lines, and a reader task routes each
//! response to its waiter by id.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{Transport, TransportKind};
use crate::core::{ServerConfig, TransportConfig};
use crate::mcp::error::TransportError;
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

#[derive(Default)]
struct Pending {
    waiters: HashMap<i64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

impl Pending {
    fn close(&mut self) {
        self.closed = true;
        // Dropping the senders wakes every waiter with ConnectionClosed.
        self.waiters.clear();
    }
}

/// Removes a waiter when its request future is dropped.
struct PendingGuard {
    pending: Arc<Mutex<Pending>>,
    id: i64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().waiters.remove(&self.id);
    }
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: tokio::sync::Mutex<ChildStdin>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicI64,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn the configured command and start routing its output.
    pub fn spawn(config: &ServerConfig) -> Result<Self, TransportError> {
        let TransportConfig::Stdio { command, args, env, cwd } = &config.transport else {
            return Err(TransportError::Unsupported(format!(
                "{} is not a stdio server",
                config.name
            )));
        };

        let mut cmd = Command::new(command);
        cmd.args(args);

        // Credentials reach stdio servers as environment variables.
        for (key, value) in env.iter().chain(config.credentials.iter()) {
            let expanded = shellexpand::env(value).unwrap_or_else(|_| value.as_str().into());
            cmd.env(key, expanded.as_ref());
        }

        if let Some(cwd) = cwd {
            cmd.current_dir(shellexpand::tilde(cwd).as_ref());
        }

        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        let mut child =
            cmd.spawn().map_err(|e| TransportError::Spawn(format!("{}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("Failed to capture stdout".to_string()))?;

        let pending = Arc::new(Mutex::new(Pending::default()));
        let mut tasks = vec![tokio::spawn(read_responses(
            config.name.clone(),
            stdout,
            Arc::clone(&pending),
        ))];

        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {}", line);
                }
            }));
        }

        tracing::debug!(server = %config.name, command = %command, "Spawned server process");

        Ok(Self {
            server_name: config.name.clone(),
            writer: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicI64::new(1),
            child: tokio::sync::Mutex::new(Some(child)),
            tasks,
        })
    }

    async fn write_line(&self, mut line: String) -> Result<(), TransportError> {
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_responses(server: String, stdout: ChildStdout, pending: Arc<Mutex<Pending>>) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "Failed to read from stdout");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Anything that is not a response to us (logs, server requests) is skipped.
        let response = match serde_json::from_str::<Value>(trimmed) {
            Ok(message) if message.get("method").is_none() => {
                match serde_json::from_value::<JsonRpcResponse>(message) {
                    Ok(response) => response,
                    Err(_) => continue,
                }
            }
            _ => {
                tracing::debug!(server = %server, "Ignoring non-response line");
                continue;
            }
        };

        let Some(RequestId::Number(id)) = response.id else {
            tracing::debug!(server = %server, "Ignoring response without numeric id");
            continue;
        };

        let waiter = pending.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!(server = %server, id, "Discarding late response"),
        }
    }

    tracing::debug!(server = %server, "Server stdout closed");
    pending.lock().close();
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(TransportError::ConnectionClosed);
            }
            pending.waiters.insert(id, tx);
        }
        let _guard = PendingGuard { pending: Arc::clone(&self.pending), id };

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        tracing::debug!(server = %self.server_name, id, method, "Sending request");
        self.write_line(line).await?;

        let response = rx.await.map_err(|_| TransportError::ConnectionClosed)?;
        response.into_value().map_err(TransportError::Remote)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        if self.pending.lock().closed {
            return Err(TransportError::ConnectionClosed);
        }
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_line(line).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pending.lock().close();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        for task in &self.tasks {
            task.abort();
        }
        tracing::debug!(server = %self.server_name, "Server process stopped");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ServerConfig {
        ServerConfig::stdio(name, "sh").with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_spawn_missing_command() {
        let config = ServerConfig::stdio("ghost", "definitely-not-a-real-binary-toolgate");
        assert!(matches!(StdioTransport::spawn(&config), Err(TransportError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        // Replies to the first request with its own id.
        let script = r#"read line; id=$(echo "$line" | sed 's/.*"id":\([0-9]*\).*/\1/'); echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"ok\":true}}"; sleep 1"#;
        let transport = StdioTransport::spawn(&sh("echo", script)).unwrap();

        let value = transport.request("ping", None).await.unwrap();
        assert_eq!(value["ok"], true);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_fails_pending_requests() {
        let transport = StdioTransport::spawn(&sh("quitter", "read line; exit 0")).unwrap();
        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
        assert!(matches!(
            transport.request("ping", None).await,
            Err(TransportError::ConnectionClosed | TransportError::Io(_))
        ));
    }
}
