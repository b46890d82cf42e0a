//! Per-server call counters and status snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::circuit::CircuitState;
use super::health::HealthState;

/// How a logical call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcomeKind {
    Success,
    CacheHit,
    ToolError,
    Failed,
    CircuitOpen,
    Interrupted,
}

impl CallOutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::CacheHit => "cache_hit",
            Self::ToolError => "tool_error",
            Self::Failed => "failed",
            Self::CircuitOpen => "circuit_open",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Ephemeral record of one logical call.
#[derive(Debug, Clone)]
pub struct CallRecord<'a> {
    pub server: &'a str,
    pub tool: &'a str,
    pub attempts: u32,
    pub elapsed: Duration,
    pub outcome: CallOutcomeKind,
}

impl CallRecord<'_> {
    /// Emit the record as a structured event.
    pub fn emit(&self) {
        let elapsed_ms = self.elapsed.as_millis() as u64;
        match self.outcome {
            CallOutcomeKind::Success | CallOutcomeKind::CacheHit | CallOutcomeKind::ToolError => {
                tracing::debug!(
                    server = %self.server,
                    tool = %self.tool,
                    attempts = self.attempts,
                    elapsed_ms,
                    outcome = self.outcome.as_str(),
                    "Tool call finished"
                );
            }
            _ => {
                tracing::warn!(
                    server = %self.server,
                    tool = %self.tool,
                    attempts = self.attempts,
                    elapsed_ms,
                    outcome = self.outcome.as_str(),
                    "Tool call failed"
                );
            }
        }
    }
}

/// Lock-free counters for one server.
#[derive(Debug, Default)]
pub struct CallStats {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retried: AtomicU64,
    cache_hits: AtomicU64,
    circuit_rejections: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl CallStats {
    /// Fold a finished call into the counters.
    pub fn record(&self, record: &CallRecord<'_>) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if record.attempts > 1 {
            self.retried.fetch_add(1, Ordering::Relaxed);
        }
        match record.outcome {
            CallOutcomeKind::Success | CallOutcomeKind::ToolError => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.total_latency_ms.fetch_add(record.elapsed.as_millis() as u64, Ordering::Relaxed);
            }
            CallOutcomeKind::CacheHit => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcomeKind::CircuitOpen => {
                self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcomeKind::Failed | CallOutcomeKind::Interrupted => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> CallStatsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let total_latency_ms = self.total_latency_ms.load(Ordering::Relaxed);
        CallStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            avg_latency_ms: if successes == 0 { 0 } else { total_latency_ms / successes },
        }
    }
}

/// Point-in-time copy of [`CallStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStatsSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retried: u64,
    pub cache_hits: u64,
    pub circuit_rejections: u64,
    pub avg_latency_ms: u64,
}

impl CallStatsSnapshot {
    /// Success rate as a percentage over calls that reached a result.
    pub fn success_rate(&self) -> f64 {
        let settled = self.successes + self.failures;
        if settled == 0 {
            return 100.0;
        }
        (self.successes as f64 / settled as f64) * 100.0
    }
}

/// Status of one connected server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: &'static str,
    pub health: HealthState,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub tool_count: usize,
    pub stats: CallStatsSnapshot,
}
