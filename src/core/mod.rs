//! Resilience building blocks shared by every server connection.
//!
//! This module contains the pieces the client manager composes around each
//! remote call: cancellation, retry, circuit breaking, result caching,
//! health probing, counters and configuration.

mod cache;
mod circuit;
mod config;
mod context;
mod health;
mod metrics;
mod retry;

pub use cache::{fingerprint, CacheConfig, CacheKey, CacheStats, EvictionPolicy, ResultCache};
pub use circuit::{
    Admission, CircuitBreaker, CircuitConfig, CircuitPermit, CircuitState, Rejected, SharedBreaker,
};
pub use config::{Config, ServerConfig, TransportConfig, DEFAULT_CALL_TIMEOUT};
pub use context::{CallContext, CancelHandle, Interrupted};
pub use health::{HealthConfig, HealthMonitor, HealthProbe, HealthState, HealthTracker, Transition};
pub use metrics::{CallOutcomeKind, CallRecord, CallStats, CallStatsSnapshot, ServerStatus};
pub use retry::{Backoff, RetryConfig, RetryError, RetryOutcome, RetryPolicy, Retryable};
