//! Per-server circuit breaker.
//!
//! Stops sending calls to a server that keeps failing, and after a cooldown
//! lets exactly one trial call through to detect recovery. Admission is an
//! RAII [`CircuitPermit`]: a permit dropped without an outcome (cancelled
//! call) releases its slot without counting as success or failure.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::config::serde_ms;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, operations proceed normally.
    Closed,
    /// Circuit is open, operations fail immediately.
    Open,
    /// Circuit is half-open, one trial operation is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time to wait before allowing a trial call.
    #[serde(rename = "cooldown_ms", with = "serde_ms")]
    pub cooldown: Duration,

    /// Cap for the cooldown after repeated failed trials.
    #[serde(rename = "max_cooldown_ms", with = "serde_ms")]
    pub max_cooldown: Duration,

    /// Factor applied to the cooldown after each failed trial.
    pub cooldown_multiplier: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            cooldown_multiplier: 2.0,
        }
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call through a closed circuit.
    Normal,
    /// The single trial call of a half-open circuit.
    Trial,
}

/// Rejection from an open circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Time until a trial call will be admitted.
    pub retry_after: Duration,
}

/// Circuit breaker for preventing cascading failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,

    /// Current state.
    state: CircuitState,

    /// Number of consecutive failures.
    failure_count: u32,

    /// Time when circuit was opened.
    opened_at: Option<Instant>,

    /// Cooldown in effect for the current open period.
    current_cooldown: Duration,

    /// Whether the half-open trial slot is taken.
    trial_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitConfig) -> Self {
        let current_cooldown = config.cooldown;
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            current_cooldown,
            trial_in_flight: false,
        }
    }

    /// Get current state (may transition to half-open).
    pub fn state(&mut self) -> CircuitState {
        self.poll_cooldown();
        self.state
    }

    /// Consecutive failures recorded in the closed state.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Cooldown that applies to the current (or next) open period.
    pub fn current_cooldown(&self) -> Duration {
        self.current_cooldown
    }

    fn poll_cooldown(&mut self) {
        if self.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = self.opened_at {
            if opened_at.elapsed() >= self.current_cooldown {
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = false;
            }
        }
    }

    /// Ask to send a call.
    pub fn try_acquire(&mut self) -> Result<Admission, Rejected> {
        self.poll_cooldown();
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen => Err(Rejected { retry_after: Duration::ZERO }),
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(Rejected { retry_after: self.current_cooldown.saturating_sub(elapsed) })
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&mut self, admission: Admission) {
        match (self.state, admission) {
            (CircuitState::Closed, _) => {
                self.failure_count = 0;
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                tracing::info!("Circuit closed after successful trial call");
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.opened_at = None;
                self.trial_in_flight = false;
                self.current_cooldown = self.config.cooldown;
            }
            // Late result from a call admitted before the circuit opened.
            _ => {}
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, admission: Admission) {
        match (self.state, admission) {
            (CircuitState::Closed, _) => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold.max(1) {
                    tracing::warn!(failures = self.failure_count, "Circuit opened");
                    self.open();
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                self.current_cooldown = self
                    .current_cooldown
                    .mul_f64(self.config.cooldown_multiplier.max(1.0))
                    .min(self.config.max_cooldown.max(self.config.cooldown));
                tracing::warn!(
                    cooldown_ms = self.current_cooldown.as_millis() as u64,
                    "Trial call failed, circuit reopened"
                );
                self.open();
            }
            _ => {}
        }
    }

    /// Give back an admission without an outcome.
    pub fn release(&mut self, admission: Admission) {
        if admission == Admission::Trial && self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    /// Open the circuit regardless of call volume.
    pub fn force_open(&mut self) {
        if self.state != CircuitState::Open {
            tracing::warn!("Circuit forced open");
            self.open();
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }
}

/// Shared handle to one server's breaker.
pub type SharedBreaker = Arc<Mutex<CircuitBreaker>>;

/// Admission ticket for one attempt.
///
/// Report the outcome with [`CircuitPermit::success`] or
/// [`CircuitPermit::failure`]; dropping it unreported releases the slot.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: SharedBreaker,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit {
    /// Try to admit a call through `breaker`.
    pub fn acquire(breaker: &SharedBreaker) -> Result<Self, Rejected> {
        let admission = breaker.lock().try_acquire()?;
        Ok(Self { breaker: Arc::clone(breaker), admission, settled: false })
    }

    /// How this call was admitted.
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// The attempt succeeded.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.lock().record_success(self.admission);
    }

    /// The attempt failed in a way that counts against availability.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.lock().record_failure(self.admission);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.lock().release(self.admission);
        }
    }
}
