//! Periodic liveness probing.
//!
//! A [`HealthMonitor`] task probes one target on an interval and feeds the
//! outcome back to it. The task holds only a weak reference, so it ends on
//! its own once the target is dropped; owners abort it on disconnect.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::config::serde_ms;

/// Health probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Whether probing is enabled
    pub enabled: bool,

    /// Time between probes
    #[serde(rename = "interval_ms", with = "serde_ms")]
    pub interval: Duration,

    /// Timeout for a single probe
    #[serde(rename = "probe_timeout_ms", with = "serde_ms")]
    pub probe_timeout: Duration,

    /// Consecutive failed probes before a server is unreachable
    pub unreachable_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unreachable_after: 3,
        }
    }
}

/// Advisory health of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Unreachable,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A change of health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Health state machine fed by probe outcomes.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    consecutive_failures: u32,
    unreachable_after: u32,
}

impl HealthTracker {
    pub fn new(unreachable_after: u32) -> Self {
        Self { state: HealthState::Healthy, consecutive_failures: 0, unreachable_after: unreachable_after.max(1) }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a probe outcome; returns the transition, if any.
    pub fn observe(&mut self, alive: bool) -> Option<Transition> {
        let from = self.state;
        let to = if alive {
            self.consecutive_failures = 0;
            match from {
                HealthState::Unreachable => HealthState::Degraded,
                HealthState::Degraded | HealthState::Healthy => HealthState::Healthy,
            }
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.unreachable_after {
                HealthState::Unreachable
            } else {
                HealthState::Degraded
            }
        };

        self.state = to;
        (from != to).then_some(Transition { from, to })
    }
}

/// Something the monitor can probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Name used in logs.
    fn probe_name(&self) -> &str;

    /// Perform one liveness check bounded by `timeout`.
    async fn probe(&self, timeout: Duration) -> bool;

    /// Receive the outcome of a probe.
    fn observe_probe(&self, alive: bool);
}

/// Spawns probe tasks.
pub struct HealthMonitor;

impl HealthMonitor {
    /// Start probing `target` every `config.interval`.
    ///
    /// The first probe runs one interval after spawning.
    pub fn spawn<P>(target: Weak<P>, config: HealthConfig) -> JoinHandle<()>
    where
        P: HealthProbe + 'static,
    {
        tokio::spawn(async move {
            let period = config.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(target) = target.upgrade() else {
                    break;
                };
                let alive = target.probe(config.probe_timeout).await;
                tracing::debug!(server = %target.probe_name(), alive, "Health probe finished");
                target.observe_probe(alive);
            }
        })
    }
}
