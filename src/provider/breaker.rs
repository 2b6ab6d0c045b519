//! Consecutive-failure circuit breaker.
//!
//! ## States
//! - **Closed**: calls flow through.
//! - **Open**: calls are skipped until the cooldown has elapsed.
//! - **HalfOpen**: one trial call is allowed; success closes, failure re-opens.
//!
//! Owned by a single writer, so no interior locking.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open: bool,
}

impl CircuitBreaker {
    /// `threshold` consecutive failures open the circuit for `cooldown`.
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            opened_at: None,
            half_open: false,
        }
    }

    /// Whether the next call may be attempted. Moves Open -> HalfOpen once the
    /// cooldown has elapsed.
    pub fn allow(&mut self) -> bool {
        match self.opened_at {
            None => true,
            Some(at) if at.elapsed() >= self.cooldown => {
                if !self.half_open {
                    info!("circuit '{}': cooldown elapsed, probing", self.name);
                }
                self.half_open = true;
                true
            }
            Some(_) => {
                debug!("circuit '{}': call skipped (open)", self.name);
                false
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.opened_at.is_some() {
            info!("circuit '{}': closing (trial call succeeded)", self.name);
        }
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open = false;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.half_open {
            warn!("circuit '{}': trial call failed, re-opening", self.name);
            self.opened_at = Some(Instant::now());
            self.half_open = false;
        } else if self.opened_at.is_none() && self.consecutive_failures >= self.threshold {
            warn!(
                "circuit '{}': opening after {} consecutive failures",
                self.name, self.consecutive_failures
            );
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        match (self.opened_at, self.half_open) {
            (None, _) => CircuitState::Closed,
            (Some(_), true) => CircuitState::HalfOpen,
            (Some(at), false) if at.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            (Some(_), false) => CircuitState::Open,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
