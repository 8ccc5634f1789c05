//! Per-target circuit breaker.
//!
//! The breaker state lives on the `Target` record so it survives restarts
//! and is shared by every worker. This type only holds the policy and the
//! clock; callers load the target, apply a transition and upsert it.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::errors::HealingError;
use crate::model::{CircuitState, Target};

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Time an opened breaker stays OPEN before admitting a trial
    pub reset_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            reset_after: Duration::minutes(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            reset_after: Duration::seconds(secs as i64),
        }
    }
}

/// How a heal request got past the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, normal operation
    Closed,
    /// The single HALF_OPEN probing attempt
    Trial,
}

/// Why the breaker opened on a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenReason {
    AttemptsExhausted,
    ConsecutiveFailures,
    NonRetryable,
    TrialFailed,
}

/// Outcome details handed to `on_failure`.
#[derive(Debug, Clone, Copy)]
pub struct FailureOutcome {
    pub attempt: u32,
    pub max_attempts: u32,
    pub non_retryable: bool,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Current state, moving OPEN to HALF_OPEN once the reset time passed.
    /// Returns whether the target changed.
    pub fn refresh(&self, target: &mut Target) -> bool {
        if target.breaker.state != CircuitState::Open {
            return false;
        }
        let now = self.clock.now();
        match target.breaker.reset_at {
            Some(reset_at) if now >= reset_at => {
                self.transition(target, CircuitState::HalfOpen);
                true
            }
            None => {
                self.transition(target, CircuitState::HalfOpen);
                true
            }
            Some(_) => false,
        }
    }

    /// Admit a heal request or reject it. A HALF_OPEN admission claims the
    /// trial slot, which stays taken until `on_success`/`on_failure`.
    pub fn admit(&self, target: &mut Target) -> Result<Admission, HealingError> {
        self.refresh(target);
        match target.breaker.state {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::Open => {
                let reset_at = target
                    .breaker
                    .reset_at
                    .unwrap_or_else(|| self.clock.now() + self.config.reset_after);
                warn!(target_id = %target.id, reset_at = %reset_at, "Circuit breaker open, rejecting heal");
                Err(HealingError::CircuitOpen {
                    target_id: target.id.clone(),
                    reset_at,
                })
            }
            CircuitState::HalfOpen => {
                if target.breaker.trial_in_flight {
                    warn!(target_id = %target.id, "Half-open trial already in flight");
                    return Err(HealingError::TrialInFlight {
                        target_id: target.id.clone(),
                    });
                }
                target.breaker.trial_in_flight = true;
                debug!(target_id = %target.id, "Half-open trial admitted");
                Ok(Admission::Trial)
            }
        }
    }

    /// Whether a request would currently be admitted, without claiming the
    /// trial slot.
    pub fn would_admit(&self, target: &Target) -> bool {
        match target.breaker.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !target.breaker.trial_in_flight,
            CircuitState::Open => target
                .breaker
                .reset_at
                .map(|at| self.clock.now() >= at)
                .unwrap_or(true),
        }
    }

    /// A successful heal always closes the breaker.
    pub fn on_success(&self, target: &mut Target) {
        target.consecutive_failures = 0;
        target.breaker.trial_in_flight = false;
        if target.breaker.state != CircuitState::Closed {
            self.transition(target, CircuitState::Closed);
        }
    }

    /// Count a failure and open the breaker when a limit is reached.
    pub fn on_failure(&self, target: &mut Target, outcome: FailureOutcome) -> Option<OpenReason> {
        target.consecutive_failures += 1;
        target.total_failures += 1;

        let was_trial = target.breaker.state == CircuitState::HalfOpen;
        target.breaker.trial_in_flight = false;

        let reason = if was_trial {
            Some(OpenReason::TrialFailed)
        } else if outcome.non_retryable {
            Some(OpenReason::NonRetryable)
        } else if outcome.attempt >= outcome.max_attempts {
            Some(OpenReason::AttemptsExhausted)
        } else if target.consecutive_failures >= target.healing.max_attempts.max(1) {
            Some(OpenReason::ConsecutiveFailures)
        } else {
            None
        };

        if let Some(reason) = reason {
            if target.breaker.state != CircuitState::Open {
                self.open(target);
                info!(
                    target_id = %target.id,
                    reason = ?reason,
                    consecutive_failures = target.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
        }
        reason
    }

    /// Manual reset back to CLOSED.
    pub fn reset(&self, target: &mut Target) {
        target.consecutive_failures = 0;
        target.breaker.trial_in_flight = false;
        self.transition(target, CircuitState::Closed);
    }

    fn open(&self, target: &mut Target) {
        let now = self.clock.now();
        self.transition(target, CircuitState::Open);
        target.breaker.opened_at = Some(now);
        target.breaker.reset_at = Some(now + self.config.reset_after);
    }

    fn transition(&self, target: &mut Target, next: CircuitState) {
        let previous = target.breaker.state;
        target.breaker.state = next;
        if next == CircuitState::Closed {
            target.breaker.opened_at = None;
            target.breaker.reset_at = None;
        }
        if previous != next {
            info!(
                target_id = %target.id,
                old_state = %previous,
                new_state = %next,
                "Circuit breaker state changed"
            );
        }
    }
}
