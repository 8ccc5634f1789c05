//! Retry classification and backoff.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

use crate::model::RetryStrategy;

/// Word-bounded patterns of transient failures.
pub const RETRYABLE_PATTERNS: &[&str] = &[
    r"\btime(d)? ?out\b",
    r"\bconnections?\b",
    r"\bnetwork\b",
    r"\brate.?limit(ed)?\b",
    r"\btoo many requests\b",
    r"\btemporarily unavailable\b",
    r"\beconnreset\b",
    r"\betimedout\b",
];

/// Word-bounded patterns of failures that will not go away on their own.
/// Checked before `RETRYABLE_PATTERNS`.
pub const NON_RETRYABLE_PATTERNS: &[&str] = &[
    r"\b(un)?auth(entication|enticated|ori[sz]ation|ori[sz]ed)?\b",
    r"\bpermissions?\b",
    r"\bdenied\b",
    r"\bforbidden\b",
    r"\bnot found\b",
    r"\binvalid\b",
    r"\bsyntax\b",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("Invalid regex"))
        .collect()
}

static RETRYABLE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(RETRYABLE_PATTERNS));
static NON_RETRYABLE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(NON_RETRYABLE_PATTERNS));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    NonRetryable,
    Unclassified,
}

/// Classify a rendered error message.
pub fn classify_failure(message: &str) -> FailureClass {
    let lowered = message.to_lowercase();
    if NON_RETRYABLE.iter().any(|p| p.is_match(&lowered)) {
        FailureClass::NonRetryable
    } else if RETRYABLE.iter().any(|p| p.is_match(&lowered)) {
        FailureClass::Retryable
    } else {
        FailureClass::Unclassified
    }
}

/// n-th Fibonacci number with fib(1) = fib(2) = 1, saturating.
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Delay before attempt number `attempt` (1-based) of a retry chain, capped
/// at `max_delay_ms`.
pub fn delay_for(strategy: RetryStrategy, base_ms: u64, attempt: u32, max_delay_ms: u64) -> u64 {
    let attempt = attempt.max(1);
    let delay = match strategy {
        RetryStrategy::Immediate => 0,
        RetryStrategy::Linear => base_ms.saturating_mul(u64::from(attempt)),
        RetryStrategy::Exponential => {
            let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
            base_ms.saturating_mul(factor)
        }
        RetryStrategy::Fibonacci => base_ms.saturating_mul(fibonacci(attempt)),
    };
    delay.min(max_delay_ms)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay_ms: u64 },
    GiveUp { class: FailureClass, reason: String },
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Decides whether a failed execution gets another attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_delay_ms: u64) -> Self {
        Self { max_delay_ms }
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        classify_failure(message) == FailureClass::Retryable
    }

    /// `attempt` is the attempt that just failed. The delay is computed for
    /// the failed attempt's position in the chain, so the first retry waits
    /// one base interval.
    pub fn decide(
        &self,
        message: &str,
        attempt: u32,
        max_attempts: u32,
        strategy: RetryStrategy,
        base_delay_ms: u64,
    ) -> RetryDecision {
        let class = classify_failure(message);
        let decision = if class != FailureClass::Retryable {
            RetryDecision::GiveUp {
                class,
                reason: format!("{:?} failure", class).to_lowercase(),
            }
        } else if attempt >= max_attempts {
            RetryDecision::GiveUp {
                class,
                reason: format!("attempts exhausted ({}/{})", attempt, max_attempts),
            }
        } else {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
                delay_ms: delay_for(strategy, base_delay_ms, attempt, self.max_delay_ms),
            }
        };
        debug!(attempt, max_attempts, class = ?class, decision = ?decision, "Retry decision");
        decision
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3_600_000)
    }
}
