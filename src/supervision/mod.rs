//! Failure supervision: per-target circuit breaker and retry policy.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, FailureOutcome, OpenReason,
};
pub use retry::{classify_failure, delay_for, FailureClass, RetryDecision, RetryPolicy};
