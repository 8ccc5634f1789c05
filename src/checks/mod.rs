//! Pluggable health checks and the fan-out runner.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::model::{CheckPriority, CheckResult, CheckType};

pub use builtin::register_builtin_checks;

/// What a check needs to know about the site it inspects.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub target_id: String,
    /// Handle passed to the remote executor
    pub remote_handle: String,
    pub path: String,
    pub domain: String,
    /// Lines of error log to inspect
    pub log_depth: usize,
    /// Budget for one check
    pub timeout: Duration,
}

/// A single health probe. Implementations must not share mutable state:
/// the runner executes them concurrently.
#[async_trait::async_trait]
pub trait Check: Send + Sync {
    fn check_type(&self) -> CheckType;

    fn priority(&self) -> CheckPriority {
        self.check_type().default_priority()
    }

    /// Run the probe. An `Err` becomes a synthetic `ERROR` result.
    async fn check(&self, ctx: &CheckContext) -> Result<CheckResult>;
}

/// Typed registry mapping each check type to one implementation.
#[derive(Default, Clone)]
pub struct CheckRegistry {
    checks: HashMap<CheckType, Arc<dyn Check>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check, replacing any previous one of the same type.
    pub fn register(&mut self, check: Arc<dyn Check>) {
        self.checks.insert(check.check_type(), check);
    }

    pub fn get(&self, check_type: CheckType) -> Option<Arc<dyn Check>> {
        self.checks.get(&check_type).cloned()
    }

    pub fn registered(&self) -> Vec<CheckType> {
        let mut types: Vec<CheckType> = self.checks.keys().copied().collect();
        types.sort();
        types
    }

    /// Run `check_types` against one site.
    ///
    /// Always returns one result per distinct requested type, in request
    /// order. Unregistered types yield `SKIPPED`; a check that errors, times
    /// out or panics yields `ERROR` with score 0 without affecting the rest.
    pub async fn run(
        &self,
        ctx: &CheckContext,
        check_types: &[CheckType],
        parallel: bool,
    ) -> Vec<CheckResult> {
        let mut wanted: Vec<CheckType> = Vec::with_capacity(check_types.len());
        for check_type in check_types {
            if !wanted.contains(check_type) {
                wanted.push(*check_type);
            }
        }

        let ctx = Arc::new(ctx.clone());
        let mut results = Vec::with_capacity(wanted.len());

        if parallel {
            let mut handles = Vec::new();
            for check_type in &wanted {
                handles.push((*check_type, self.spawn_check(*check_type, ctx.clone())));
            }
            for (check_type, handle) in handles {
                results.push(self.collect(check_type, handle).await);
            }
        } else {
            for check_type in wanted {
                let handle = self.spawn_check(check_type, ctx.clone());
                results.push(self.collect(check_type, handle).await);
            }
        }

        results
    }

    fn spawn_check(
        &self,
        check_type: CheckType,
        ctx: Arc<CheckContext>,
    ) -> Option<tokio::task::JoinHandle<CheckResult>> {
        let check = self.get(check_type)?;
        Some(tokio::spawn(async move {
            let priority = check.priority();
            let start = Instant::now();
            let outcome = tokio::time::timeout(ctx.timeout, check.check(&ctx)).await;
            let elapsed = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(Ok(mut result)) => {
                    result.priority = priority;
                    if result.duration_ms == 0 {
                        result.duration_ms = elapsed;
                    }
                    result
                }
                Ok(Err(e)) => {
                    warn!(target_id = %ctx.target_id, check = %check_type, error = %e, "Check failed");
                    CheckResult::error(check_type, priority, format!("Check failed: {}", e))
                        .with_duration(elapsed)
                }
                Err(_) => {
                    warn!(target_id = %ctx.target_id, check = %check_type, timeout_secs = ctx.timeout.as_secs(), "Check timed out");
                    CheckResult::error(
                        check_type,
                        priority,
                        format!("Check timed out after {}s", ctx.timeout.as_secs()),
                    )
                    .with_duration(elapsed)
                }
            }
        }))
    }

    async fn collect(
        &self,
        check_type: CheckType,
        handle: Option<tokio::task::JoinHandle<CheckResult>>,
    ) -> CheckResult {
        let Some(handle) = handle else {
            debug!(check = %check_type, "No implementation registered, skipping");
            return CheckResult::skipped(check_type, "No check implementation registered");
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(check = %check_type, error = %e, "Check task aborted");
                CheckResult::error(
                    check_type,
                    self.get(check_type)
                        .map(|c| c.priority())
                        .unwrap_or_else(|| check_type.default_priority()),
                    format!("Check aborted: {}", e),
                )
            }
        }
    }
}
