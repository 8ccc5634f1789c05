//! Healing pipeline: request-side orchestration, the background job, remediation
//! dispatch and command safety.

pub mod executor;
pub mod orchestrator;
pub mod remediation;
pub mod safety;

pub use executor::HealingJobExecutor;
pub use orchestrator::{
    compute_trend, AutoHealOutcome, DiagnoseOptions, HealResponse, HealingOrchestrator,
    HealthTrend, TrendDirection,
};
pub use remediation::{check_blacklists, RemediationPlan, Remediator};
pub use safety::{check_command, validate_batch, violation};
