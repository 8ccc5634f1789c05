use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// The central error type for the healing engine.
///
/// Probe and check failures never reach this type: they are folded into
/// synthetic `ERROR` check results. What surfaces here are rejections the
/// caller must act on (rate limit, open breaker, unsafe command) and genuine
/// infrastructure faults (store, queue, transport).
#[derive(Error, Debug)]
pub enum HealerError {
    #[error("Diagnosis error: {0}")]
    Diagnosis(#[from] DiagnosisError),

    #[error("Healing error: {0}")]
    Healing(#[from] HealingError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum DiagnosisError {
    #[error("Unknown diagnosis profile '{0}'")]
    UnknownProfile(String),

    #[error("Custom profile requires at least one check")]
    EmptyCustomProfile,

    #[error("Unknown check type '{0}'")]
    UnknownCheck(String),

    #[error("Target '{0}' not found")]
    TargetNotFound(String),

    #[error("Target '{target_id}' was diagnosed too recently; retry in {retry_after_secs}s")]
    RateLimited {
        target_id: String,
        retry_after_secs: i64,
    },
}

#[derive(Error, Debug)]
pub enum HealingError {
    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Circuit breaker open for target '{target_id}' until {reset_at}")]
    CircuitOpen {
        target_id: String,
        reset_at: DateTime<Utc>,
    },

    #[error("Circuit breaker for target '{target_id}' is half-open with a trial already in flight")]
    TrialInFlight { target_id: String },

    #[error("Execution '{execution_id}' for target '{target_id}' is still in progress")]
    HealingInProgress {
        target_id: String,
        execution_id: String,
    },

    #[error("Dangerous command blocked: {command} ({reason})")]
    UnsafeCommand { command: String, reason: String },

    #[error("Refusing to touch blacklisted {kind} '{name}'")]
    Blacklisted { kind: String, name: String },

    #[error("Execution '{0}' has no backup to roll back to")]
    NoBackup(String),

    #[error("Remediation failed: {0}")]
    Remediation(String),

    #[error("All fallback themes failed: {0}")]
    AllFallbacksFailed(String),

    #[error("Verification failed with score {score}")]
    VerificationFailed { score: u8 },

    #[error("Healing job timed out after {secs} seconds")]
    JobTimeout { secs: u64 },

    #[error("Manual intervention required: {0}")]
    ManualInterventionRequired(String),

    #[error("Nothing to heal: {0}")]
    NotActionable(String),
}

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Remote command timed out after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to spawn remote command: {0}")]
    Spawn(String),

    #[error("No remote endpoint configured for target '{0}'")]
    UnknownTarget(String),

    #[error("HTTP probe failed: {0}")]
    Http(String),

    #[error("Remote command exited with status {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to serialize store: {0}")]
    Serialization(String),

    #[error("Store document corrupted: {0}")]
    Corrupted(String),
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup creation failed: {0}")]
    Create(String),

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Backup '{0}' not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job queue is closed")]
    Closed,

    #[error("Job rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, HealerError>;

impl HealerError {
    /// Whether the error is a synchronous rejection of the request rather
    /// than a fault. Rejections are normal outcomes for callers.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            HealerError::Diagnosis(DiagnosisError::RateLimited { .. })
                | HealerError::Healing(HealingError::CircuitOpen { .. })
                | HealerError::Healing(HealingError::TrialInFlight { .. })
                | HealerError::Healing(HealingError::HealingInProgress { .. })
                | HealerError::Healing(HealingError::UnsafeCommand { .. })
                | HealerError::Healing(HealingError::Blacklisted { .. })
        )
    }
}

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_REMOTE_ERROR: u8 = 4;
pub const EXIT_SAFETY_ERROR: u8 = 5;
pub const EXIT_REJECTED: u8 = 6;

/// Determine the appropriate process exit code for an error.
pub fn get_exit_code(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<HealerError>() {
        return match err {
            HealerError::Config(_) => EXIT_CONFIG_ERROR,
            HealerError::Diagnosis(DiagnosisError::UnknownProfile(_))
            | HealerError::Diagnosis(DiagnosisError::UnknownCheck(_)) => EXIT_CONFIG_ERROR,
            HealerError::Remote(_) => EXIT_REMOTE_ERROR,
            HealerError::Healing(HealingError::UnsafeCommand { .. })
            | HealerError::Healing(HealingError::Blacklisted { .. }) => EXIT_SAFETY_ERROR,
            other if other.is_rejection() => EXIT_REJECTED,
            _ => EXIT_ERROR,
        };
    }

    if e.downcast_ref::<RemoteError>().is_some() {
        return EXIT_REMOTE_ERROR;
    }

    let msg = e.to_string().to_lowercase();
    if msg.contains("config") {
        EXIT_CONFIG_ERROR
    } else {
        EXIT_ERROR
    }
}
