//! Delay-capable job submission and the worker loop that drains it.
//!
//! `LocalJobQueue` is in-process: jobs live in a tokio channel and are lost
//! if the process exits before they run. Their executions stay in the store
//! in `APPROVED`, where the history query shows them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::errors::QueueError;

/// Name every healing job is submitted under.
pub const HEAL_JOB_NAME: &str = "heal-site";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealingJob {
    pub execution_id: String,
    pub target_id: String,
    /// Caller supplied explicit commands
    pub manual_override: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub job_name: String,
    pub delay_ms: u64,
    pub scheduled_for: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: HealingJob, delay: Duration) -> Result<JobHandle, QueueError>;
}

/// Something that can run a dequeued job to completion.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: HealingJob);
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub handle: JobHandle,
    pub job: HealingJob,
    pub delay: Duration,
}

pub struct LocalJobQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
    clock: Arc<dyn Clock>,
}

/// Receiving half of a `LocalJobQueue`.
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<QueuedJob>,
}

impl LocalJobQueue {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, JobReceiver) {
        let (sender, rx) = mpsc::unbounded_channel();
        (Self { sender, clock }, JobReceiver { rx })
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn enqueue(&self, job: HealingJob, delay: Duration) -> Result<JobHandle, QueueError> {
        let delay_ms = delay.as_millis() as u64;
        let handle = JobHandle {
            id: format!("job_{}", uuid::Uuid::new_v4().simple()),
            job_name: HEAL_JOB_NAME.to_string(),
            delay_ms,
            scheduled_for: self.clock.now()
                + chrono::Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64),
        };
        self.sender
            .send(QueuedJob {
                handle: handle.clone(),
                job,
                delay,
            })
            .map_err(|_| QueueError::Closed)?;
        debug!(job_id = %handle.id, delay_ms, "Job enqueued");
        Ok(handle)
    }
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<QueuedJob> {
        self.rx.recv().await
    }

    /// Next job already waiting in the channel, ignoring its delay.
    pub fn try_recv(&mut self) -> Option<QueuedJob> {
        self.rx.try_recv().ok()
    }
}

/// Drain `receiver` until every sender is gone or `shutdown` resolves.
///
/// Each job waits out its delay on its own task, then takes one of
/// `concurrency` permits before running. When the queue closes, in-flight
/// jobs are awaited; on shutdown they are aborted.
pub async fn run_worker<R, S>(
    mut receiver: JobReceiver,
    runner: Arc<R>,
    concurrency: usize,
    shutdown: S,
) where
    R: JobRunner + ?Sized + 'static,
    S: Future<Output = ()>,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);

    info!(concurrency, "Healing worker started");
    loop {
        tokio::select! {
            queued = receiver.recv() => {
                let Some(queued) = queued else { break };
                let semaphore = semaphore.clone();
                let runner = runner.clone();
                tasks.spawn(async move {
                    if !queued.delay.is_zero() {
                        tokio::time::sleep(queued.delay).await;
                    }
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    debug!(job_id = %queued.handle.id, execution_id = %queued.job.execution_id, "Running job");
                    runner.run(queued.job).await;
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Healing job task failed");
                }
            }
            _ = &mut shutdown => {
                if !tasks.is_empty() {
                    warn!(pending = tasks.len(), "Shutting down with jobs still pending");
                }
                tasks.shutdown().await;
                info!("Healing worker stopped");
                return;
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Healing job task failed");
        }
    }
    info!("Healing worker stopped: queue closed");
}
