//! Stage worker runtime
//!
//! Every worker type implements [`StageWorker`]. The runtime leases jobs from
//! the worker's topic, runs them under the stage budget, turns every error
//! into a typed failure, and publishes the outcome before settling the job.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use veren_domain::{DomainEvent, FailureKind, StageFailure};

use crate::bus::Publisher;
use crate::errors::PlatformError;
use crate::queue::{Job, JobQueueExt, Lease, RetryOutcome, Topic};
use crate::utils::sanitize_message;

/// Error raised inside a stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Failure(StageFailure),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl From<StageFailure> for StageError {
    fn from(failure: StageFailure) -> Self {
        StageError::Failure(failure)
    }
}

impl StageError {
    pub fn into_failure(self) -> StageFailure {
        match self {
            StageError::Failure(failure) => failure,
            StageError::Platform(err) => StageFailure {
                kind: classify(&err),
                message: err.to_string(),
                metadata: Default::default(),
            },
        }
    }
}

/// Failure kind of a runtime error
pub fn classify(err: &PlatformError) -> FailureKind {
    match err {
        PlatformError::ValidationError(_) | PlatformError::Forbidden(_) => FailureKind::Validation,
        PlatformError::HttpError(_)
        | PlatformError::CommandError(_)
        | PlatformError::RegistryError(_)
        | PlatformError::SourceControlError(_)
        | PlatformError::BusError(_)
        | PlatformError::QueueError(_) => FailureKind::Upstream,
        _ => FailureKind::Internal,
    }
}

/// What a stage produced
#[derive(Debug, Default)]
pub struct StageOutput {
    /// Published before the job is settled
    pub events: Vec<DomainEvent>,
    /// Set when part of the work should run again on another attempt
    pub retry: Option<StageFailure>,
}

impl StageOutput {
    pub fn events(events: Vec<DomainEvent>) -> Self {
        Self { events, retry: None }
    }
}

#[async_trait]
pub trait StageWorker: Send + Sync {
    fn name(&self) -> &'static str;

    fn topic(&self) -> Topic;

    async fn execute(&self, job: &Job) -> Result<StageOutput, StageError>;

    /// Events reporting a failure that will not be retried
    fn failure_events(&self, job: &Job, failure: StageFailure) -> Vec<DomainEvent>;

    /// Called once `events` are on the bus
    async fn published(&self, _job: &Job, _events: &[DomainEvent]) {}

    /// Called once the job will not run again
    async fn settled(&self, _job: &Job) {}

    /// Park exhausted jobs instead of completing them
    fn dead_letter_on_failure(&self) -> bool {
        false
    }
}

/// Shared handles of every stage worker
#[derive(Clone)]
pub struct StageDeps {
    pub queue: Arc<dyn JobQueueExt>,
    pub publisher: Publisher,
    pub stage_timeout: Duration,
}

/// How a job was settled
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    Completed,
    Retrying { attempt: u32, delay: Duration },
    Failed(FailureKind),
    DeadLettered,
    /// Not settled; the lease expires and the job is redelivered
    Unsettled,
}

/// Run one leased job to settlement.
pub async fn process_job(worker: &dyn StageWorker, deps: &StageDeps, lease: &Lease) -> JobDisposition {
    let job = &lease.job;
    info!(
        worker = worker.name(),
        job_id = %job.id,
        deployment_id = %job.deployment_id(),
        attempt = job.attempt,
        "Stage started"
    );

    let result = match tokio::time::timeout(deps.stage_timeout, worker.execute(job)).await {
        Ok(result) => result,
        Err(_) => Err(StageFailure::timeout(format!(
            "{} stage exceeded its {:?} budget",
            worker.name(),
            deps.stage_timeout
        ))
        .into()),
    };

    let (events, failure) = match result {
        Ok(output) => (output.events, output.retry),
        Err(e) => (Vec::new(), Some(e.into_failure())),
    };

    if !events.is_empty() {
        if let Err(e) = publish_all(worker, deps, job, &events).await {
            error!(worker = worker.name(), job_id = %job.id, "Failed to publish stage events: {}", e);
            return JobDisposition::Unsettled;
        }
    }

    let Some(failure) = failure else {
        settle(deps.queue.complete(lease).await, job);
        worker.settled(job).await;
        return JobDisposition::Completed;
    };
    let failure = sanitize(failure, &job.payload.secrets());

    if failure.kind.is_retryable() && !job.is_last_attempt() {
        warn!(
            worker = worker.name(),
            deployment_id = %job.deployment_id(),
            kind = %failure.kind,
            "Stage failed, retrying: {}",
            failure.message
        );
        return match deps.queue.retry(lease, &failure.message).await {
            Ok(RetryOutcome::Scheduled { attempt, delay }) => JobDisposition::Retrying { attempt, delay },
            Ok(RetryOutcome::DeadLettered) => {
                worker.settled(job).await;
                JobDisposition::DeadLettered
            }
            Err(e) => {
                warn!(job_id = %job.id, "Failed to schedule retry: {}", e);
                JobDisposition::Unsettled
            }
        };
    }

    let kind = failure.kind;
    error!(
        worker = worker.name(),
        deployment_id = %job.deployment_id(),
        kind = %kind,
        "Stage failed: {}",
        failure.message
    );

    let reason = failure.message.clone();
    let failure_events = worker.failure_events(job, failure);
    if !failure_events.is_empty() {
        if let Err(e) = publish_all(worker, deps, job, &failure_events).await {
            error!(worker = worker.name(), job_id = %job.id, "Failed to publish failure events: {}", e);
            return JobDisposition::Unsettled;
        }
    }

    let disposition = if worker.dead_letter_on_failure() {
        settle(deps.queue.dead_letter(lease, &reason).await, job);
        error!(
            worker = worker.name(),
            deployment_id = %job.deployment_id(),
            job_id = %job.id,
            "Job exhausted and dead-lettered: {}",
            reason
        );
        JobDisposition::DeadLettered
    } else {
        settle(deps.queue.complete(lease).await, job);
        JobDisposition::Failed(kind)
    };
    worker.settled(job).await;
    disposition
}

async fn publish_all(
    worker: &dyn StageWorker,
    deps: &StageDeps,
    job: &Job,
    events: &[DomainEvent],
) -> Result<(), PlatformError> {
    for event in events {
        deps.publisher.publish(event).await?;
    }
    worker.published(job, events).await;
    Ok(())
}

fn settle(result: Result<(), PlatformError>, job: &Job) {
    match result {
        Ok(()) => debug!(job_id = %job.id, "Job settled"),
        Err(e) => warn!(job_id = %job.id, "Failed to settle job: {}", e),
    }
}

/// Strip secrets from the user-visible parts of a failure
pub fn sanitize(mut failure: StageFailure, secrets: &[&str]) -> StageFailure {
    failure.message = sanitize_message(&failure.message, secrets);
    for value in failure.metadata.values_mut() {
        *value = sanitize_message(value, secrets);
    }
    failure
}

/// Run a pool member of `worker` until shutdown.
pub async fn run<S, F>(
    worker: Arc<dyn StageWorker>,
    deps: StageDeps,
    member: usize,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("{} worker {} starting...", worker.name(), member);

    loop {
        let lease = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("{} worker {} shutting down...", worker.name(), member);
                return;
            }
            lease = deps.queue.reserve(worker.topic()) => lease,
        };

        match lease {
            Ok(lease) => {
                let disposition = process_job(worker.as_ref(), &deps, &lease).await;
                debug!(worker = worker.name(), job_id = %lease.job.id, ?disposition, "Job processed");
            }
            Err(e) => {
                error!("{} worker {} failed to reserve a job: {}", worker.name(), member, e);
                sleep_fn(Duration::from_secs(1)).await;
            }
        }
    }
}
