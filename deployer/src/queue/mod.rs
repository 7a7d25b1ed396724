//! Durable work queue
//!
//! At-least-once delivery with per-job leases. A reserved job is invisible to
//! other workers until its lease expires, after which it is handed out again.

pub mod jobs;
pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::PlatformError;
use crate::queue::jobs::JobPayload;
use crate::utils::CooldownOptions;

pub type JobId = String;

/// Queue topics, one per worker type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Clone,
    Build,
    BackendDeploy,
    Compensation,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Clone => "clone",
            Topic::Build => "build",
            Topic::BackendDeploy => "backend-deploy",
            Topic::Compensation => "compensation",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job delivery policy
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Total attempts, first run included
    pub attempts: u32,
    pub backoff: CooldownOptions,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: CooldownOptions {
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(120),
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: CooldownOptions,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }

    pub fn deployment_id(&self) -> &str {
        self.payload.deployment_id()
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A reserved job. Only the current lease holder may settle it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    pub token: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Scheduled { attempt: u32, delay: Duration },
    DeadLettered,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: Job,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueueExt: Send + Sync {
    /// Add a job. A payload whose dedupe key was already enqueued returns the
    /// existing job id and adds nothing.
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<JobId, PlatformError>;

    /// Wait for the next job on `topic` and lease it.
    async fn reserve(&self, topic: Topic) -> Result<Lease, PlatformError>;

    /// Remove a finished job.
    async fn complete(&self, lease: &Lease) -> Result<(), PlatformError>;

    /// Schedule another attempt after backoff, or dead-letter the job when it
    /// has no attempts left.
    async fn retry(&self, lease: &Lease, reason: &str) -> Result<RetryOutcome, PlatformError>;

    /// Park a job that will not be retried.
    async fn dead_letter(&self, lease: &Lease, reason: &str) -> Result<(), PlatformError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, PlatformError>;
}
