//! In-process job queue

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::PlatformError;
use crate::queue::jobs::JobPayload;
use crate::queue::{DeadLetter, Job, JobId, JobOptions, JobQueueExt, Lease, RetryOutcome, Topic};
use crate::utils::{calc_exp_backoff, generate_uuid};

/// Queue options
#[derive(Debug, Clone)]
pub struct Options {
    /// How long a reserved job stays invisible to other workers
    pub lease_duration: Duration,

    /// Upper bound on how long an idle `reserve` sleeps between checks
    pub idle_poll_interval: Duration,

    /// How long a settled job still absorbs enqueues with its dedupe key
    pub settled_key_ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(660),
            idle_poll_interval: Duration::from_secs(1),
            settled_key_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EntryState {
    Ready { not_before: Instant },
    Leased { token: u64, deadline: Instant },
}

#[derive(Debug)]
struct Entry {
    job: Job,
    seq: u64,
    state: EntryState,
}

#[derive(Debug)]
struct Key {
    job_id: JobId,
    /// Set once the job left the queue
    settled_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<JobId, Entry>,
    /// Dedupe keys of live jobs and of recently settled ones
    keys: HashMap<String, Key>,
    enqueued: HashMap<Topic, usize>,
    dead: Vec<DeadLetter>,
    next_seq: u64,
    next_token: u64,
}

impl Inner {
    /// Take a leased job out of the queue, keeping its key for a while
    fn settle(&mut self, job: &Job, now: Instant) {
        self.entries.remove(&job.id);
        if let Some(key) = self.keys.get_mut(&job.payload.dedupe_key()) {
            if key.job_id == job.id {
                key.settled_at = Some(now);
            }
        }
    }

    fn prune_keys(&mut self, now: Instant, ttl: Duration) {
        self.keys
            .retain(|_, key| key.settled_at.is_none_or(|at| now.duration_since(at) < ttl));
    }

    fn try_reserve(&mut self, topic: Topic, now: Instant, lease_duration: Duration) -> Option<Lease> {
        let id = self
            .entries
            .iter()
            .filter(|(_, e)| e.job.topic() == topic)
            .filter(|(_, e)| match e.state {
                EntryState::Ready { not_before } => not_before <= now,
                EntryState::Leased { deadline, .. } => deadline <= now,
            })
            .min_by_key(|(_, e)| e.seq)
            .map(|(id, _)| id.clone())?;

        self.next_token += 1;
        let token = self.next_token;
        let entry = self.entries.get_mut(&id)?;

        if let EntryState::Leased { .. } = entry.state {
            // Lease expired without settlement: the holder crashed or hung
            entry.job.attempt = (entry.job.attempt + 1).min(entry.job.max_attempts);
            warn!(
                job_id = %id,
                topic = %topic,
                attempt = entry.job.attempt,
                "Job lease expired, redelivering"
            );
        }

        entry.state = EntryState::Leased {
            token,
            deadline: now + lease_duration,
        };

        Some(Lease {
            job: entry.job.clone(),
            token,
        })
    }

    fn next_wake(&self, topic: Topic) -> Option<Instant> {
        self.entries
            .values()
            .filter(|e| e.job.topic() == topic)
            .map(|e| match e.state {
                EntryState::Ready { not_before } => not_before,
                EntryState::Leased { deadline, .. } => deadline,
            })
            .min()
    }

    fn leased_entry(&mut self, lease: &Lease) -> Result<&mut Entry, PlatformError> {
        match self.entries.get_mut(&lease.job.id) {
            Some(entry) => match entry.state {
                EntryState::Leased { token, .. } if token == lease.token => Ok(entry),
                _ => Err(PlatformError::QueueError(format!(
                    "Lease on job {} is no longer held",
                    lease.job.id
                ))),
            },
            None => Err(PlatformError::QueueError(format!(
                "Job {} is not in the queue",
                lease.job.id
            ))),
        }
    }
}

/// Job queue held in process memory
pub struct MemoryJobQueue {
    options: Options,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Jobs currently waiting or leased on `topic`, oldest first
    pub async fn snapshot(&self, topic: Topic) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<&Entry> = inner
            .entries
            .values()
            .filter(|e| e.job.topic() == topic)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.job.clone()).collect()
    }

    /// Number of jobs ever enqueued on `topic`, settled ones included
    pub async fn enqueued_count(&self, topic: Topic) -> usize {
        let inner = self.inner.lock().await;
        inner.enqueued.get(&topic).copied().unwrap_or(0)
    }

    /// Number of dedupe keys held, live and settled
    pub async fn tracked_keys(&self) -> usize {
        self.inner.lock().await.keys.len()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

#[async_trait]
impl JobQueueExt for MemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<JobId, PlatformError> {
        let key = payload.dedupe_key();
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.prune_keys(now, self.options.settled_key_ttl);

        if let Some(existing) = inner.keys.get(&key) {
            debug!(job_id = %existing.job_id, key = %key, "Job already enqueued, skipping");
            return Ok(existing.job_id.clone());
        }

        let id = generate_uuid();
        let topic = payload.topic();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.keys.insert(
            key,
            Key {
                job_id: id.clone(),
                settled_at: None,
            },
        );
        *inner.enqueued.entry(topic).or_default() += 1;
        inner.entries.insert(
            id.clone(),
            Entry {
                job: Job {
                    id: id.clone(),
                    payload,
                    attempt: 1,
                    max_attempts: options.attempts.max(1),
                    backoff: options.backoff,
                    enqueued_at: Utc::now(),
                },
                seq,
                state: EntryState::Ready { not_before: now },
            },
        );
        drop(inner);

        debug!(job_id = %id, topic = %topic, "Job enqueued");
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn reserve(&self, topic: Topic) -> Result<Lease, PlatformError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                if let Some(lease) = inner.try_reserve(topic, now, self.options.lease_duration) {
                    debug!(job_id = %lease.job.id, topic = %topic, attempt = lease.job.attempt, "Job reserved");
                    return Ok(lease);
                }
                inner.next_wake(topic)
            };

            let max_wait = Instant::now() + self.options.idle_poll_interval;
            let wake_at = wake_at.map(|t| t.min(max_wait)).unwrap_or(max_wait);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, lease: &Lease) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        inner.leased_entry(lease)?;
        inner.settle(&lease.job, Instant::now());
        debug!(job_id = %lease.job.id, "Job completed");
        Ok(())
    }

    async fn retry(&self, lease: &Lease, reason: &str) -> Result<RetryOutcome, PlatformError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.leased_entry(lease)?;

        if entry.job.is_last_attempt() {
            let job = entry.job.clone();
            inner.settle(&job, Instant::now());
            inner.dead.push(DeadLetter {
                job,
                reason: reason.to_string(),
                at: Utc::now(),
            });
            warn!(job_id = %lease.job.id, reason = %reason, "Job out of attempts, dead-lettered");
            return Ok(RetryOutcome::DeadLettered);
        }

        let delay = calc_exp_backoff(&entry.job.backoff, entry.job.attempt - 1);
        entry.job.attempt += 1;
        entry.state = EntryState::Ready {
            not_before: Instant::now() + delay,
        };
        let attempt = entry.job.attempt;
        drop(inner);

        info!(job_id = %lease.job.id, attempt, ?delay, reason = %reason, "Job scheduled for retry");
        self.notify.notify_waiters();
        Ok(RetryOutcome::Scheduled { attempt, delay })
    }

    async fn dead_letter(&self, lease: &Lease, reason: &str) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock().await;
        let job = inner.leased_entry(lease)?.job.clone();
        inner.settle(&job, Instant::now());
        inner.dead.push(DeadLetter {
            job,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, PlatformError> {
        Ok(self.inner.lock().await.dead.clone())
    }
}
