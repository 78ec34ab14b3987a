//! In-memory implementation of JobQueue
//!
//! Single-process queue for development and tests. Provides the same
//! delivery semantics as the PostgreSQL implementation: priority-then-FIFO
//! ordering, lease timeouts with redelivery, backoff on nack, and bounded
//! tombstone retention.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    EnqueueOptions, Job, JobQueue, LeasedJob, NackOutcome, QueueConfig, QueueError, QueueStats,
};

/// How often blocked lease calls re-check delayed jobs and expired leases
const TICK: Duration = Duration::from_millis(100);

struct Waiting {
    job: Job,
    seq: u64,
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.job.priority == other.job.priority && self.seq == other.seq
    }
}

impl Eq for Waiting {}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiting {
    // Inverted so the heap's max is the lowest priority number, FIFO within
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .job
            .priority
            .cmp(&self.job.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct Delayed {
    ready_at: Instant,
    job: Job,
}

struct InFlight {
    job: Job,
    worker_id: String,
    leased_at: Instant,
}

#[derive(Default)]
struct Inner {
    waiting: BinaryHeap<Waiting>,
    delayed: Vec<Delayed>,
    in_flight: HashMap<Uuid, InFlight>,
    completed_tombstones: VecDeque<Uuid>,
    failed_tombstones: VecDeque<Uuid>,
    completed_total: u64,
    failed_total: u64,
    seq: u64,
    paused: bool,
    closed: bool,
}

impl Inner {
    fn push_waiting(&mut self, job: Job) {
        let seq = self.seq;
        self.seq += 1;
        self.waiting.push(Waiting { job, seq });
    }

    /// Move ready delayed jobs into the waiting heap
    fn promote_delayed(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].ready_at <= now {
                let entry = self.delayed.swap_remove(i);
                self.push_waiting(entry.job);
            } else {
                i += 1;
            }
        }
    }

    /// Redeliver jobs whose lease expired (the worker died or hung)
    fn reclaim_expired(&mut self, lease_timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.duration_since(f.leased_at) > lease_timeout)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            if let Some(flight) = self.in_flight.remove(&lease_id) {
                warn!(
                    task_id = %flight.job.task_id,
                    worker_id = %flight.worker_id,
                    "lease expired, requeueing job"
                );
                self.push_waiting(flight.job);
            }
        }
    }
}

/// In-memory implementation of JobQueue
pub struct InMemoryJobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    config: QueueConfig,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            config,
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, mut job: Job, options: EnqueueOptions) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }

        if let Some(priority) = options.priority {
            job.priority = priority.clamp(1, 10);
        }

        match options.delay {
            Some(delay) if !delay.is_zero() => {
                debug!(task_id = %job.task_id, ?delay, "job delayed");
                inner.delayed.push(Delayed {
                    ready_at: Instant::now() + delay,
                    job,
                });
            }
            _ => inner.push_waiting(job),
        }

        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn lease(&self, worker_id: &str) -> Result<Option<LeasedJob>, QueueError> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Ok(None);
                }

                inner.promote_delayed();
                inner.reclaim_expired(self.config.lease_timeout);

                if !inner.paused {
                    if let Some(Waiting { mut job, .. }) = inner.waiting.pop() {
                        job.attempt_count += 1;
                        let lease_id = Uuid::now_v7();
                        inner.in_flight.insert(
                            lease_id,
                            InFlight {
                                job: job.clone(),
                                worker_id: worker_id.to_string(),
                                leased_at: Instant::now(),
                            },
                        );
                        return Ok(Some(LeasedJob {
                            job,
                            lease_id,
                            worker_id: worker_id.to_string(),
                        }));
                    }
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(TICK) => {}
            }
        }
    }

    async fn ack(&self, leased: &LeasedJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.in_flight.remove(&leased.lease_id).is_some() {
            inner.completed_total += 1;
            inner.completed_tombstones.push_back(leased.job.task_id);
            while inner.completed_tombstones.len() > self.config.retention_completed {
                inner.completed_tombstones.pop_front();
            }
        }
        Ok(())
    }

    async fn nack(&self, leased: &LeasedJob, reason: &str) -> Result<NackOutcome, QueueError> {
        let mut inner = self.inner.lock();
        let flight = match inner.in_flight.remove(&leased.lease_id) {
            Some(f) => f,
            // Lease already expired and was redelivered
            None => {
                return Ok(NackOutcome::WillRetry {
                    attempt: leased.job.attempt_count,
                    delay: Duration::ZERO,
                })
            }
        };

        let attempt = flight.job.attempt_count;
        if self.config.retry.has_attempts_remaining(attempt) {
            let delay = self.config.retry.delay_for_attempt(attempt + 1);
            debug!(
                task_id = %flight.job.task_id,
                attempt,
                ?delay,
                reason,
                "job nacked, scheduling retry"
            );
            inner.delayed.push(Delayed {
                ready_at: Instant::now() + delay,
                job: flight.job,
            });
            drop(inner);
            self.notify.notify_waiters();
            Ok(NackOutcome::WillRetry {
                attempt: attempt + 1,
                delay,
            })
        } else {
            warn!(task_id = %flight.job.task_id, attempt, reason, "job attempts exhausted");
            inner.failed_total += 1;
            inner.failed_tombstones.push_back(flight.job.task_id);
            while inner.failed_tombstones.len() > self.config.retention_failed {
                inner.failed_tombstones.pop_front();
            }
            Ok(NackOutcome::Discarded)
        }
    }

    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();

        let before = inner.waiting.len() + inner.delayed.len();
        let kept: BinaryHeap<Waiting> = inner
            .waiting
            .drain()
            .filter(|w| w.job.task_id != task_id)
            .collect();
        inner.waiting = kept;
        inner.delayed.retain(|d| d.job.task_id != task_id);

        Ok(inner.waiting.len() + inner.delayed.len() < before)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.inner.lock();
        Ok(QueueStats {
            waiting: inner.waiting.len(),
            active: inner.in_flight.len(),
            completed: inner.completed_total,
            failed: inner.failed_total,
            delayed: inner.delayed.len(),
        })
    }

    async fn pause(&self) {
        self.inner.lock().paused = true;
    }

    async fn resume(&self) {
        self.inner.lock().paused = false;
        self.notify.notify_waiters();
    }

    async fn drain(&self) -> Result<(), QueueError> {
        loop {
            {
                let mut inner = self.inner.lock();
                inner.promote_delayed();
                if inner.waiting.is_empty()
                    && inner.delayed.is_empty()
                    && inner.in_flight.is_empty()
                {
                    return Ok(());
                }
            }
            tokio::time::sleep(TICK).await;
        }
    }

    async fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }
}
