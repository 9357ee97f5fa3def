//! Worker pool / scheduler
//!
//! Owns every [`TransferJob`] and drives it through its lifecycle:
//!
//! ```text
//!  submit_batch
//!       |
//!    Queued --(endpoint slot, then global slot)--> Connecting
//!       ^                                              |
//!       |                            vault resolve, pooled session or connect
//!       |                                              v
//!       +---- backoff <---- transient error ------ Uploading
//!                                                      |
//!                                                 (Verifying)
//!                                                      |
//!                                     Succeeded | Failed | Cancelled
//! ```
//!
//! Each job runs on its own task. Concurrency is bounded by a global
//! semaphore (`max_concurrent_jobs`) and a per-destination semaphore
//! (`max_sessions_per_endpoint`); the per-destination permit is taken first
//! so a job waiting on a busy endpoint does not hold a global slot.
//!
//! Every job publishes exactly one [`CompletionEvent`], from its own task,
//! after all of its other events. Failed jobs publish one [`ErrorEvent`]
//! right before it.
//!
//! An attempt may resume only what an earlier attempt of the same job wrote;
//! a first attempt always overwrites. Jobs that fail or are cancelled hand
//! their leftover resume state to [`Transport::discard`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use uplink_core::{
    now_millis, BatchId, CompletionEvent, Config, ErrorEvent, JobError, JobId, JobRequest,
    JobStatus, SchedulerConfig, StatusEvent, TransferConfig, TransferError, TransferEvent,
    TransferJob, UploadError, Vault, VaultError,
};

use crate::event_bus::EventBus;
use crate::progress::ProgressReporter;
use crate::protocol::{Session, Transport, UploadContext, UploadRequest};
use crate::session_pool::{Checkout, SessionKey, SessionPool, SessionPoolConfig, SessionPoolStatsSnapshot};

/// Identifiers assigned to a submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    pub batch_id: BatchId,
    /// One per request, in submission order
    pub job_ids: Vec<JobId>,
}

/// Outcome of a finished batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes_sent: u64,
    /// Submission until the last job reached a terminal state
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

struct JobEntry {
    job: TransferJob,
    cancel: CancellationToken,
    progress: ProgressReporter,
    submitted_at: Instant,
    paused: bool,
    /// Set once a paused job was handed to [`Scheduler::resume_job`]
    resumed: bool,
    /// An earlier attempt, or the paused job this one continues, may have
    /// left a partial remote file. Only then may an attempt resume.
    partial: bool,
}

struct BatchEntry {
    job_ids: Vec<JobId>,
    submitted_at: Instant,
    finished_at: Mutex<Option<Instant>>,
    /// Jobs not yet terminal
    remaining: watch::Sender<usize>,
}

#[derive(Debug, Default)]
struct SchedulerStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    connects: AtomicU64,
    session_reuses: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Snapshot of scheduler statistics
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Attempts re-queued after a transient error
    pub retries: u64,
    /// New sessions opened
    pub connects: u64,
    /// Attempts that ran on a pooled session
    pub session_reuses: u64,
    pub bytes_sent: u64,
    pub uptime: Duration,
}

impl SchedulerStatsSnapshot {
    /// Jobs that reached a terminal state
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }

    /// Jobs submitted but not yet terminal
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.finished())
    }

    /// Average upload rate since the scheduler started
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_sent as f64 / secs
        }
    }
}

struct Inner<T: Transport> {
    config: SchedulerConfig,
    transfer: TransferConfig,
    transport: T,
    vault: Arc<Vault>,
    bus: EventBus,
    pool: SessionPool<T::Handle>,
    slots: Arc<Semaphore>,
    endpoint_slots: DashMap<SessionKey, Arc<Semaphore>>,
    jobs: DashMap<JobId, JobEntry>,
    batches: DashMap<BatchId, BatchEntry>,
    next_job_id: AtomicU64,
    next_batch_id: AtomicU64,
    stats: SchedulerStats,
    started_at: Instant,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded pool of upload workers over one [`Transport`]
pub struct Scheduler<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Scheduler<T> {
    pub fn new(config: &Config, transport: T, vault: Arc<Vault>, bus: EventBus) -> Self {
        let slots = config.scheduler.max_concurrent_jobs.max(1);
        info!(
            "Scheduler started with {} slot(s), {} session(s) per endpoint",
            slots,
            config.scheduler.max_sessions_per_endpoint.max(1)
        );
        Self {
            inner: Arc::new(Inner {
                config: config.scheduler.clone(),
                transfer: config.transfer.clone(),
                transport,
                vault,
                bus,
                pool: SessionPool::with_config(SessionPoolConfig::from(&config.scheduler)),
                slots: Arc::new(Semaphore::new(slots)),
                endpoint_slots: DashMap::new(),
                jobs: DashMap::new(),
                batches: DashMap::new(),
                next_job_id: AtomicU64::new(1),
                next_batch_id: AtomicU64::new(1),
                stats: SchedulerStats::default(),
                started_at: Instant::now(),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue one job per request and start working on them.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit_batch(&self, requests: Vec<JobRequest>) -> BatchHandle {
        self.enqueue(requests, false)
    }

    fn enqueue(&self, requests: Vec<JobRequest>, partial: bool) -> BatchHandle {
        let inner = &self.inner;
        let batch_id = BatchId(inner.next_batch_id.fetch_add(1, Ordering::Relaxed));
        let submitted_at = Instant::now();

        let mut job_ids = Vec::with_capacity(requests.len());
        for request in requests {
            let id = JobId(inner.next_job_id.fetch_add(1, Ordering::Relaxed));
            // Filled in from the source file when the first attempt starts
            let job = TransferJob::new(id, batch_id, request, 0);
            debug!("{} queued: {:?} -> {}", id, job.local_path, job.remote_path);
            inner.jobs.insert(
                id,
                JobEntry {
                    job,
                    cancel: inner.shutdown.child_token(),
                    progress: ProgressReporter::new(id, 0, inner.bus.clone(), &inner.transfer),
                    submitted_at,
                    paused: false,
                    resumed: false,
                    partial,
                },
            );
            job_ids.push(id);
        }

        let (remaining, _) = watch::channel(job_ids.len());
        inner.batches.insert(
            batch_id,
            BatchEntry {
                job_ids: job_ids.clone(),
                submitted_at,
                finished_at: Mutex::new(job_ids.is_empty().then_some(submitted_at)),
                remaining,
            },
        );
        inner
            .stats
            .submitted
            .fetch_add(job_ids.len() as u64, Ordering::Relaxed);
        info!("Submitted {} with {} job(s)", batch_id, job_ids.len());

        let mut workers = inner.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        for &id in &job_ids {
            let span = info_span!("job", id = %id);
            workers.push(tokio::spawn(run_job(inner.clone(), id).instrument(span)));
        }

        BatchHandle { batch_id, job_ids }
    }

    /// Request cancellation of one job. Returns false if the job is unknown
    /// or already terminal.
    pub fn cancel_job(&self, id: JobId) -> bool {
        let Some(entry) = self.inner.jobs.get(&id) else {
            return false;
        };
        if entry.job.is_terminal() {
            return false;
        }
        info!("Cancelling {}", id);
        entry.cancel.cancel();
        true
    }

    /// Cancel every unfinished job of a batch; returns how many were signalled
    pub fn cancel_batch(&self, batch_id: BatchId) -> usize {
        let job_ids = match self.inner.batches.get(&batch_id) {
            Some(batch) => batch.job_ids.clone(),
            None => return 0,
        };
        let cancelled = job_ids.into_iter().filter(|&id| self.cancel_job(id)).count();
        info!("Cancelled {} job(s) of {}", cancelled, batch_id);
        cancelled
    }

    /// Stop a job and remember it for [`Scheduler::resume_job`]. The job
    /// itself ends Cancelled.
    pub fn pause_job(&self, id: JobId) -> bool {
        let Some(mut entry) = self.inner.jobs.get_mut(&id) else {
            return false;
        };
        if entry.job.is_terminal() {
            return false;
        }
        entry.paused = true;
        entry.cancel.cancel();
        info!("Paused {}", id);
        true
    }

    /// Re-submit a paused job's request as a new job in a new batch. The new
    /// job continues whatever the paused one already transferred.
    pub fn resume_job(&self, id: JobId) -> Result<BatchHandle, JobError> {
        let (request, partial) = {
            let mut entry = self
                .inner
                .jobs
                .get_mut(&id)
                .ok_or(JobError::UnknownJob(id))?;
            if !entry.paused || entry.resumed {
                return Err(JobError::NotPaused(id));
            }
            entry.resumed = true;
            let partial = entry.partial || entry.progress.bytes_sent() > 0;
            (entry.job.request(), partial)
        };
        info!("Resuming {}", id);
        Ok(self.enqueue(vec![request], partial))
    }

    /// Wait until every job in the batch is terminal. `None` for an unknown
    /// batch.
    pub async fn wait_batch(&self, batch_id: BatchId) -> Option<BatchSummary> {
        let mut remaining = self.inner.batches.get(&batch_id)?.remaining.subscribe();
        // The sender lives as long as the batch entry
        let _ = remaining.wait_for(|n| *n == 0).await;
        self.summary(batch_id)
    }

    /// Current counts for a batch, finished or not
    pub fn summary(&self, batch_id: BatchId) -> Option<BatchSummary> {
        let batch = self.inner.batches.get(&batch_id)?;
        let mut summary = BatchSummary {
            batch_id,
            total: batch.job_ids.len(),
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            bytes_sent: 0,
            elapsed: batch
                .finished_at
                .lock()
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(batch.submitted_at),
        };
        for id in &batch.job_ids {
            let Some(entry) = self.inner.jobs.get(id) else {
                continue;
            };
            match entry.job.status {
                JobStatus::Succeeded => summary.succeeded += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
                _ => {}
            }
            summary.bytes_sent += entry.job.bytes_sent;
        }
        Some(summary)
    }

    /// Snapshot of one job, with live progress
    pub fn job(&self, id: JobId) -> Option<TransferJob> {
        self.inner.jobs.get(&id).map(|entry| snapshot(&entry))
    }

    /// Snapshots of a batch's jobs in submission order
    pub fn batch_jobs(&self, batch_id: BatchId) -> Vec<TransferJob> {
        let Some(batch) = self.inner.batches.get(&batch_id) else {
            return Vec::new();
        };
        batch
            .job_ids
            .iter()
            .filter_map(|id| self.inner.jobs.get(id).map(|entry| snapshot(&entry)))
            .collect()
    }

    /// Drop the records of a finished batch. Returns false if the batch is
    /// unknown or still has unfinished jobs.
    pub fn forget_batch(&self, batch_id: BatchId) -> bool {
        let done = self
            .inner
            .batches
            .get(&batch_id)
            .map_or(false, |batch| *batch.remaining.borrow() == 0);
        if !done {
            return false;
        }
        if let Some((_, batch)) = self.inner.batches.remove(&batch_id) {
            for id in batch.job_ids {
                self.inner.jobs.remove(&id);
            }
        }
        true
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> SchedulerStatsSnapshot {
        let stats = &self.inner.stats;
        SchedulerStatsSnapshot {
            submitted: stats.submitted.load(Ordering::Relaxed),
            succeeded: stats.succeeded.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            retries: stats.retries.load(Ordering::Relaxed),
            connects: stats.connects.load(Ordering::Relaxed),
            session_reuses: stats.session_reuses.load(Ordering::Relaxed),
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            uptime: self.inner.started_at.elapsed(),
        }
    }

    pub fn session_pool_stats(&self) -> SessionPoolStatsSnapshot {
        self.inner.pool.stats()
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Cancel everything, wait for the workers to wind down, and close all
    /// idle sessions
    pub async fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.inner.shutdown.cancel();

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }

        let idle = self.inner.pool.drain();
        debug!("Closing {} idle session(s)", idle.len());
        for session in idle {
            self.inner.close_session(session).await;
        }
    }
}

fn snapshot(entry: &JobEntry) -> TransferJob {
    let mut job = entry.job.clone();
    job.record_progress(entry.progress.bytes_sent());
    job
}

/// One job from queue to terminal state
async fn run_job<T: Transport>(inner: Arc<Inner<T>>, id: JobId) {
    let Some((key, cancel)) = inner
        .jobs
        .get(&id)
        .map(|entry| (SessionKey::for_job(&entry.job), entry.cancel.clone()))
    else {
        return;
    };
    let endpoint_slots = inner.endpoint_slots(&key);

    loop {
        let permits = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permits = acquire(&endpoint_slots, &inner.slots) => permits,
        };
        let Some(permits) = permits else {
            inner.finish(id, JobStatus::Cancelled, None).await;
            return;
        };

        let outcome = inner.attempt(id, &key, &cancel).await;
        drop(permits);

        let error = match outcome {
            Ok(()) => {
                inner.finish(id, JobStatus::Succeeded, None).await;
                return;
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                inner.finish(id, JobStatus::Cancelled, None).await;
                return;
            }
            Err(e) => e,
        };

        let Some(delay) = inner.requeue(id, &error) else {
            inner.finish(id, JobStatus::Failed, Some(error)).await;
            return;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                inner.finish(id, JobStatus::Cancelled, None).await;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Destination slot first, then a global slot
async fn acquire(
    endpoint: &Arc<Semaphore>,
    global: &Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    let endpoint = endpoint.clone().acquire_owned().await.ok()?;
    let global = global.clone().acquire_owned().await.ok()?;
    Some((endpoint, global))
}

/// Resolves `grace` after cancellation was requested
async fn grace_expired(cancel: &CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

impl<T: Transport> Inner<T> {
    fn endpoint_slots(&self, key: &SessionKey) -> Arc<Semaphore> {
        self.endpoint_slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_sessions_per_endpoint.max(1))))
            .clone()
    }

    /// A single connect-upload-verify pass
    async fn attempt(
        &self,
        id: JobId,
        key: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let Some((job, progress, partial)) = self
            .jobs
            .get(&id)
            .map(|entry| (entry.job.clone(), entry.progress.clone(), entry.partial))
        else {
            return Err(UploadError::Cancelled.into());
        };
        self.set_status(id, JobStatus::Connecting);

        let bytes_total = match tokio::fs::metadata(&job.local_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(UploadError::LocalIo(format!(
                    "{} is not a regular file",
                    job.local_path.display()
                ))
                .into())
            }
            Err(e) => {
                return Err(
                    UploadError::LocalIo(format!("{}: {}", job.local_path.display(), e)).into(),
                )
            }
        };
        progress.set_total(bytes_total);
        self.update_job(id, |job| job.set_total(bytes_total));

        let vault = self.vault.clone();
        let account_id = job.account_id.clone();
        let protocol = job.protocol;
        let span = Span::current();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let secret = tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                span.in_scope(|| vault.resolve(&account_id, protocol))
            })
        })
        .await
        .map_err(|e| VaultError::Read(e.to_string()))??;

        for stale in self.pool.reap_idle() {
            self.close_session(stale).await;
        }
        let Checkout { session, stale } = self.pool.checkout(key);
        for stale in stale {
            self.close_session(stale).await;
        }
        let mut session = match session {
            Some(session) => {
                self.stats.session_reuses.fetch_add(1, Ordering::Relaxed);
                session
            }
            None => {
                self.stats.connects.fetch_add(1, Ordering::Relaxed);
                let connect = self
                    .transport
                    .connect(protocol, &job.connection_params, &secret);
                let session = tokio::select! {
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled.into()),
                    result = connect => result?,
                };
                info!("Connected to {} as {}", key, session.identity);
                session
            }
        };
        drop(secret);

        self.set_status(id, JobStatus::Uploading);
        let request = UploadRequest {
            job_id: id,
            local_path: job.local_path.clone(),
            remote_path: job.remote_path.clone(),
            bytes_total,
        };
        let ctx = UploadContext {
            progress: progress.clone(),
            cancel: cancel.clone(),
            bandwidth_limit_kbps: job
                .connection_params
                .bandwidth_limit_kbps
                .unwrap_or(self.transfer.bandwidth_limit_kbps),
            resume: partial && self.transfer.resume_partial && protocol.supports_resume(),
        };

        let grace = self.config.cancel_grace();
        let outcome = {
            let upload = self.transport.upload(&mut session, &request, &ctx);
            tokio::select! {
                result = upload => result,
                _ = grace_expired(cancel, grace) => {
                    warn!("Upload did not stop within {:?} of cancellation", grace);
                    Err(UploadError::Cancelled)
                }
            }
        };
        self.update_job(id, |job| job.record_progress(progress.bytes_sent()));

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                if progress.position() > 0 {
                    self.set_partial(id, true);
                }
                // Mid-transfer state is unknown; never pool it
                self.close_session(session).await;
                return Err(e.into());
            }
        };
        session.uploads += 1;
        self.stats
            .bytes_sent
            .fetch_add(result.bytes_sent, Ordering::Relaxed);
        if result.resumed_from > 0 {
            debug!("Resumed {} from byte {}", job.remote_path, result.resumed_from);
        }

        let verified = match result.remote_size {
            Some(remote) if self.transfer.verify_remote_size => {
                self.set_status(id, JobStatus::Verifying);
                if remote == bytes_total {
                    Ok(())
                } else {
                    // What is on the server cannot be trusted as a prefix
                    self.set_partial(id, false);
                    Err(UploadError::transient(format!(
                        "remote size {} does not match local size {}",
                        remote, bytes_total
                    )))
                }
            }
            _ => Ok(()),
        };

        if let Some(evicted) = self.pool.checkin(key.clone(), session) {
            self.close_session(evicted).await;
        }
        verified.map_err(TransferError::from)
    }

    /// Put a failed job back in the queue if the error and the attempt
    /// budget allow it; returns the backoff delay
    fn requeue(&self, id: JobId, error: &TransferError) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        let attempt = {
            let mut entry = self.jobs.get_mut(&id)?;
            if entry.job.attempt_count + 1 >= self.config.max_attempts.max(1) {
                return None;
            }
            entry.job.last_error = Some(error.to_string());
            if let Err(e) = entry.job.transition(JobStatus::Failed) {
                warn!("{}", e);
                return None;
            }
            if let Err(e) = entry.job.requeue() {
                warn!("{}", e);
                return None;
            }
            entry.job.attempt_count
        };

        self.stats.retries.fetch_add(1, Ordering::Relaxed);
        let delay = self.config.backoff_delay(attempt - 1);
        warn!(
            "Attempt {} failed ({}), retrying in {:?}",
            attempt, error, delay
        );
        self.bus.publish(TransferEvent::Status(StatusEvent {
            job_id: id,
            status: JobStatus::Queued,
            attempt,
            reason: Some(error.to_string()),
            timestamp_ms: now_millis(),
        }));
        Some(delay)
    }

    fn set_partial(&self, id: JobId, partial: bool) {
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            entry.partial = partial;
        }
    }

    fn update_job(&self, id: JobId, f: impl FnOnce(&mut TransferJob)) {
        if let Some(mut entry) = self.jobs.get_mut(&id) {
            f(&mut entry.job);
        }
    }

    fn set_status(&self, id: JobId, status: JobStatus) {
        let attempt = {
            let Some(mut entry) = self.jobs.get_mut(&id) else {
                return;
            };
            if let Err(e) = entry.job.transition(status) {
                warn!("{}", e);
                return;
            }
            entry.job.attempt_count
        };
        debug!("Status {}", status);
        self.bus.publish(TransferEvent::Status(StatusEvent {
            job_id: id,
            status,
            attempt,
            reason: None,
            timestamp_ms: now_millis(),
        }));
    }

    /// Move a job to its terminal state and publish its final events.
    ///
    /// A job that fails or is cancelled for good first has its resume state
    /// discarded; a paused job keeps it for [`Scheduler::resume_job`].
    async fn finish(&self, id: JobId, status: JobStatus, error: Option<TransferError>) {
        let discard = status != JobStatus::Succeeded
            && self
                .jobs
                .get(&id)
                .map_or(false, |entry| !entry.job.is_terminal() && !entry.paused);
        if discard {
            self.transport.discard(id).await;
        }
        self.complete(id, status, error);
    }

    fn complete(&self, id: JobId, status: JobStatus, error: Option<TransferError>) {
        let (batch_id, bytes_sent, duration) = {
            let Some(mut entry) = self.jobs.get_mut(&id) else {
                return;
            };
            if entry.job.is_terminal() {
                return;
            }
            let reported = entry.progress.bytes_sent();
            entry.job.record_progress(reported);
            if let Err(e) = entry.job.transition(status) {
                warn!("{}", e);
                return;
            }
            if let Some(e) = &error {
                entry.job.last_error = Some(e.to_string());
            }
            (entry.job.batch_id, entry.job.bytes_sent, entry.submitted_at.elapsed())
        };

        match (status, &error) {
            (JobStatus::Succeeded, _) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                info!("Upload succeeded: {} bytes in {:?}", bytes_sent, duration);
            }
            (JobStatus::Failed, Some(e)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Upload failed: {}", e);
                self.bus.publish(TransferEvent::Error(ErrorEvent {
                    job_id: id,
                    kind: e.kind(),
                    message: e.to_string(),
                    retry_eligible: e.is_retryable(),
                }));
            }
            (JobStatus::Failed, None) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                info!("Upload cancelled after {} bytes", bytes_sent);
            }
        }

        self.bus.publish(TransferEvent::Completed(CompletionEvent {
            job_id: id,
            status,
            duration,
            bytes_sent,
        }));

        if let Some(batch) = self.batches.get(&batch_id) {
            let mut done = false;
            batch.remaining.send_modify(|n| {
                *n = n.saturating_sub(1);
                done = *n == 0;
            });
            if done {
                *batch.finished_at.lock() = Some(Instant::now());
                info!("{} finished", batch_id);
            }
        }
    }

    async fn close_session(&self, mut session: Session<T::Handle>) {
        self.transport.close(&mut session).await;
    }
}
