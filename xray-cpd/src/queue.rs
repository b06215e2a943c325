//! Job queue and the `JobContext` it hands to the processor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use std::sync::RwLock as SyncRwLock;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use xray_cp_common::{
    AppError, ErrorKind, HostId, Job, JobId, JobResult, JobStatus, JobType, LogLevel,
};

use crate::lock::LockStore;
use crate::log_sink::InstallLogSink;

struct CancelFlag {
    expires_at: Instant,
}

/// Job rows plus the cancel flags that back them, held in-process.
pub struct JobsRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
    /// Plain sync lock (not the async `RwLock` used for job rows) so
    /// `is_cancelled` can be polled from inside `execute_checked`'s
    /// synchronous cancellation predicate without a runtime hop.
    cancel_flags: SyncRwLock<HashMap<JobId, CancelFlag>>,
    completed_retention: Duration,
    failed_retention: Duration,
    retention_records: usize,
}

impl JobsRegistry {
    pub fn new(completed_retention: Duration, failed_retention: Duration, retention_records: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            cancel_flags: SyncRwLock::new(HashMap::new()),
            completed_retention,
            failed_retention,
            retention_records,
        }
    }

    pub async fn insert(&self, job: Job) {
        self.prune().await;
        self.jobs.write().await.insert(job.id.clone(), job);
    }

    pub async fn get(&self, id: &JobId) -> Result<Job, AppError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::new(ErrorKind::JobNotFound))
    }

    /// Most recent `tail` lines (default 200, max 1000), ascending by
    /// timestamp.
    pub async fn logs(&self, id: &JobId, tail: usize) -> Result<Vec<xray_cp_common::JobLogLine>, AppError> {
        let job = self.get(id).await?;
        let tail = tail.clamp(1, 1000);
        let start = job.logs.len().saturating_sub(tail);
        Ok(job.logs[start..].to_vec())
    }

    pub fn set_cancel_flag(&self, id: &JobId, ttl: Duration) {
        self.cancel_flags.write().expect("cancel flags lock poisoned").insert(
            id.clone(),
            CancelFlag {
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn is_cancelled(&self, id: &JobId) -> bool {
        self.cancel_flags
            .read()
            .expect("cancel flags lock poisoned")
            .get(id)
            .is_some_and(|flag| flag.expires_at > Instant::now())
    }

    pub fn clear_cancel_flag(&self, id: &JobId) {
        self.cancel_flags.write().expect("cancel flags lock poisoned").remove(id);
    }

    async fn mutate<T>(&self, id: &JobId, f: impl FnOnce(&mut Job) -> T) -> Result<T, AppError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| AppError::new(ErrorKind::JobNotFound))?;
        Ok(f(job))
    }

    /// Drop completed/failed jobs that have exceeded both their age and
    /// count retention bound — whichever bound is looser.
    async fn prune(&self) {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        let completed_retention = chrono::Duration::from_std(self.completed_retention).unwrap_or_default();
        let failed_retention = chrono::Duration::from_std(self.failed_retention).unwrap_or_default();

        let terminal_count = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Completed | JobStatus::Failed))
            .count();
        if terminal_count <= self.retention_records {
            return;
        }

        jobs.retain(|_, job| match job.status {
            JobStatus::Completed => now - job.updated_at < completed_retention,
            JobStatus::Failed => now - job.updated_at < failed_retention,
            _ => true,
        });
    }
}

/// A handle the processor and its workflows use to report progress, append
/// log lines, and poll for cancellation.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub(crate) registry: Arc<JobsRegistry>,
    pub(crate) log_sink: Arc<InstallLogSink>,
    pub(crate) host_id: HostId,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        registry: Arc<JobsRegistry>,
        log_sink: Arc<InstallLogSink>,
        host_id: HostId,
    ) -> Self {
        Self {
            job_id,
            registry,
            log_sink,
            host_id,
        }
    }

    pub async fn set_progress(&self, n: f64) {
        let _ = self.registry.mutate(&self.job_id, |job| job.set_progress(n)).await;
    }

    pub async fn append_log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let _ = self
            .registry
            .mutate(&self.job_id, |job| job.append_log(level, message.clone()))
            .await;
        let _ = self.log_sink.append(&self.host_id, &message).await;
    }

    /// Sync on purpose: this is what workflow code passes to `execute_checked`
    /// as its cancellation predicate, which runs inside a plain `Fn() -> bool`.
    pub fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.job_id)
    }
}

/// Payload published to the internal dispatch channel on enqueue.
struct JobMessage {
    job_id: JobId,
    job_type: JobType,
    host_id: HostId,
}

/// Enqueue, cancel, inspect, log-tail, close. Correctness rests on the
/// per-host lock, not on queue concurrency.
pub struct JobQueue {
    pub registry: Arc<JobsRegistry>,
    lock_store: Arc<LockStore>,
    log_sink: Arc<InstallLogSink>,
    lock_ttl: Duration,
    cancel_flag_ttl: Duration,
    sender: mpsc::UnboundedSender<JobMessage>,
}

impl JobQueue {
    pub fn new(
        lock_store: Arc<LockStore>,
        log_sink: Arc<InstallLogSink>,
        lock_ttl: Duration,
        cancel_flag_ttl: Duration,
        completed_retention: Duration,
        failed_retention: Duration,
        retention_records: usize,
    ) -> (Self, mpsc::UnboundedReceiver<JobHandoff>) {
        let (sender, mut raw_rx) = mpsc::unbounded_channel::<JobMessage>();
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel::<JobHandoff>();
        let registry = Arc::new(JobsRegistry::new(completed_retention, failed_retention, retention_records));
        let registry_for_task = registry.clone();
        let log_sink_for_task = log_sink.clone();

        tokio::spawn(async move {
            while let Some(msg) = raw_rx.recv().await {
                let ctx = JobContext::new(
                    msg.job_id.clone(),
                    registry_for_task.clone(),
                    log_sink_for_task.clone(),
                    msg.host_id.clone(),
                );
                let _ = handoff_tx.send(JobHandoff {
                    job_type: msg.job_type,
                    host_id: msg.host_id,
                    ctx,
                });
            }
        });

        (
            Self {
                registry,
                lock_store,
                log_sink,
                lock_ttl,
                cancel_flag_ttl,
                sender,
            },
            handoff_rx,
        )
    }

    async fn enqueue(&self, job_type: JobType, host_id: HostId) -> Result<JobId, AppError> {
        let job_id = JobId::new(uuid::Uuid::new_v4().to_string());

        self.lock_store
            .acquire(&host_id, job_id.as_str(), self.lock_ttl)
            .await?;

        let job = Job::new(job_id.clone(), job_type, host_id.clone());
        self.registry.insert(job).await;

        if self
            .sender
            .send(JobMessage {
                job_id: job_id.clone(),
                job_type,
                host_id: host_id.clone(),
            })
            .is_err()
        {
            self.lock_store.release(&host_id, job_id.as_str()).await;
            return Err(AppError::new(ErrorKind::Internal(
                "dispatch channel closed".into(),
            )));
        }

        let message = format!("Job queued: type={job_type} serverId={host_id}");
        info!("{message}");
        let _ = self
            .registry
            .mutate(&job_id, |job| job.append_log(LogLevel::Info, message))
            .await;

        Ok(job_id)
    }

    pub async fn enqueue_install(&self, host_id: HostId) -> Result<JobId, AppError> {
        self.enqueue(JobType::Install, host_id).await
    }

    pub async fn enqueue_repair(&self, host_id: HostId) -> Result<JobId, AppError> {
        self.enqueue(JobType::Repair, host_id).await
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job, AppError> {
        self.registry.get(id).await
    }

    pub async fn get_logs(&self, id: &JobId, tail: usize) -> Result<Vec<xray_cp_common::JobLogLine>, AppError> {
        self.registry.logs(id, tail).await
    }

    /// Sets the cancel flag and logs a `WARN`; does not interrupt in-flight
    /// SSH.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, AppError> {
        let job = self.registry.get(id).await?;
        self.registry.set_cancel_flag(id, self.cancel_flag_ttl);
        warn!("Cancellation requested for job {id}");
        let _ = self
            .registry
            .mutate(id, |j| j.append_log(LogLevel::Warn, "Cancellation requested"))
            .await;
        Ok(job)
    }

    /// Release the host lock and clear the cancel flag; called from the
    /// worker's `finally` path.
    pub async fn finish(&self, job_id: &JobId, host_id: &HostId) {
        self.lock_store.release(host_id, job_id.as_str()).await;
        self.registry.clear_cancel_flag(job_id);
    }

    pub fn log_sink(&self) -> Arc<InstallLogSink> {
        self.log_sink.clone()
    }

    pub async fn resolve_before_execution(&self, job_id: &JobId) -> Result<(), AppError> {
        if self.registry.is_cancelled(job_id) {
            warn!("Job cancelled before execution: {job_id}");
            let _ = self
                .registry
                .mutate(job_id, |job| {
                    job.append_log(LogLevel::Warn, "Job cancelled before execution");
                    job.status = JobStatus::Completed;
                    job.result = Some(JobResult {
                        canceled: true,
                        reason: Some("Cancellation requested before execution".to_string()),
                        ..Default::default()
                    });
                })
                .await;
            return Err(AppError::new(ErrorKind::JobCancelled(
                "Cancellation requested before execution".to_string(),
            )));
        }
        let _ = self
            .registry
            .mutate(job_id, |job| job.status = JobStatus::Active)
            .await;
        Ok(())
    }

    pub async fn record_success(&self, job_id: &JobId, result: JobResult) {
        let _ = self
            .registry
            .mutate(job_id, |job| {
                job.status = JobStatus::Completed;
                job.result = Some(result);
            })
            .await;
    }

    pub async fn record_cancelled(&self, job_id: &JobId, reason: String) {
        let _ = self
            .registry
            .mutate(job_id, |job| {
                warn!("Job cancelled: {reason}");
                job.append_log(LogLevel::Warn, format!("Job cancelled: {reason}"));
                job.status = JobStatus::Completed;
                job.result = Some(JobResult {
                    canceled: true,
                    reason: Some(reason),
                    ..Default::default()
                });
            })
            .await;
    }

    pub async fn record_failure(&self, job_id: &JobId, error: String) {
        let _ = self
            .registry
            .mutate(job_id, |job| {
                job.status = JobStatus::Failed;
                job.error = Some(error);
            })
            .await;
    }
}

/// What the dispatch loop hands to the job processor once a job is popped
/// off the channel.
pub struct JobHandoff {
    pub job_type: JobType,
    pub host_id: HostId,
    pub ctx: JobContext,
}
