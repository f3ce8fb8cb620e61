//! Bounded FIFO queue for running external diagnostic tools.

mod output;
mod tools;

pub use output::*;
pub use tools::*;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::publish::Publisher;

/// A request to run one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub message_id: String,
    pub tool: ToolKind,
    #[serde(default)]
    pub args: Vec<String>,
    /// Service the output is published to.
    #[serde(default)]
    pub calling_service: String,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub line_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub message_id: String,
    pub status: JobStatus,
    pub success: bool,
    pub output: String,
    pub messages: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobResult {
    fn start(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            status: JobStatus::Running,
            success: false,
            output: String::new(),
            messages: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn failed(message_id: &str, message: String) -> Self {
        let mut result = Self::start(message_id);
        result.fail(message);
        result.finished_at = Some(Utc::now());
        result
    }

    fn note(&mut self, message: String) {
        self.messages.push(message);
    }

    fn fail(&mut self, message: String) {
        tracing::warn!("Jobs: {} failed: {}", self.message_id, message);
        self.status = JobStatus::Failed;
        self.success = false;
        self.messages.push(message);
    }
}

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Worker slots, i.e. jobs allowed to run at once.
    pub workers: usize,
    pub poll_interval: Duration,
    /// Line cap for output without a line limit.
    pub max_output_lines: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval: Duration::from_millis(250),
            max_output_lines: 1000,
        }
    }
}

/// Awaitable result of a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    message_id: String,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> JobResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => JobResult::failed(&self.message_id, "job dropped before completion".to_string()),
        }
    }
}

struct QueuedJob {
    job: Job,
    cancel: CancellationToken,
    reply: oneshot::Sender<JobResult>,
}

struct ActiveJob {
    status: JobStatus,
    cancel: CancellationToken,
}

struct QueueInner {
    settings: JobSettings,
    pending: Mutex<VecDeque<QueuedJob>>,
    active: Mutex<HashMap<String, ActiveJob>>,
    permits: Arc<Semaphore>,
    wake: Notify,
    tools: Arc<dyn ToolFactory>,
    publisher: Arc<dyn Publisher>,
}

/// FIFO job queue with a fixed number of worker slots.
pub struct JobQueue {
    inner: Arc<QueueInner>,
    stop_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl JobQueue {
    pub fn new(settings: JobSettings, tools: Arc<dyn ToolFactory>, publisher: Arc<dyn Publisher>) -> Self {
        let workers = settings.workers.max(1);
        Self {
            inner: Arc::new(QueueInner {
                settings,
                pending: Mutex::new(VecDeque::new()),
                active: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(workers)),
                wake: Notify::new(),
                tools,
                publisher,
            }),
            stop_tx: Mutex::new(None),
        }
    }

    /// Start the dispatch loop. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut stop_tx = self.stop_tx.lock().await;
        if stop_tx.is_some() {
            return;
        }

        let (tx, rx) = broadcast::channel(1);
        *stop_tx = Some(tx);
        tracing::info!("Jobs: starting queue with {} workers", self.inner.settings.workers.max(1));
        tokio::spawn(run_dispatch_loop(self.inner.clone(), rx));
    }

    /// Stop dispatching. Running jobs finish; queued jobs wait for the next start.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(());
            tracing::info!("Jobs: queue stopped");
        }
    }

    /// Queue `job`. A message id that is already queued or running fails immediately.
    pub async fn submit(&self, job: Job) -> JobHandle {
        let (reply, rx) = oneshot::channel();
        let handle = JobHandle {
            message_id: job.message_id.clone(),
            rx,
        };

        {
            let mut active = self.inner.active.lock().await;
            if active.contains_key(&job.message_id) {
                let result = JobResult::failed(
                    &job.message_id,
                    format!("job {} is already queued or running", job.message_id),
                );
                let _ = reply.send(result);
                return handle;
            }

            let cancel = CancellationToken::new();
            active.insert(
                job.message_id.clone(),
                ActiveJob {
                    status: JobStatus::Queued,
                    cancel: cancel.clone(),
                },
            );
            tracing::debug!("Jobs: queued {} ({})", job.message_id, job.tool);
            self.inner.pending.lock().await.push_back(QueuedJob { job, cancel, reply });
        }

        self.inner.wake.notify_one();
        handle
    }

    /// Cancel a queued or running job. Returns false for unknown ids.
    pub async fn cancel(&self, message_id: &str) -> bool {
        let active = self.inner.active.lock().await;
        match active.get(message_id) {
            Some(job) => {
                tracing::info!("Jobs: cancel requested for {} ({})", message_id, job.status);
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn status(&self, message_id: &str) -> Option<JobStatus> {
        self.inner.active.lock().await.get(message_id).map(|j| j.status)
    }
}

async fn run_dispatch_loop(inner: Arc<QueueInner>, mut stop_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(inner.settings.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = inner.wake.notified() => {}
            _ = interval.tick() => {}
        }
        inner.dispatch_ready().await;
    }
}

impl QueueInner {
    /// Start queued jobs from the head while worker slots are free.
    async fn dispatch_ready(self: &Arc<Self>) {
        loop {
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => return,
            };
            let Some(queued) = self.pending.lock().await.pop_front() else {
                return;
            };

            self.set_status(&queued.job.message_id, JobStatus::Running).await;

            let inner = self.clone();
            tokio::spawn(async move {
                let _permit = permit; // Hold the slot until done
                inner.run_job(queued).await;
                inner.wake.notify_one();
            });
        }
    }

    async fn set_status(&self, message_id: &str, status: JobStatus) {
        if let Some(job) = self.active.lock().await.get_mut(message_id) {
            job.status = status;
        }
    }

    async fn run_job(&self, queued: QueuedJob) {
        let QueuedJob { job, cancel, reply } = queued;

        let mut result = match AssertUnwindSafe(self.execute(&job, &cancel)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("Jobs: {} panicked", job.message_id);
                JobResult::failed(&job.message_id, "job panicked".to_string())
            }
        };
        result.finished_at = Some(Utc::now());
        tracing::info!("Jobs: {} finished ({})", job.message_id, result.status);

        if let Err(e) = self.publisher.publish_job_output(&job.calling_service, &result).await {
            tracing::warn!("Jobs: failed to publish output of {}: {}", job.message_id, e);
            result.note(format!("publishing output failed: {}", e));
        }

        self.active.lock().await.remove(&job.message_id);
        let _ = reply.send(result);
    }

    async fn execute(&self, job: &Job, cancel: &CancellationToken) -> JobResult {
        let mut result = JobResult::start(&job.message_id);

        if cancel.is_cancelled() {
            result.status = JobStatus::Cancelled;
            result.note("cancelled before start".to_string());
            return result;
        }

        let tool = self.tools.tool(job.tool);
        tracing::debug!("Jobs: {} resolved to {}", job.message_id, tool.kind());
        if !tool.is_available() {
            result.fail(format!("{} is not available on this host", tool.display_name()));
            return result;
        }

        result.note(format!("running {} {}", tool.display_name(), job.args.join(" ")));
        match tool.execute(&job.args, cancel).await {
            Ok(output) => {
                result.output = shape_output(
                    &output.merged(),
                    job.page,
                    job.line_limit,
                    self.settings.max_output_lines,
                );
                if output.cancelled {
                    result.status = JobStatus::Cancelled;
                    result.note("cancelled, process killed".to_string());
                } else if output.success() {
                    result.status = JobStatus::Succeeded;
                    result.success = true;
                } else {
                    let code = output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    result.fail(format!("{} exited with {}", tool.display_name(), code));
                }
            }
            Err(e) => result.fail(e.to_string()),
        }
        result
    }
}
