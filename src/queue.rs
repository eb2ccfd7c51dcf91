//! Concurrent job queue with per-id deduplication and bounded retry.
//!
//! `enqueue` is non-blocking, callable from any thread, and fire-and-forget:
//! nothing is ever reported back to the caller.  A fixed pool of worker tasks
//! drains the queue; each job's blocking `run` executes off the async
//! runtime.  The queue's correctness property is that two jobs sharing an id
//! never run concurrently, and a duplicate enqueued while its id is pending
//! or running is dropped; the existing instance's outcome supersedes it.
//!
//! Failure policy (applied uniformly to every job):
//! - transient errors retry with exponential backoff up to a ceiling, then
//!   the job is dropped with a logged warning;
//! - everything else is permanent: logged, never retried.  Jobs handle their
//!   own compensating writes (e.g. marking a conversation exited) before
//!   returning success, so permanent errors reaching the queue are the
//!   unexpected kind.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::events::EntityEvent;
use crate::job::{Job, JobContext};
use crate::logging;
use crate::mlog;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the queue; defaults match interactive-client behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of parallel workers.
    pub workers: usize,
    /// Retries after the initial attempt before a transient failure is
    /// dropped.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base: Duration,
    /// Backoff ceiling.
    pub retry_cap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 5,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Admission state, held only for O(1) membership operations, never across
/// I/O.
struct QueueState {
    pending: HashSet<String>,
    running: HashSet<String>,
    accepting: bool,
    tx: Option<mpsc::UnboundedSender<Job>>,
}

struct QueueInner {
    ctx: Arc<JobContext>,
    config: QueueConfig,
    state: StdMutex<QueueState>,
}

impl QueueInner {
    /// Admit a job unless its id is already pending or running.
    fn enqueue(&self, job: Job) {
        let job_id = job.id();
        let mut state = self.state.lock().unwrap();
        if !state.accepting {
            return;
        }
        if state.pending.contains(&job_id) || state.running.contains(&job_id) {
            return;
        }
        let Some(tx) = state.tx.as_ref() else {
            return;
        };
        if tx.send(job).is_ok() {
            state.pending.insert(job_id);
        }
    }

    fn mark_running(&self, job_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(job_id);
        state.running.insert(job_id.to_string());
    }

    fn finish(&self, job_id: &str) {
        self.state.lock().unwrap().running.remove(job_id);
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .config
            .retry_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        doubled.min(self.config.retry_cap)
    }

    /// Run one job to completion, applying the retry policy.  Fan-out jobs
    /// re-enter admission as soon as the run succeeds.
    async fn run_job(&self, job: &Job) {
        let job_id = job.id();
        let mut attempt: u32 = 0;
        loop {
            let ctx = Arc::clone(&self.ctx);
            let step = job.clone();
            let outcome = tokio::task::spawn_blocking(move || step.run(&ctx)).await;
            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    mlog!("queue: job {} aborted: {e}", logging::job(&job_id));
                    return;
                }
            };
            match result {
                Ok(followups) => {
                    for follow in followups {
                        self.enqueue(follow);
                    }
                    return;
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        mlog!(
                            "queue: job {} dropped after {attempt} attempts: {e}",
                            logging::job(&job_id)
                        );
                        return;
                    }
                    let delay = self.backoff_delay(attempt);
                    mlog!(
                        "queue: job {} failed (attempt {attempt}, retry in {}ms): {e}",
                        logging::job(&job_id),
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    mlog!(
                        "queue: job {} failed permanently: {e}",
                        logging::job(&job_id)
                    );
                    return;
                }
            }
        }
    }
}

async fn worker_loop(
    inner: Arc<QueueInner>,
    rx: Arc<TokioMutex<mpsc::UnboundedReceiver<Job>>>,
) {
    loop {
        // Hold the receiver lock only while waiting for the next job, so a
        // worker running a job never blocks the others from picking one up.
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };
        let job_id = job.id();
        inner.mark_running(&job_id);
        inner.run_job(&job).await;
        inner.finish(&job_id);
    }
}

/// The engine's dispatcher: a worker pool plus the pending/running id sets.
///
/// Construct one per process with the injected collaborators; there is no
/// process-wide singleton.  All admission state starts empty; no jobs
/// survive a restart.
pub struct JobQueue {
    inner: Arc<QueueInner>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Spawn the worker pool.  Must be called from within a tokio runtime.
    pub fn start(ctx: Arc<JobContext>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(TokioMutex::new(rx));
        let worker_count = config.workers.max(1);
        let inner = Arc::new(QueueInner {
            ctx,
            config,
            state: StdMutex::new(QueueState {
                pending: HashSet::new(),
                running: HashSet::new(),
                accepting: true,
                tx: Some(tx),
            }),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let inner = Arc::clone(&inner);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(worker_loop(inner, rx)));
        }
        mlog!("queue: started {worker_count} worker(s)");

        Self {
            inner,
            workers: StdMutex::new(handles),
        }
    }

    /// Admit a job.  A no-op if a job with the same id is already pending or
    /// running, or after [`drain`](Self::drain).
    pub fn enqueue(&self, job: Job) {
        self.inner.enqueue(job);
    }

    /// Subscribe to entity-changed events published by successful job writes.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.inner.ctx.events.subscribe()
    }

    /// Number of admitted-but-not-finished jobs, pending plus running.
    pub fn depth(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.pending.len() + state.running.len()
    }

    /// Stop accepting jobs and wait for every admitted job to finish.
    /// Fan-out jobs produced while draining are dropped at admission.
    pub async fn drain(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.accepting = false;
            // Closing the channel lets workers finish the backlog, then exit.
            state.tx = None;
        }
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        mlog!("queue: drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(base_ms: u64, cap_ms: u64) -> QueueConfig {
        QueueConfig {
            retry_base: Duration::from_millis(base_ms),
            retry_cap: Duration::from_millis(cap_ms),
            ..QueueConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let inner = QueueInner {
            ctx: test_ctx(),
            config: config_with(100, 1000),
            state: StdMutex::new(QueueState {
                pending: HashSet::new(),
                running: HashSet::new(),
                accepting: true,
                tx: None,
            }),
        };
        assert_eq!(inner.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(inner.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(inner.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(inner.backoff_delay(5), Duration::from_millis(1000));
        assert_eq!(inner.backoff_delay(30), Duration::from_millis(1000));
    }

    fn test_ctx() -> Arc<JobContext> {
        struct NoopClient;
        impl crate::api::RemoteClient for NoopClient {
            fn get_conversation(
                &self,
                _: &str,
            ) -> Result<crate::api::ConversationResponse, crate::api::ApiError> {
                Err(crate::api::ApiError::Network("noop".into()))
            }
            fn fetch_users(
                &self,
                _: &[String],
            ) -> Result<Vec<crate::api::UserResponse>, crate::api::ApiError> {
                Ok(Vec::new())
            }
            fn get_asset(
                &self,
                _: &str,
            ) -> Result<crate::api::AssetResponse, crate::api::ApiError> {
                Err(crate::api::ApiError::Network("noop".into()))
            }
        }
        Arc::new(JobContext::new(
            Arc::new(crate::storage::Storage::open_in_memory().unwrap()),
            Arc::new(NoopClient),
            crate::events::channel(),
            "account",
        ))
    }
}
