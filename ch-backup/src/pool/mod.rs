//! Fixed-size pool of async workers for part transfers.
//!
//! Jobs are submitted under a unique id and collected in completion order.
//! Workers are spawned when the pool is built, before any job arrives.

use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Barrier, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::utils::errors::{BackupError, Result};

type JobFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Runs once, in the collecting call, after the job's outcome is known
pub type Callback = Box<dyn FnOnce() + Send>;

struct Task<T> {
    id: String,
    work: JobFuture<T>,
}

struct Completion<T> {
    id: String,
    result: Result<T>,
}

struct Job {
    callback: Option<Callback>,
}

pub struct ExecPool<T> {
    tasks: Option<mpsc::UnboundedSender<Task<T>>>,
    completions: Mutex<mpsc::UnboundedReceiver<Completion<T>>>,
    jobs: Mutex<HashMap<String, Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ExecPool<T> {
    /// Spawn `workers` workers and wait until each is running.
    pub async fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (task_tx, task_rx) = mpsc::unbounded_channel::<Task<T>>();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let task_rx = Arc::new(Mutex::new(task_rx));
        let ready = Arc::new(Barrier::new(workers + 1));

        let handles = (0..workers)
            .map(|worker| {
                let task_rx = task_rx.clone();
                let done_tx = done_tx.clone();
                let ready = ready.clone();
                tokio::spawn(async move {
                    ready.wait().await;
                    loop {
                        let next = task_rx.lock().await.recv().await;
                        let Some(Task { id, work }) = next else {
                            break;
                        };
                        let result = AssertUnwindSafe(work)
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| Err(BackupError::JobPanicked(id.clone())));
                        if done_tx.send(Completion { id, result }).is_err() {
                            break;
                        }
                    }
                    debug!(worker, "Worker stopped");
                })
            })
            .collect();

        ready.wait().await;
        debug!(workers, "Execution pool started");

        Self {
            tasks: Some(task_tx),
            completions: Mutex::new(done_rx),
            jobs: Mutex::new(HashMap::new()),
            workers: handles,
        }
    }

    /// Queue `work` under `id`. Ids must be unique among uncollected jobs.
    pub async fn submit<F>(&self, id: impl Into<String>, work: F, callback: Option<Callback>) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let id = id.into();
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&id) {
            return Err(BackupError::DuplicateJob(id));
        }

        let tasks = self.tasks.as_ref().ok_or(BackupError::PoolClosed)?;
        tasks
            .send(Task {
                id: id.clone(),
                work: Box::pin(work),
            })
            .map_err(|_| BackupError::PoolClosed)?;

        jobs.insert(id, Job { callback });
        Ok(())
    }

    /// Number of submitted jobs whose results have not been collected yet
    pub async fn pending(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Collect outstanding jobs in completion order.
    ///
    /// Without `keep_going` the first failure ends the sequence after the
    /// remaining jobs are drained. With it, failures are logged and skipped.
    pub async fn as_completed(&self, keep_going: bool, timeout: Option<Duration>) -> Completions<'_, T> {
        let receiver = self.completions.lock().await;
        let remaining = self.jobs.lock().await.len();
        Completions {
            pool: self,
            receiver,
            remaining,
            keep_going,
            deadline: timeout.map(|t| Instant::now() + t),
            done: false,
        }
    }

    /// Collect every outstanding job, returning the successful results.
    pub async fn wait_all(&self, keep_going: bool, timeout: Option<Duration>) -> Result<Vec<T>> {
        let mut completions = self.as_completed(keep_going, timeout).await;
        let mut results = Vec::new();
        while let Some(result) = completions.next().await {
            results.push(result?);
        }
        Ok(results)
    }

    /// Stop the workers. A graceful shutdown lets queued jobs finish first.
    pub async fn shutdown(mut self, graceful: bool) {
        self.tasks.take();
        let workers = std::mem::take(&mut self.workers);
        for worker in workers {
            if graceful {
                if let Err(e) = worker.await {
                    warn!(error = %e, "Worker ended abnormally");
                }
            } else {
                worker.abort();
            }
        }
    }
}

impl<T> Drop for ExecPool<T> {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

pub struct Completions<'a, T> {
    pool: &'a ExecPool<T>,
    receiver: MutexGuard<'a, mpsc::UnboundedReceiver<Completion<T>>>,
    remaining: usize,
    keep_going: bool,
    deadline: Option<Instant>,
    done: bool,
}

impl<T> Completions<'_, T> {
    async fn recv(&mut self) -> Result<Completion<T>> {
        let next = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.receiver.recv())
                .await
                .map_err(|_| BackupError::PoolTimeout(self.remaining))?,
            None => self.receiver.recv().await,
        };
        next.ok_or(BackupError::PoolClosed)
    }

    /// Take the job out of the registry and run its callback.
    async fn settle(&mut self, id: &str) -> bool {
        let job = self.pool.jobs.lock().await.remove(id);
        match job {
            Some(job) => {
                self.remaining -= 1;
                if let Some(callback) = job.callback {
                    callback();
                }
                true
            }
            None => {
                warn!(job = id, "Completion for unknown job");
                false
            }
        }
    }

    async fn finish(&mut self) {
        self.done = true;
        if self.remaining == 0 {
            self.pool.jobs.lock().await.clear();
        }
    }

    /// Drain everything still outstanding after a fatal failure.
    async fn drain(&mut self) {
        while self.remaining > 0 {
            match self.recv().await {
                Ok(Completion { id, result }) => {
                    if self.settle(&id).await {
                        if let Err(e) = result {
                            error!(job = %id, error = %e, "Job failed");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Stopped draining jobs");
                    return;
                }
            }
        }
    }

    pub async fn next(&mut self) -> Option<Result<T>> {
        while !self.done {
            if self.remaining == 0 {
                self.finish().await;
                break;
            }

            let Completion { id, result } = match self.recv().await {
                Ok(completion) => completion,
                Err(e) => {
                    self.finish().await;
                    return Some(Err(e));
                }
            };
            if !self.settle(&id).await {
                continue;
            }

            match result {
                Ok(value) => return Some(Ok(value)),
                Err(e) if self.keep_going => {
                    warn!(job = %id, error = %e, "Job failed, continuing");
                }
                Err(e) => {
                    error!(job = %id, error = %e, "Job failed");
                    self.drain().await;
                    self.finish().await;
                    return Some(Err(BackupError::JobFailed {
                        id,
                        source: Box::new(e),
                    }));
                }
            }
        }
        None
    }
}
