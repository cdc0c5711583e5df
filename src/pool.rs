//! Worker pools.
//!
//! A [`WorkerPool`] runs N workers against one shared task stream. Each task
//! is claimed by exactly one worker, transformed, and sent to a shared result
//! stream. The result stream is closed only after the last worker has exited,
//! so no transform still in flight can ever hit a closed stream.

use std::fmt;
use std::sync::Arc;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::group::{Lifecycle, Spawned, TaskGroup};
use crate::stream::{channel, CloseOnDrop, Receiver, Sender};
use crate::token::CancelToken;
use crate::transform::{apply_with_timeout, Transform};

/// Identifier assigned to a task at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of work submitted to a pool
#[derive(Debug, Clone, PartialEq)]
pub struct Task<T> {
    pub id: TaskId,
    pub payload: T,
}

impl<T> Task<T> {
    pub fn new(id: u64, payload: T) -> Self {
        Self {
            id: TaskId(id),
            payload,
        }
    }
}

/// The outcome of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult<O> {
    /// The task this result belongs to
    pub id: TaskId,
    /// Index of the worker that processed it
    pub worker: usize,
    pub output: O,
}

/// Producer side of a pool's task stream.
///
/// Assigns sequential ids. Call [`TaskSubmitter::finish`] once every task is
/// submitted; dropping the submitter closes the task stream as well.
pub struct TaskSubmitter<T> {
    sender: Sender<Task<T>>,
    next_id: u64,
}

impl<T> TaskSubmitter<T> {
    pub fn new(sender: Sender<Task<T>>) -> Self {
        Self { sender, next_id: 0 }
    }

    /// Submit a payload, suspending while the task stream is full
    pub async fn submit(&mut self, payload: T) -> Result<TaskId> {
        let task = self.next_task(payload);
        let id = task.id;
        self.sender.send(task).await?;
        Ok(id)
    }

    /// Submit a payload, giving up when `token` fires
    pub async fn submit_cancellable(&mut self, payload: T, token: &CancelToken) -> Result<TaskId> {
        let task = self.next_task(payload);
        let id = task.id;
        self.sender.send_cancellable(task, token).await?;
        Ok(id)
    }

    /// Submit every payload in order
    pub async fn submit_all<I>(&mut self, payloads: I) -> Result<Vec<TaskId>>
    where
        I: IntoIterator<Item = T>,
    {
        let mut ids = Vec::new();
        for payload in payloads {
            ids.push(self.submit(payload).await?);
        }
        Ok(ids)
    }

    /// Number of tasks submitted so far
    pub fn submitted(&self) -> u64 {
        self.next_id
    }

    /// Close the task stream; workers exit once it is drained
    pub fn finish(self) -> Result<()> {
        self.sender.close()
    }

    fn next_task(&mut self, payload: T) -> Task<T> {
        let task = Task::new(self.next_id, payload);
        self.next_id += 1;
        task
    }
}

/// A fixed-size pool of workers sharing one transform.
///
/// ```rust
/// use taskweld::prelude::*;
///
/// # #[tokio::main] async fn main() -> Result<()> {
/// let token = CancelToken::new();
/// let (mut submitter, pool) = WorkerPool::new(map_fn(|x: u64| x * 2))
///     .workers(3)
///     .spawn(&token);
///
/// submitter.submit_all(1..=9).await?;
/// submitter.finish()?;
///
/// let (results, handle) = pool.into_parts();
/// let mut doubled: Vec<u64> = results.collect_all().await.into_iter().map(|r| r.output).collect();
/// handle.wait().await?;
///
/// doubled.sort();
/// assert_eq!(doubled, vec![2, 4, 6, 8, 10, 12, 14, 16, 18]);
/// # Ok(()) }
/// ```
pub struct WorkerPool<Tr> {
    transform: Arc<Tr>,
    config: PoolConfig,
}

impl<Tr: Transform> WorkerPool<Tr> {
    /// Create a new pool around `transform`
    pub fn new(transform: Tr) -> Self {
        Self {
            transform: Arc::new(transform),
            config: PoolConfig::default(),
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the buffer size of streams created by [`WorkerPool::spawn`]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the per-task timeout
    pub fn operation_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.operation_timeout = Some(timeout);
        self
    }

    /// Set whether to fail fast on errors
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start the workers on caller-provided streams.
    ///
    /// The pool becomes the sole closer of `results`: it is closed after the
    /// last worker exits, and nobody else may close it. At least one worker
    /// is always started.
    pub fn start(
        self,
        tasks: Receiver<Task<Tr::Input>>,
        results: Sender<TaskResult<Tr::Output>>,
        token: &CancelToken,
    ) -> TaskGroup {
        let mut group = TaskGroup::new("worker-pool", token);
        let results = Arc::new(CloseOnDrop::new(results));
        let workers = self.config.workers.max(1);

        tracing::debug!(workers, "starting worker pool");
        for index in 0..workers {
            let worker = Worker {
                index,
                transform: self.transform.clone(),
                tasks: tasks.clone(),
                results: results.clone(),
                token: group.token().clone(),
                lifecycle: group.lifecycle().clone(),
                config: self.config.clone(),
            };
            group.spawn("worker", index, worker.run());
        }
        group
    }

    /// Start the workers on fresh streams sized by the configured buffer.
    pub fn spawn(
        self,
        token: &CancelToken,
    ) -> (
        TaskSubmitter<Tr::Input>,
        Spawned<Receiver<TaskResult<Tr::Output>>>,
    ) {
        let (task_tx, task_rx) = channel(self.config.buffer_size);
        let (result_tx, result_rx) = channel(self.config.buffer_size);
        let handle = self.start(task_rx, result_tx, token);
        (
            TaskSubmitter::new(task_tx),
            Spawned {
                output: result_rx,
                handle,
            },
        )
    }
}

struct Worker<Tr: Transform> {
    index: usize,
    transform: Arc<Tr>,
    tasks: Receiver<Task<Tr::Input>>,
    // shared by all workers; the last one out closes the result stream
    results: Arc<CloseOnDrop<TaskResult<Tr::Output>>>,
    token: CancelToken,
    lifecycle: Lifecycle,
    config: PoolConfig,
}

impl<Tr: Transform> Worker<Tr> {
    async fn run(self) -> Result<()> {
        let mut processed = 0usize;
        loop {
            let task = match self.tasks.recv_cancellable(&self.token).await? {
                Some(task) => task,
                None => {
                    self.lifecycle.draining();
                    tracing::debug!(processed, "task stream drained");
                    return Ok(());
                }
            };

            tracing::trace!(task = %task.id, "processing");
            let applied = self
                .token
                .run_until_cancelled(apply_with_timeout(
                    self.transform.as_ref(),
                    task.payload,
                    self.config.operation_timeout,
                ))
                .await?;

            let output = match applied {
                Ok(output) => output,
                Err(e) if self.config.fail_fast => return Err(e),
                Err(e) => {
                    tracing::warn!(task = %task.id, error = %e, "task failed, skipping");
                    continue;
                }
            };

            let result = TaskResult {
                id: task.id,
                worker: self.index,
                output,
            };
            self.results
                .send_cancellable(result, &self.token)
                .await
                .map_err(|e| match e {
                    Error::Closed => Error::custom("every result receiver was dropped"),
                    other => other,
                })?;
            processed += 1;
        }
    }
}
