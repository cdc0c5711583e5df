//! Configuration for the orchestration components.

use std::time::Duration;

/// Configuration for a [`WorkerPool`](crate::pool::WorkerPool)
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolConfig {
    /// Number of workers draining the task stream
    pub workers: usize,
    /// Capacity of the task and result streams the pool creates
    pub buffer_size: usize,
    /// Maximum time a single task may take
    pub operation_timeout: Option<Duration>,
    /// Whether a failing task stops the pool, or is logged and skipped
    pub fail_fast: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            buffer_size: 64,
            operation_timeout: None,
            fail_fast: true,
        }
    }
}

impl PoolConfig {
    /// Set the number of workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the per-task timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set whether to fail fast on errors
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Configuration for pipeline stages and emitters
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageConfig {
    /// Capacity of each stage's output stream (0 = rendezvous)
    pub buffer_size: usize,
    /// Maximum time a single transform may take
    pub operation_timeout: Option<Duration>,
    /// Whether a failing transform stops the pipeline, or is logged and skipped
    pub fail_fast: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16,
            operation_timeout: None,
            fail_fast: true,
        }
    }
}

impl StageConfig {
    /// Set the buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the per-item timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set whether to fail fast on errors
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Configuration for fan-in and fan-out
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FanConfig {
    /// Capacity of each output stream.
    ///
    /// The default of 0 makes a fan-out unit claim an item only when its
    /// consumer is ready to take it.
    pub buffer_size: usize,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self { buffer_size: 0 }
    }
}

impl FanConfig {
    /// Set the buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}
