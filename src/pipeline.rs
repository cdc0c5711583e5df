//! Staged pipelines.
//!
//! A stage is one concurrent unit that receives from its input stream,
//! applies a [`Transform`] and sends to an output stream it owns. The output
//! is closed on every exit path: when the input is exhausted, when the
//! transform fails, and when the token fires, so downstream stages never hang.
//!
//! Stages talk only through streams, so backpressure propagates by itself: a
//! slow stage fills its input buffer, which suspends the stage feeding it, and
//! so on back to the source.

use crate::config::StageConfig;
use crate::error::Result;
use crate::group::{Lifecycle, Spawned, TaskGroup};
use crate::stream::{channel, CloseOnDrop, Receiver};
use crate::token::CancelToken;
use crate::transform::{apply_with_timeout, map_fn, Transform};

/// Spawn a unit that sends every item of `items`, then closes its output.
pub fn emit<I>(items: I, config: &StageConfig, token: &CancelToken) -> Spawned<Receiver<I::Item>>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    let mut group = TaskGroup::new("emitter", token);
    let output = spawn_emitter(&mut group, items, config);
    Spawned {
        output,
        handle: group,
    }
}

/// Connect one stage to `upstream`; the stage becomes the sole consumer of
/// `upstream` and the sole closer of the returned output.
pub fn connect_stage<Tr: Transform>(
    transform: Tr,
    upstream: Receiver<Tr::Input>,
    config: &StageConfig,
    token: &CancelToken,
) -> Spawned<Receiver<Tr::Output>> {
    let mut group = TaskGroup::new("stage", token);
    let output = spawn_stage(&mut group, 0, transform, upstream, config);
    Spawned {
        output,
        handle: group,
    }
}

fn spawn_emitter<I>(group: &mut TaskGroup, items: I, config: &StageConfig) -> Receiver<I::Item>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    let (tx, rx) = channel(config.buffer_size);
    let output = CloseOnDrop::new(tx);
    let items = items.into_iter();
    let token = group.token().clone();
    let lifecycle = group.lifecycle().clone();

    group.spawn("emitter", 0, async move {
        let mut emitted = 0usize;
        for item in items {
            output.send_cancellable(item, &token).await?;
            emitted += 1;
        }
        lifecycle.draining();
        tracing::debug!(emitted, "source exhausted, closing output");
        Ok(())
    });
    rx
}

fn spawn_stage<Tr: Transform>(
    group: &mut TaskGroup,
    index: usize,
    transform: Tr,
    input: Receiver<Tr::Input>,
    config: &StageConfig,
) -> Receiver<Tr::Output> {
    let (tx, rx) = channel(config.buffer_size);
    let runner = StageRunner {
        transform,
        input,
        output: CloseOnDrop::new(tx),
        token: group.token().clone(),
        lifecycle: group.lifecycle().clone(),
        config: config.clone(),
    };
    group.spawn("stage", index, runner.run());
    rx
}

struct StageRunner<Tr: Transform> {
    transform: Tr,
    input: Receiver<Tr::Input>,
    output: CloseOnDrop<Tr::Output>,
    token: CancelToken,
    lifecycle: Lifecycle,
    config: StageConfig,
}

impl<Tr: Transform> StageRunner<Tr> {
    async fn run(self) -> Result<()> {
        let mut forwarded = 0usize;
        loop {
            let item = match self.input.recv_cancellable(&self.token).await? {
                Some(item) => item,
                None => {
                    self.lifecycle.draining();
                    tracing::debug!(forwarded, "upstream exhausted, closing output");
                    return Ok(());
                }
            };

            let applied = self
                .token
                .run_until_cancelled(apply_with_timeout(
                    &self.transform,
                    item,
                    self.config.operation_timeout,
                ))
                .await?;

            match applied {
                Ok(output) => {
                    self.output.send_cancellable(output, &self.token).await?;
                    forwarded += 1;
                }
                Err(e) if self.config.fail_fast => return Err(e),
                Err(e) => tracing::warn!(error = %e, "transform failed, skipping item"),
            }
        }
    }
}

/// A typed chain of stages sharing one handle.
///
/// ```rust
/// use taskweld::prelude::*;
///
/// # #[tokio::main] async fn main() -> Result<()> {
/// let token = CancelToken::new();
/// let results = Pipeline::from_iter(1..=5, StageConfig::default(), &token)
///     .map(|n: i64| n * n)
///     .map(|n: i64| format!("Square result: {}", n))
///     .collect()
///     .await?;
/// assert_eq!(results[4], "Square result: 25");
/// # Ok(()) }
/// ```
pub struct Pipeline<T> {
    output: Receiver<T>,
    group: TaskGroup,
    config: StageConfig,
    stages: usize,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Start a pipeline whose source emits every item of `items`
    pub fn from_iter<I>(items: I, config: StageConfig, token: &CancelToken) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let mut group = TaskGroup::new("pipeline", token);
        let output = spawn_emitter(&mut group, items, &config);
        Self {
            output,
            group,
            config,
            stages: 0,
        }
    }

    /// Start a pipeline from an existing stream; the first stage becomes its
    /// sole consumer
    pub fn from_receiver(source: Receiver<T>, config: StageConfig, token: &CancelToken) -> Self {
        Self {
            output: source,
            group: TaskGroup::new("pipeline", token),
            config,
            stages: 0,
        }
    }

    /// Use `config` for the stages added after this call
    pub fn with_config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a stage
    pub fn stage<Tr>(mut self, transform: Tr) -> Pipeline<Tr::Output>
    where
        Tr: Transform<Input = T>,
    {
        let output = spawn_stage(
            &mut self.group,
            self.stages,
            transform,
            self.output,
            &self.config,
        );
        Pipeline {
            output,
            group: self.group,
            config: self.config,
            stages: self.stages + 1,
        }
    }

    /// Append a stage applying a plain function
    pub fn map<F, U>(self, f: F) -> Pipeline<U>
    where
        F: Fn(T) -> U + Send + Sync + 'static,
        U: Send + 'static,
    {
        self.stage(map_fn(f))
    }

    /// Number of stages added so far
    pub fn len(&self) -> usize {
        self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages == 0
    }

    /// Request early termination of every stage
    pub fn cancel<S: Into<String>>(&self, reason: S) {
        self.group.cancel(reason);
    }

    /// The final output stream and the handle running the stages
    pub fn build(self) -> Spawned<Receiver<T>> {
        Spawned {
            output: self.output,
            handle: self.group,
        }
    }

    /// Drain the final output, then wait for every stage.
    ///
    /// On cancellation or failure the error is returned and the values already
    /// produced are dropped; use [`Pipeline::build`] to keep them.
    pub async fn collect(self) -> Result<Vec<T>> {
        let (output, handle) = self.build().into_parts();
        let items = output.collect_all().await;
        handle.wait().await?;
        Ok(items)
    }
}
