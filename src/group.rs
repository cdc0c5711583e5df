//! Join barrier and cancel handle shared by every component.
//!
//! A [`TaskGroup`] owns the concurrent units a component spawns (workers,
//! stage runners, forwarders, splitters). It is the handle callers get back:
//! [`TaskGroup::wait`] joins every unit and [`TaskGroup::cancel`] asks them to
//! stop early. Dropping a group aborts whatever is still running.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::token::CancelToken;

/// Lifecycle shared by all components.
///
/// `Created → Running → Draining → Closed`, with a jump to `Cancelled` from
/// any non-terminal state when the group's token fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UnitState {
    Created,
    Running,
    /// Input closed; in-flight items are being finished
    Draining,
    Closed,
    Cancelled,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Closed | UnitState::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            UnitState::Created => 0,
            UnitState::Running => 1,
            UnitState::Draining => 2,
            UnitState::Closed | UnitState::Cancelled => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => UnitState::Created,
            1 => UnitState::Running,
            2 => UnitState::Draining,
            3 => UnitState::Closed,
            _ => UnitState::Cancelled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            UnitState::Created => 0,
            UnitState::Running => 1,
            UnitState::Draining => 2,
            UnitState::Closed => 3,
            UnitState::Cancelled => 4,
        }
    }
}

/// Monotonic state cell a group shares with its units.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<AtomicU8>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(UnitState::Created.as_u8())),
        }
    }

    pub fn get(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Backward moves and moves out of a terminal
    /// state are ignored. Returns whether the state changed.
    pub fn advance(&self, next: UnitState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = UnitState::from_u8(current);
                if current.is_terminal() || next.rank() <= current.rank() {
                    None
                } else {
                    Some(next.as_u8())
                }
            })
            .is_ok()
    }

    /// Mark the input as exhausted.
    pub fn draining(&self) {
        if self.advance(UnitState::Draining) {
            tracing::debug!("draining");
        }
    }

    fn settle(&self, cancelled: bool) {
        let terminal = if cancelled {
            UnitState::Cancelled
        } else {
            UnitState::Closed
        };
        if self.advance(terminal) {
            tracing::debug!(state = ?terminal, "terminated");
        }
    }
}

/// Handle over a set of concurrent units.
pub struct TaskGroup {
    name: &'static str,
    token: CancelToken,
    units: JoinSet<Result<()>>,
    lifecycle: Lifecycle,
    active: Arc<AtomicUsize>,
}

impl TaskGroup {
    /// A group whose token is a child of `parent`: cancelling the parent stops
    /// the group, cancelling the group leaves the parent alone.
    pub fn new(name: &'static str, parent: &CancelToken) -> Self {
        Self {
            name,
            token: parent.child(),
            units: JoinSet::new(),
            lifecycle: Lifecycle::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn a named unit onto the current tokio runtime.
    ///
    /// A unit that fails for any reason other than the group's own token
    /// firing (an operation timeout included) cancels the whole group so its
    /// siblings stop instead of blocking on it. Panics are
    /// caught and reported as [`Error::Panicked`].
    pub fn spawn<F>(&mut self, role: &'static str, index: usize, unit: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.lifecycle.advance(UnitState::Running);
        self.active.fetch_add(1, Ordering::AcqRel);

        let token = self.token.clone();
        let exit = UnitExit {
            active: self.active.clone(),
            lifecycle: self.lifecycle.clone(),
            token: token.clone(),
        };
        let span = tracing::debug_span!("unit", group = self.name, role, index);

        self.units.spawn(
            async move {
                let _exit = exit;
                tracing::debug!("running");
                let outcome = match AssertUnwindSafe(unit).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(Error::Panicked(panic_message(panic.as_ref()))),
                };
                match &outcome {
                    Ok(()) => tracing::debug!("finished"),
                    Err(e) if e.is_cancellation() && token.is_cancelled() => {
                        tracing::debug!(reason = %e, "cancelled")
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "unit failed, cancelling group");
                        token.cancel(format!("{} {} failed: {}", role, index, e));
                    }
                }
                outcome
            }
            .instrument(span),
        );
    }

    /// Request early termination of every unit.
    pub fn cancel<S: Into<String>>(&self, reason: S) {
        self.token.cancel(reason);
    }

    /// The group's token, for units spawned outside of [`TaskGroup::spawn`].
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> UnitState {
        self.lifecycle.get()
    }

    /// Number of units spawned and not yet joined
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Wait for every unit to terminate.
    ///
    /// Returns the first real failure if any unit failed; otherwise the
    /// cancellation reason if units were cut short; otherwise `Ok`.
    pub async fn wait(mut self) -> Result<()> {
        let mut first: Option<Error> = None;
        while let Some(joined) = self.units.join_next().await {
            let outcome = joined.map_err(Error::from).and_then(|r| r);
            if let Err(e) = outcome {
                let replace = match &first {
                    None => true,
                    Some(prev) => prev.is_cancellation() && !e.is_cancellation(),
                };
                if replace {
                    first = Some(e);
                }
            }
        }
        self.lifecycle.settle(self.token.is_cancelled());
        tracing::debug!(group = self.name, state = ?self.lifecycle.get(), "group joined");
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel and then wait.
    pub async fn shutdown<S: Into<String>>(self, reason: S) -> Result<()> {
        self.cancel(reason);
        self.wait().await
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("name", &self.name)
            .field("units", &self.units.len())
            .field("state", &self.lifecycle.get())
            .finish()
    }
}

// Settles the lifecycle once the last unit exits, however it exits.
struct UnitExit {
    active: Arc<AtomicUsize>,
    lifecycle: Lifecycle,
    token: CancelToken,
}

impl Drop for UnitExit {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lifecycle.settle(self.token.is_cancelled());
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Outputs of a component together with the handle that runs it.
#[derive(Debug)]
pub struct Spawned<O> {
    pub output: O,
    pub handle: TaskGroup,
}

impl<O> Spawned<O> {
    pub fn into_parts(self) -> (O, TaskGroup) {
        (self.output, self.handle)
    }

    pub fn state(&self) -> UnitState {
        self.handle.state()
    }

    pub fn cancel<S: Into<String>>(&self, reason: S) {
        self.handle.cancel(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lifecycle_only_moves_forward() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.get(), UnitState::Created);
        assert!(lifecycle.advance(UnitState::Running));
        assert!(lifecycle.advance(UnitState::Draining));
        assert!(!lifecycle.advance(UnitState::Running));
        assert!(lifecycle.advance(UnitState::Closed));
        assert!(!lifecycle.advance(UnitState::Cancelled));
        assert_eq!(lifecycle.get(), UnitState::Closed);
    }

    #[test]
    fn cancel_skips_draining() {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(UnitState::Running);
        assert!(lifecycle.advance(UnitState::Cancelled));
        assert_eq!(lifecycle.get(), UnitState::Cancelled);
    }

    #[tokio::test]
    async fn wait_joins_every_unit() {
        let root = CancelToken::new();
        let mut group = TaskGroup::new("test", &root);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let counter = counter.clone();
            group.spawn("counter", i, async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(group.state(), UnitState::Running);
        group.wait().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failure_cancels_siblings() {
        let root = CancelToken::new();
        let mut group = TaskGroup::new("test", &root);
        let token = group.token().clone();
        group.spawn("sleeper", 0, async move {
            token
                .run_until_cancelled(tokio::time::sleep(Duration::from_secs(3600)))
                .await
        });
        group.spawn("failer", 1, async { Err::<(), _>(Error::custom("boom")) });

        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, Error::Custom(ref msg) if msg == "boom"));
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let root = CancelToken::new();
        let mut group = TaskGroup::new("test", &root);
        async fn explode() -> Result<()> {
            panic!("unit exploded")
        }
        group.spawn("panicker", 0, explode());
        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, Error::Panicked(ref msg) if msg.contains("unit exploded")));
    }

    #[tokio::test]
    async fn cancellation_reason_reaches_wait() {
        let root = CancelToken::new();
        let mut group = TaskGroup::new("test", &root);
        let token = group.token().clone();
        group.spawn("sleeper", 0, async move {
            token
                .run_until_cancelled(std::future::pending::<()>())
                .await
        });
        let handle_token = group.token().clone();
        root.cancel("caller gave up");

        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { ref reason } if reason == "caller gave up"));
        assert!(handle_token.is_cancelled());
    }
}
