//! Cancellation tokens with reasons and deadlines.
//!
//! [`CancelToken`] wraps a `tokio_util` [`CancellationToken`] and adds the
//! two things the orchestration core needs on top of it: the reason recorded
//! when the token fired, and an optional deadline. Derived tokens fire when
//! their own trigger or any ancestor's fires, whichever comes first.
//!
//! Deadlines are checked lazily. Nothing runs in the background; an expired
//! token fires the next time someone asks [`CancelToken::is_cancelled`] or
//! while a task awaits [`CancelToken::cancelled`].

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A one-shot, monotonic cancellation signal.
#[derive(Clone)]
pub struct CancelToken {
    inner: CancellationToken,
    shared: Arc<TokenState>,
}

struct TokenState {
    reason: OnceLock<Error>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// A root token with no deadline.
    pub fn new() -> Self {
        Self::derive(None, None)
    }

    /// A root token that fires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::derive(None, Some(timeout))
    }

    /// A root token that fires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(None, Some(deadline), None)
    }

    /// A token derived from `parent` (if any) that additionally fires after
    /// `timeout` (if any).
    pub fn derive(parent: Option<&CancelToken>, timeout: Option<Duration>) -> Self {
        Self::build(parent, timeout.map(|t| Instant::now() + t), timeout)
    }

    /// A child that fires when this token fires.
    pub fn child(&self) -> Self {
        Self::derive(Some(self), None)
    }

    /// A child that fires when this token fires or after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self::derive(Some(self), Some(timeout))
    }

    /// A child that fires when this token fires or at `deadline`.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        Self::build(Some(self), Some(deadline), None)
    }

    fn build(
        parent: Option<&CancelToken>,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Self {
        let inner = match parent {
            Some(parent) => parent.inner.child_token(),
            None => CancellationToken::new(),
        };
        let timeout =
            timeout.or_else(|| deadline.map(|d| d.saturating_duration_since(Instant::now())));
        Self {
            inner,
            shared: Arc::new(TokenState {
                reason: OnceLock::new(),
                deadline,
                timeout,
                parent: parent.cloned(),
            }),
        }
    }

    /// Fire the token with `reason`.
    ///
    /// Firing is idempotent: only the first reason sticks, and a token that
    /// already fired (itself or through an ancestor) keeps its reason.
    pub fn cancel<S: Into<String>>(&self, reason: S) {
        self.fire(Error::cancelled(reason));
    }

    fn fire(&self, reason: Error) {
        if self.inner.is_cancelled() {
            return;
        }
        if self.shared.reason.set(reason).is_ok() {
            if let Some(reason) = self.shared.reason.get() {
                tracing::debug!(%reason, "token cancelled");
            }
            self.inner.cancel();
        }
    }

    /// Whether the token has fired. Expires an elapsed deadline.
    pub fn is_cancelled(&self) -> bool {
        self.poll_deadline()
    }

    fn poll_deadline(&self) -> bool {
        if self.inner.is_cancelled() {
            return true;
        }
        if let Some(parent) = &self.shared.parent {
            // firing the parent cancels our inner token as well
            if parent.poll_deadline() {
                return true;
            }
        }
        match self.shared.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.expire();
                true
            }
            _ => false,
        }
    }

    fn expire(&self) {
        let duration_ms = self.shared.timeout.unwrap_or_default().as_millis() as u64;
        self.fire(Error::timeout(duration_ms));
    }

    /// Resolves once the token fires.
    pub async fn cancelled(&self) {
        match self.effective_deadline() {
            None => self.inner.cancelled().await,
            Some(deadline) => {
                tokio::select! {
                    _ = self.inner.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        self.poll_deadline();
                        // the deadline that elapsed may belong to an ancestor
                        // whose expiry we just triggered
                        self.inner.cancelled().await;
                    }
                }
            }
        }
    }

    /// The reason the token fired, or `None` while it has not.
    ///
    /// A token fired through an ancestor reports the ancestor's reason.
    pub fn err(&self) -> Option<Error> {
        if !self.is_cancelled() {
            return None;
        }
        self.shared
            .reason
            .get()
            .cloned()
            .or_else(|| self.shared.parent.as_ref().and_then(|p| p.err()))
            .or_else(|| Some(Error::cancelled("cancelled")))
    }

    /// The error to surface after the token fired.
    pub fn cancel_error(&self) -> Error {
        self.err().unwrap_or_else(|| Error::cancelled("cancelled"))
    }

    /// The earliest deadline among this token and its ancestors.
    pub fn effective_deadline(&self) -> Option<Instant> {
        let parent = self
            .shared
            .parent
            .as_ref()
            .and_then(|p| p.effective_deadline());
        match (self.shared.deadline, parent) {
            (Some(own), Some(parent)) => Some(own.min(parent)),
            (own, parent) => own.or(parent),
        }
    }

    /// This token's own deadline, ignoring ancestors.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.deadline
    }

    /// Race `fut` against this token.
    ///
    /// Cancellation is checked first, so a token that already fired never
    /// lets `fut` make progress.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output> {
        if self.is_cancelled() {
            return Err(self.cancel_error());
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.cancel_error()),
            output = fut => Ok(output),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.inner.is_cancelled())
            .field("deadline", &self.shared.deadline)
            .field("reason", &self.shared.reason.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_records_first_reason() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.err().is_none());

        token.cancel("first");
        token.cancel("second");
        assert!(token.is_cancelled());
        assert!(matches!(token.err(), Some(Error::Cancelled { reason }) if reason == "first"));
    }

    #[tokio::test]
    async fn child_inherits_parent_reason() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.cancel("stop everything");
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(
            matches!(grandchild.err(), Some(Error::Cancelled { reason }) if reason == "stop everything")
        );

        // a late cancel on the child does not rewrite history
        child.cancel("too late");
        assert!(matches!(child.err(), Some(Error::Cancelled { reason }) if reason == "stop everything"));
    }

    #[tokio::test]
    async fn child_cancel_leaves_parent_running() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel("local");
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_lazily() {
        let token = CancelToken::with_timeout(Duration::from_millis(100));
        assert!(!token.is_cancelled());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(token.is_cancelled());
        assert!(matches!(token.err(), Some(Error::Timeout { duration_ms: 100 })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_resolves_at_deadline() {
        let token = CancelToken::with_timeout(Duration::from_secs(2));
        let start = Instant::now();
        token.cancelled().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(token.err().unwrap().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn child_observes_parent_deadline() {
        let parent = CancelToken::with_timeout(Duration::from_millis(50));
        let child = parent.child_with_timeout(Duration::from_secs(10));
        assert_eq!(child.effective_deadline(), parent.deadline());

        child.cancelled().await;
        assert!(parent.is_cancelled());
        assert!(matches!(child.err(), Some(Error::Timeout { duration_ms: 50 })));
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_child_deadline_wins() {
        let parent = CancelToken::with_timeout(Duration::from_secs(10));
        let child = parent.child_with_timeout(Duration::from_millis(20));

        child.cancelled().await;
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn run_until_cancelled_prefers_cancellation() {
        let token = CancelToken::new();
        assert_eq!(token.run_until_cancelled(async { 5 }).await.unwrap(), 5);

        token.cancel("done");
        let err = token.run_until_cancelled(async { 5 }).await.unwrap_err();
        assert!(err.is_cancellation());
    }
}
