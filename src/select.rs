//! Multiplexed wait over several streams, a token and a timeout.
//!
//! [`Select`] blocks until the first of its sources is ready and reports
//! which one fired. When several are ready at once the winner is picked from
//! a random starting point so no source is starved. Sources that lose keep
//! their values: receiving only takes a value in the poll that returns it.
//!
//! For sources of different item types, `tokio::select!` over
//! [`Receiver::recv`] futures gives the same guarantees.

use std::future::Future;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use crate::error::Error;
use crate::stream::Receiver;
use crate::token::CancelToken;

/// Which source a [`Select`] observed first.
#[derive(Debug)]
pub enum Selected<T> {
    /// Stream `index` produced a value
    Item { index: usize, value: T },
    /// Stream `index` is closed and drained
    Closed { index: usize },
    /// The token fired
    Cancelled(Error),
    /// The explicit timeout elapsed first
    TimedOut,
}

impl<T> Selected<T> {
    /// The received value, if a stream produced one
    pub fn into_value(self) -> Option<T> {
        match self {
            Selected::Item { value, .. } => Some(value),
            _ => None,
        }
    }
}

type Branch<'a, T> = Pin<Box<dyn Future<Output = Selected<T>> + Send + 'a>>;

/// A one-shot multiplexed wait.
///
/// ```rust
/// use std::time::Duration;
/// use taskweld::select::{Select, Selected};
/// use taskweld::stream::channel;
///
/// # #[tokio::main] async fn main() {
/// let (tx, rx) = channel::<&str>(1);
/// tx.send("ready").await.unwrap();
///
/// let selected = Select::new()
///     .recv(&rx)
///     .timeout(Duration::from_millis(300))
///     .wait()
///     .await;
/// assert!(matches!(selected, Selected::Item { index: 0, value: "ready" }));
/// # }
/// ```
pub struct Select<'a, T> {
    receivers: Vec<&'a Receiver<T>>,
    token: Option<&'a CancelToken>,
    timeout: Option<Duration>,
}

impl<'a, T: Send + 'a> Select<'a, T> {
    pub fn new() -> Self {
        Self {
            receivers: Vec::new(),
            token: None,
            timeout: None,
        }
    }

    /// Add a stream; its index is the number of streams added before it
    pub fn recv(mut self, receiver: &'a Receiver<T>) -> Self {
        self.receivers.push(receiver);
        self
    }

    /// Add several streams at once
    pub fn recv_all<I>(mut self, receivers: I) -> Self
    where
        I: IntoIterator<Item = &'a Receiver<T>>,
    {
        self.receivers.extend(receivers);
        self
    }

    /// Also wake when `token` fires
    pub fn cancelled(mut self, token: &'a CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Also wake once `timeout` has elapsed since [`Select::wait`] started
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Block until one source is ready.
    ///
    /// With no sources at all this never resolves.
    pub async fn wait(self) -> Selected<T> {
        let mut branches: Vec<Branch<'a, T>> = Vec::with_capacity(self.receivers.len() + 2);

        for (index, receiver) in self.receivers.into_iter().enumerate() {
            branches.push(Box::pin(async move {
                match receiver.recv().await {
                    Some(value) => Selected::Item { index, value },
                    None => Selected::Closed { index },
                }
            }));
        }
        if let Some(token) = self.token {
            branches.push(Box::pin(async move {
                token.cancelled().await;
                Selected::Cancelled(token.cancel_error())
            }));
        }
        if let Some(timeout) = self.timeout {
            let sleep = tokio::time::sleep(timeout);
            branches.push(Box::pin(async move {
                sleep.await;
                Selected::TimedOut
            }));
        }

        if branches.is_empty() {
            return std::future::pending().await;
        }

        let start = fastrand::usize(..branches.len());
        futures::future::poll_fn(|cx| {
            let n = branches.len();
            for offset in 0..n {
                let i = (start + offset) % n;
                if let Poll::Ready(selected) = branches[i].as_mut().poll(cx) {
                    return Poll::Ready(selected);
                }
            }
            Poll::Pending
        })
        .await
    }
}

impl<'a, T: Send + 'a> Default for Select<'a, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::channel;
    use std::collections::HashSet;

    #[tokio::test(start_paused = true)]
    async fn both_producers_beat_the_timeout() {
        let (tx1, rx1) = channel::<String>(0);
        let (tx2, rx2) = channel::<String>(0);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx1.send("Message from channel 1".to_string()).await.unwrap();
        });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx2.send("Message from channel 2".to_string()).await.unwrap();
        });

        let mut seen = HashSet::new();
        for _ in 0..2 {
            let selected = Select::new()
                .recv(&rx1)
                .recv(&rx2)
                .timeout(Duration::from_millis(300))
                .wait()
                .await;
            match selected {
                Selected::Item { index, value } => {
                    seen.insert((index, value));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        assert!(seen.contains(&(0, "Message from channel 1".to_string())));
        assert!(seen.contains(&(1, "Message from channel 2".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_when_nothing_arrives() {
        let (_tx, rx) = channel::<u8>(1);
        let selected = Select::new()
            .recv(&rx)
            .timeout(Duration::from_millis(300))
            .wait()
            .await;
        assert!(matches!(selected, Selected::TimedOut));
    }

    #[tokio::test]
    async fn unchosen_sources_keep_their_values() {
        let (tx1, rx1) = channel(1);
        let (tx2, rx2) = channel(1);
        tx1.send(1).await.unwrap();
        tx2.send(2).await.unwrap();

        let first = Select::new().recv(&rx1).recv(&rx2).wait().await;
        let second = Select::new().recv(&rx1).recv(&rx2).wait().await;

        let mut values = vec![first.into_value().unwrap(), second.into_value().unwrap()];
        values.sort();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn closed_stream_is_ready() {
        let (tx, rx) = channel::<u8>(1);
        tx.close().unwrap();
        let selected = Select::new().recv(&rx).wait().await;
        assert!(matches!(selected, Selected::Closed { index: 0 }));
    }

    #[tokio::test]
    async fn token_wakes_the_wait() {
        let (_tx, rx) = channel::<u8>(1);
        let token = CancelToken::new();
        let canceller = token.clone();
        tokio::spawn(async move { canceller.cancel("abort") });

        let selected = Select::new().recv(&rx).cancelled(&token).wait().await;
        assert!(matches!(selected, Selected::Cancelled(Error::Cancelled { .. })));
    }

    #[tokio::test]
    async fn ties_are_not_always_resolved_the_same_way() {
        let mut winners = HashSet::new();
        for _ in 0..64 {
            let (tx1, rx1) = channel(1);
            let (tx2, rx2) = channel(1);
            tx1.send(()).await.unwrap();
            tx2.send(()).await.unwrap();
            if let Selected::Item { index, .. } = Select::new().recv(&rx1).recv(&rx2).wait().await {
                winners.insert(index);
            }
        }
        assert_eq!(winners.len(), 2);
    }
}
