//! Closable, directional streams.
//!
//! A stream is a FIFO conduit with an explicit closed state. It comes in three
//! capacities: rendezvous (`0`, a send completes only once a receiver has taken
//! the value), bounded and unbounded. The send half ([`Sender`]) and the
//! receive half ([`Receiver`]) are distinct types so direction is checked by
//! the compiler; [`Stream`] bundles both for code that needs either.
//!
//! Both halves are cheap to clone. A stream is closed explicitly with
//! [`Sender::close`], implicitly when the last [`Sender`] is dropped, and a
//! second explicit close is reported as [`Error::DuplicateClose`]. Values
//! buffered before the close stay receivable; once drained, [`Receiver::recv`]
//! returns `None` without blocking.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::error::{Error, Result, SendError, TryRecvError, TrySendError};
use crate::token::CancelToken;

/// How many values a stream buffers before `send` suspends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Sender and receiver must meet; nothing is buffered
    Rendezvous,
    /// Up to `n` values are buffered
    Bounded(usize),
    /// `send` never suspends
    Unbounded,
}

impl From<usize> for Capacity {
    fn from(n: usize) -> Self {
        if n == 0 {
            Capacity::Rendezvous
        } else {
            Capacity::Bounded(n)
        }
    }
}

/// Create a stream with the given capacity (`0` for a rendezvous stream).
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    with_capacity(Capacity::from(capacity))
}

/// Create a stream whose sends never suspend.
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    with_capacity(Capacity::Unbounded)
}

fn with_capacity<T>(capacity: Capacity) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            capacity,
            closed: false,
            next_seq: 0,
            delivered: 0,
            waiting_receivers: 0,
            senders: 1,
            receivers: 1,
        }),
        recv_ready: Notify::new(),
        send_ready: Notify::new(),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

struct State<T> {
    // Each value carries its send sequence number so a rendezvous sender can
    // tell whether its value has been taken.
    queue: VecDeque<(u64, T)>,
    capacity: Capacity,
    closed: bool,
    next_seq: u64,
    // One past the sequence number of the last value handed to a receiver.
    delivered: u64,
    waiting_receivers: usize,
    senders: usize,
    receivers: usize,
}

impl<T> State<T> {
    fn has_room(&self) -> bool {
        match self.capacity {
            Capacity::Bounded(n) => self.queue.len() < n,
            // rendezvous values queue up as pending handoffs
            Capacity::Rendezvous | Capacity::Unbounded => true,
        }
    }

    fn push(&mut self, value: T) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back((seq, value));
        seq
    }

    fn pop(&mut self) -> Option<T> {
        let (seq, value) = self.queue.pop_front()?;
        self.delivered = seq + 1;
        Some(value)
    }

    fn withdraw(&mut self, seq: u64) -> Option<T> {
        let pos = self.queue.iter().position(|(s, _)| *s == seq)?;
        self.queue.remove(pos).map(|(_, value)| value)
    }

    fn is_rendezvous(&self) -> bool {
        self.capacity == Capacity::Rendezvous
    }

    // A send would complete without waiting for a receiver to show up.
    fn receiver_ready(&self) -> bool {
        match self.capacity {
            Capacity::Rendezvous => self.waiting_receivers > self.queue.len(),
            Capacity::Bounded(n) => self.queue.len() < n,
            Capacity::Unbounded => true,
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && self.receivers > 0
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    // a value was pushed or the stream closed
    recv_ready: Notify,
    // a value was taken, or the stream closed, or the last receiver left
    send_ready: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::DuplicateClose);
            }
            state.closed = true;
        }
        self.recv_ready.notify_waiters();
        self.send_ready.notify_waiters();
        Ok(())
    }

    async fn wait_until<F>(&self, notify: &Notify, mut done: F)
    where
        F: FnMut(&State<T>) -> bool,
    {
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let finished = {
                let state = self.lock();
                done(&state)
            };
            if finished {
                return;
            }
            notified.await;
        }
    }
}

/// The send half of a stream.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Send a value, suspending while the stream is full.
    ///
    /// On a rendezvous stream this returns once a receiver has taken the
    /// value. Closing the stream while the sender is suspended wakes it with
    /// the value handed back in [`SendError`]. Dropping the returned future
    /// before it completes leaves the value unsent.
    pub async fn send(&self, value: T) -> std::result::Result<(), SendError<T>> {
        let seq = loop {
            let notified = self.shared.send_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock();
                if state.closed || state.receivers == 0 {
                    return Err(SendError(value));
                }
                if state.has_room() {
                    let rendezvous = state.is_rendezvous();
                    let seq = state.push(value);
                    self.shared.recv_ready.notify_waiters();
                    if !rendezvous {
                        return Ok(());
                    }
                    break seq;
                }
            }
            notified.await;
        };

        self.await_handoff(seq).await
    }

    async fn await_handoff(&self, seq: u64) -> std::result::Result<(), SendError<T>> {
        let mut pending = PendingHandoff {
            shared: &self.shared,
            seq,
            armed: true,
        };
        loop {
            let notified = self.shared.send_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock();
                if state.delivered > seq {
                    pending.armed = false;
                    return Ok(());
                }
                if state.closed || state.receivers == 0 {
                    pending.armed = false;
                    let withdrawn = state.withdraw(seq);
                    drop(state);
                    self.shared.send_ready.notify_waiters();
                    return match withdrawn {
                        Some(value) => Err(SendError(value)),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }

    /// Send without suspending.
    ///
    /// A rendezvous stream accepts the value only if a receiver is already
    /// waiting for one.
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>> {
        {
            let mut state = self.shared.lock();
            if state.closed || state.receivers == 0 {
                return Err(TrySendError::Closed(value));
            }
            if !state.receiver_ready() {
                return Err(TrySendError::Full(value));
            }
            state.push(value);
        }
        self.shared.recv_ready.notify_waiters();
        Ok(())
    }

    /// Wait until a send would go through without suspending.
    ///
    /// On a rendezvous stream that means a receiver is waiting for a value
    /// nobody has offered yet; on a bounded stream, that there is room.
    /// Fails with [`Error::Closed`] once the stream is closed or every
    /// receiver is gone.
    pub async fn ready(&self) -> Result<()> {
        self.shared
            .wait_until(&self.shared.send_ready, |state| {
                !state.is_open() || state.receiver_ready()
            })
            .await;
        if self.shared.lock().is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    // Resolves once a send would suspend again, or the stream shut.
    pub(crate) async fn until_unready(&self) {
        self.shared
            .wait_until(&self.shared.send_ready, |state| {
                !state.is_open() || !state.receiver_ready()
            })
            .await;
    }

    /// Send, giving up when `token` fires.
    ///
    /// Cancellation is checked first, so a fired token wins over free
    /// capacity.
    pub async fn send_cancellable(&self, value: T, token: &CancelToken) -> Result<()> {
        token
            .run_until_cancelled(self.send(value))
            .await?
            .map_err(Error::from)
    }

    /// Close the stream.
    ///
    /// Only one party may close a stream; a second close is an ownership
    /// violation and returns [`Error::DuplicateClose`].
    pub fn close(&self) -> Result<()> {
        let result = self.shared.close();
        if result.is_err() {
            tracing::error!("stream closed twice");
        } else {
            tracing::trace!("stream closed");
        }
        result
    }

    /// Whether the stream has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of values currently buffered
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The capacity this stream was created with
    pub fn capacity(&self) -> Capacity {
        self.shared.lock().capacity
    }

    /// Whether both handles belong to the same stream
    pub fn same_stream(&self, other: &Sender<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last_open = {
            let mut state = self.shared.lock();
            state.senders -= 1;
            state.senders == 0 && !state.closed
        };
        if last_open {
            // no one is left to close it
            if self.shared.close().is_ok() {
                tracing::trace!("last sender dropped, stream closed");
            }
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Sender")
            .field("capacity", &state.capacity)
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

// Withdraws a rendezvous value that was never taken when its send is dropped.
struct PendingHandoff<'a, T> {
    shared: &'a Shared<T>,
    seq: u64,
    armed: bool,
}

impl<T> Drop for PendingHandoff<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            if state.delivered <= self.seq && state.withdraw(self.seq).is_some() {
                drop(state);
                self.shared.send_ready.notify_waiters();
            }
        }
    }
}

/// The receive half of a stream.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Receive the next value.
    ///
    /// Suspends while the stream is empty and open. Returns `None` once the
    /// stream is closed and drained. Dropping the future before it completes
    /// never loses a value.
    pub async fn recv(&self) -> Option<T> {
        let mut waiting: Option<WaitingReceiver<'_, T>> = None;
        loop {
            let notified = self.shared.recv_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock();
                if let Some(value) = state.pop() {
                    self.shared.send_ready.notify_waiters();
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
                if waiting.is_none() {
                    state.waiting_receivers += 1;
                    waiting = Some(WaitingReceiver {
                        shared: &self.shared,
                    });
                    // a sender may be waiting for someone to ask
                    self.shared.send_ready.notify_waiters();
                }
            }
            notified.await;
        }
    }

    /// Receive without suspending.
    pub fn try_recv(&self) -> std::result::Result<T, TryRecvError> {
        let mut state = self.shared.lock();
        match state.pop() {
            Some(value) => {
                self.shared.send_ready.notify_waiters();
                Ok(value)
            }
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Receive, giving up when `token` fires.
    pub async fn recv_cancellable(&self, token: &CancelToken) -> Result<Option<T>> {
        token.run_until_cancelled(self.recv()).await
    }

    /// Resolves once the stream is closed and every value has been taken.
    pub async fn drained(&self) {
        self.shared
            .wait_until(&self.shared.send_ready, |state| {
                state.closed && state.queue.is_empty()
            })
            .await;
    }

    /// Receive every remaining value until the stream is closed and drained.
    pub async fn collect_all(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        items
    }

    /// Adapt this receiver into a [`futures::Stream`].
    pub fn into_stream(self) -> impl futures::Stream<Item = T>
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }

    /// Whether the stream has been closed (values may still be buffered)
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Whether the stream is closed and nothing is left to receive
    pub fn is_terminated(&self) -> bool {
        let state = self.shared.lock();
        state.closed && state.queue.is_empty()
    }

    /// Number of values currently buffered
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The capacity this stream was created with
    pub fn capacity(&self) -> Capacity {
        self.shared.lock().capacity
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.lock().receivers += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.lock();
            state.receivers -= 1;
            state.receivers == 0
        };
        if last {
            // suspended senders would otherwise wait forever
            self.shared.send_ready.notify_waiters();
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Receiver")
            .field("capacity", &state.capacity)
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

struct WaitingReceiver<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Drop for WaitingReceiver<'_, T> {
    fn drop(&mut self) {
        self.shared.lock().waiting_receivers -= 1;
        self.shared.send_ready.notify_waiters();
    }
}

/// A bidirectional stream handle.
///
/// Holds one [`Sender`] and one [`Receiver`]; hand out the directional
/// halves with [`Stream::sender`], [`Stream::receiver`] or [`Stream::split`].
pub struct Stream<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Stream<T> {
    /// Create a stream with the given capacity (`0` for rendezvous)
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = channel(capacity);
        Self { sender, receiver }
    }

    /// Create a stream whose sends never suspend
    pub fn unbounded() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// A send-only handle
    pub fn sender(&self) -> Sender<T> {
        self.sender.clone()
    }

    /// A receive-only handle
    pub fn receiver(&self) -> Receiver<T> {
        self.receiver.clone()
    }

    /// Give up the bidirectional handle for its two halves
    pub fn split(self) -> (Sender<T>, Receiver<T>) {
        (self.sender, self.receiver)
    }

    /// See [`Sender::send`]
    pub async fn send(&self, value: T) -> std::result::Result<(), SendError<T>> {
        self.sender.send(value).await
    }

    /// See [`Sender::try_send`]
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>> {
        self.sender.try_send(value)
    }

    /// See [`Receiver::recv`]
    pub async fn recv(&self) -> Option<T> {
        self.receiver.recv().await
    }

    /// See [`Receiver::try_recv`]
    pub fn try_recv(&self) -> std::result::Result<T, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Close the stream; see [`Sender::close`]
    pub fn close(&self) -> Result<()> {
        self.sender.close()
    }

    /// Whether the stream has been closed
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("receiver", &self.receiver)
            .finish()
    }
}

/// Closes the wrapped stream when dropped.
///
/// Components hold their output through this guard so the stream is closed
/// on every exit path: normal exhaustion, errors, cancellation, aborts and
/// panics. Share it behind an `Arc` to close once the last holder exits.
pub struct CloseOnDrop<T> {
    sender: Sender<T>,
}

impl<T> CloseOnDrop<T> {
    pub fn new(sender: Sender<T>) -> Self {
        Self { sender }
    }
}

impl<T> Deref for CloseOnDrop<T> {
    type Target = Sender<T>;

    fn deref(&self) -> &Sender<T> {
        &self.sender
    }
}

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        if let Err(e) = self.sender.shared.close() {
            tracing::error!(error = %e, "owned output stream was closed by another party");
            if !std::thread::panicking() {
                debug_assert!(false, "output stream closed by a second closer");
            }
        }
    }
}
