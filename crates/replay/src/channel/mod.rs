//! Rendezvous channel
//!
//! A closable, bounded queue for handing items one at a time between two
//! logical tasks inside a single invocation. The workflow handler sends step
//! requests and the step executor receives them.
//!
//! With a capacity of 0 (the default) every `send` waits until a receiver has
//! taken the item, so the handler never has more than one step in flight.
//!
//! ```text
//!   handler ──send──▶ [ senders | buffer (capacity) | receivers ] ──receive──▶ executor
//! ```
//!
//! Matching is strictly FIFO. A receiver already waiting when `send` is called
//! is resolved inside that call, bypassing the buffer.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Errors produced by the channel itself
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel is closed and holds nothing more to deliver
    #[error("channel is closed")]
    Closed,

    /// A waiting sender was dropped by `clear` or `close(true)`
    #[error("channel was cleared")]
    Cleared,
}

/// A sender parked until a receiver or buffer slot frees up
struct WaitingSender<T, E> {
    item: Result<T, E>,
    ack: oneshot::Sender<Result<(), E>>,
}

struct State<T, E> {
    buffer: VecDeque<Result<T, E>>,
    senders: VecDeque<WaitingSender<T, E>>,
    receivers: VecDeque<oneshot::Sender<Result<T, E>>>,
    closed: bool,
}

impl<T, E> State<T, E> {
    /// Pop the oldest sender whose `send` future is still alive
    fn pop_live_sender(&mut self) -> Option<WaitingSender<T, E>> {
        while let Some(sender) = self.senders.pop_front() {
            if !sender.ack.is_closed() {
                return Some(sender);
            }
        }
        None
    }
}

/// Handoff queue carrying values of `T` or failures of `E`
///
/// `E` defaults to [`ChannelError`]; any error type that can represent a
/// closed or cleared channel may be used instead, which lets callers
/// `throw` and `interrupt` with their own error type.
///
/// Cloning a channel yields another handle to the same queue.
///
/// # Example
///
/// ```
/// use everruns_replay::channel::Channel;
///
/// # tokio_test::block_on(async {
/// let channel: Channel<u32> = Channel::new(1);
/// channel.send(7).await.unwrap();
/// assert_eq!(channel.receive().await.unwrap(), 7);
/// # });
/// ```
pub struct Channel<T, E = ChannelError> {
    capacity: usize,
    state: Arc<Mutex<State<T, E>>>,
}

impl<T, E> Clone for Channel<T, E> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, E> std::fmt::Debug for Channel<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("buffered", &state.buffer.len())
            .field("senders", &state.senders.len())
            .field("receivers", &state.receivers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Channel<T, ChannelError> {
    /// Create a zero-capacity rendezvous channel
    pub fn rendezvous() -> Self {
        Self::new(0)
    }
}

impl<T, E> Channel<T, E>
where
    E: From<ChannelError>,
{
    /// Create a channel buffering up to `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Arc::new(Mutex::new(State {
                buffer: VecDeque::new(),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Maximum number of buffered items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Send a value
    ///
    /// The returned [`Delivery`] resolves once a receiver has taken the item
    /// or it was buffered. Fails with `Closed` if the channel is closed.
    pub fn send(&self, item: T) -> Delivery<E> {
        self.push(Ok(item))
    }

    /// Send a failure; receivers observe it as the error of `receive`
    pub fn throw(&self, error: E) -> Delivery<E> {
        self.push(Err(error))
    }

    /// Wait for the next item
    ///
    /// Buffered items are consumed oldest first. Fails with `Closed` if the
    /// channel is closed and nothing is left to deliver.
    pub fn receive(&self) -> Receipt<T, E> {
        let mut state = self.state.lock();

        if let Some(item) = state.buffer.pop_front() {
            if state.buffer.len() < self.capacity {
                if let Some(sender) = state.pop_live_sender() {
                    state.buffer.push_back(sender.item);
                    let _ = sender.ack.send(Ok(()));
                }
            }
            return Receipt::ready(item);
        }

        if let Some(sender) = state.pop_live_sender() {
            let _ = sender.ack.send(Ok(()));
            return Receipt::ready(sender.item);
        }

        if state.closed {
            return Receipt::ready(Err(ChannelError::Closed.into()));
        }

        let (tx, rx) = oneshot::channel();
        state.receivers.push_back(tx);
        Receipt::waiting(rx)
    }

    /// Close the channel
    ///
    /// Waiting receivers fail with `Closed`. With `clear`, waiting senders
    /// fail with `Cleared` and the buffer is dropped; otherwise buffered
    /// items and waiting senders stay deliverable.
    pub fn close(&self, clear: bool) -> Result<(), E> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed.into());
        }
        state.closed = true;

        if clear {
            for sender in state.senders.drain(..) {
                let _ = sender.ack.send(Err(ChannelError::Cleared.into()));
            }
            state.buffer.clear();
        }

        for receiver in state.receivers.drain(..) {
            let _ = receiver.send(Err(ChannelError::Closed.into()));
        }

        Ok(())
    }

    /// Drop all buffered items without closing
    ///
    /// Waiting senders fail with `Cleared`. Returns what was buffered.
    pub fn clear(&self) -> Vec<Result<T, E>> {
        let mut state = self.state.lock();
        for sender in state.senders.drain(..) {
            let _ = sender.ack.send(Err(ChannelError::Cleared.into()));
        }
        state.buffer.drain(..).collect()
    }

    /// Fail every currently waiting receiver with `error`
    ///
    /// The channel stays open; later receives behave normally.
    pub fn interrupt(&self, error: E)
    where
        E: Clone,
    {
        let mut state = self.state.lock();
        for receiver in state.receivers.drain(..) {
            let _ = receiver.send(Err(error.clone()));
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True when closed with nothing buffered and no sender waiting
    pub fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.closed
            && state.buffer.is_empty()
            && state.senders.iter().all(|sender| sender.ack.is_closed())
    }

    /// Number of items currently buffered
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    fn push(&self, item: Result<T, E>) -> Delivery<E> {
        let mut state = self.state.lock();
        if state.closed {
            return Delivery::ready(Err(ChannelError::Closed.into()));
        }

        let mut item = item;
        while let Some(receiver) = state.receivers.pop_front() {
            match receiver.send(item) {
                Ok(()) => return Delivery::ready(Ok(())),
                // receive future was dropped, try the next one
                Err(returned) => item = returned,
            }
        }

        if state.buffer.len() < self.capacity {
            state.buffer.push_back(item);
            return Delivery::ready(Ok(()));
        }

        let (ack, rx) = oneshot::channel();
        state.senders.push_back(WaitingSender { item, ack });
        Delivery::waiting(rx)
    }
}

/// Completion signal returned by [`Channel::send`] and [`Channel::throw`]
#[must_use = "a delivery does nothing unless awaited or dropped deliberately"]
pub struct Delivery<E> {
    inner: Pending<(), E>,
}

/// Future returned by [`Channel::receive`]
#[must_use = "a receipt does nothing unless awaited"]
pub struct Receipt<T, E> {
    inner: Pending<T, E>,
}

enum Pending<T, E> {
    Ready(Option<Result<T, E>>),
    Waiting(oneshot::Receiver<Result<T, E>>),
}

impl<T, E: From<ChannelError>> Pending<T, E> {
    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<Result<T, E>> {
        match self {
            Pending::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(ChannelError::Closed.into())),
            ),
            Pending::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or_else(|_| Err(ChannelError::Closed.into()))),
        }
    }
}

impl<E> Delivery<E> {
    fn ready(result: Result<(), E>) -> Self {
        Self {
            inner: Pending::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<(), E>>) -> Self {
        Self {
            inner: Pending::Waiting(rx),
        }
    }
}

impl<T, E> Receipt<T, E> {
    fn ready(result: Result<T, E>) -> Self {
        Self {
            inner: Pending::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<T, E>>) -> Self {
        Self {
            inner: Pending::Waiting(rx),
        }
    }
}

// Neither future pins its payload.
impl<E> Unpin for Delivery<E> {}
impl<T, E> Unpin for Receipt<T, E> {}

impl<E: From<ChannelError>> Future for Delivery<E> {
    type Output = Result<(), E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.poll_pending(cx)
    }
}

impl<T, E: From<ChannelError>> Future for Receipt<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.poll_pending(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Channel(ChannelError),
        Halt(&'static str),
    }

    impl From<ChannelError> for TestError {
        fn from(err: ChannelError) -> Self {
            Self::Channel(err)
        }
    }

    #[tokio::test]
    async fn test_rendezvous_send_waits_for_receiver() {
        let channel: Channel<u32> = Channel::rendezvous();

        let mut delivery = channel.send(1);
        assert!((&mut delivery).now_or_never().is_none());

        assert_eq!(channel.receive().await.unwrap(), 1);
        assert_eq!(delivery.await, Ok(()));
    }

    #[tokio::test]
    async fn test_waiting_receiver_resolved_inside_send() {
        let channel: Channel<&str> = Channel::rendezvous();

        let receipt = channel.receive();
        let delivery = channel.send("step");

        assert_eq!(delivery.now_or_never(), Some(Ok(())));
        assert_eq!(receipt.await.unwrap(), "step");
        assert_eq!(channel.buffered(), 0);
    }

    #[tokio::test]
    async fn test_fifo_order_across_waiting_senders() {
        let channel: Channel<u32> = Channel::rendezvous();

        let first = channel.send(1);
        let second = channel.send(2);
        let third = channel.send(3);

        assert_eq!(channel.receive().await.unwrap(), 1);
        assert_eq!(channel.receive().await.unwrap(), 2);
        assert_eq!(channel.receive().await.unwrap(), 3);

        first.await.unwrap();
        second.await.unwrap();
        third.await.unwrap();
    }

    #[tokio::test]
    async fn test_buffer_capacity() {
        let channel: Channel<u32> = Channel::new(2);

        assert_eq!(channel.send(1).now_or_never(), Some(Ok(())));
        assert_eq!(channel.send(2).now_or_never(), Some(Ok(())));

        let mut third = channel.send(3);
        assert!((&mut third).now_or_never().is_none());
        assert_eq!(channel.buffered(), 2);

        // Taking the oldest item moves the waiting sender into the buffer
        assert_eq!(channel.receive().await.unwrap(), 1);
        assert_eq!(third.await, Ok(()));
        assert_eq!(channel.buffered(), 2);

        assert_eq!(channel.receive().await.unwrap(), 2);
        assert_eq!(channel.receive().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_close_fails_waiting_receivers() {
        let channel: Channel<u32> = Channel::rendezvous();

        let receipt = channel.receive();
        channel.close(false).unwrap();

        assert_eq!(receipt.await, Err(ChannelError::Closed));
        assert_eq!(channel.receive().await, Err(ChannelError::Closed));
        assert_eq!(channel.send(1).await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_close_without_clear_keeps_senders_deliverable() {
        let channel: Channel<u32> = Channel::new(1);

        channel.send(1).await.unwrap();
        let waiting = channel.send(2);
        channel.close(false).unwrap();

        assert!(!channel.is_done());
        assert_eq!(channel.receive().await.unwrap(), 1);
        assert_eq!(channel.receive().await.unwrap(), 2);
        assert_eq!(waiting.await, Ok(()));

        assert!(channel.is_done());
        assert_eq!(channel.receive().await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_close_with_clear_fails_senders() {
        let channel: Channel<u32> = Channel::new(1);

        channel.send(1).await.unwrap();
        let waiting = channel.send(2);
        channel.close(true).unwrap();

        assert_eq!(waiting.await, Err(ChannelError::Cleared));
        assert!(channel.is_done());
        assert_eq!(channel.receive().await, Err(ChannelError::Closed));
    }

    #[test]
    fn test_close_twice_is_an_error() {
        let channel: Channel<u32> = Channel::rendezvous();
        channel.close(false).unwrap();
        assert_eq!(channel.close(false), Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_clear_drops_buffer_without_closing() {
        let channel: Channel<u32> = Channel::new(1);

        channel.send(1).await.unwrap();
        let waiting = channel.send(2);

        let dropped = channel.clear();
        assert_eq!(dropped, vec![Ok(1)]);
        assert_eq!(waiting.await, Err(ChannelError::Cleared));
        assert!(!channel.is_closed());

        channel.send(3).await.unwrap();
        assert_eq!(channel.receive().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_throw_delivers_failure() {
        let channel: Channel<u32, TestError> = Channel::new(0);

        let receipt = channel.receive();
        channel.throw(TestError::Halt("boom")).await.unwrap();

        assert_eq!(receipt.await, Err(TestError::Halt("boom")));
    }

    #[tokio::test]
    async fn test_interrupt_fails_only_waiting_receivers() {
        let channel: Channel<u32, TestError> = Channel::new(0);

        let first = channel.receive();
        let second = channel.receive();
        channel.interrupt(TestError::Halt("fenced"));

        assert_eq!(first.await, Err(TestError::Halt("fenced")));
        assert_eq!(second.await, Err(TestError::Halt("fenced")));

        // Still open
        assert!(!channel.is_closed());
        let receipt = channel.receive();
        channel.send(9).await.unwrap();
        assert_eq!(receipt.await, Ok(9));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_skipped() {
        let channel: Channel<u32> = Channel::rendezvous();

        drop(channel.receive());
        let live = channel.receive();

        channel.send(5).await.unwrap();
        assert_eq!(live.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_skipped() {
        let channel: Channel<u32> = Channel::rendezvous();

        drop(channel.send(1));
        let live = channel.send(2);

        assert_eq!(channel.receive().await.unwrap(), 2);
        live.await.unwrap();
    }

    #[tokio::test]
    async fn test_handoff_between_tasks() {
        let channel: Channel<u32> = Channel::rendezvous();
        let producer = channel.clone();

        let handle = tokio::spawn(async move {
            for i in 0..5 {
                producer.send(i).await.unwrap();
            }
            producer.close(false).unwrap();
        });

        let mut received = vec![];
        while let Ok(item) = channel.receive().await {
            received.push(item);
        }

        handle.await.unwrap();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        assert!(channel.is_done());
    }
}
