//! Bounded, ordered, single-producer/single-consumer message channel.
//!
//! The channel is the backpressure mechanism of the session manager:
//! a full channel suspends the producer instead of dropping messages
//! or growing without bound.
//!
//! # Contract
//!
//! - Capacity is fixed at construction; the buffer never holds more
//!   than `capacity` unread messages.
//! - [`Sender::send`] suspends while the buffer is full and fails with
//!   [`ConduitError::ChannelClosed`] once the channel is closed.
//! - [`Receiver::recv`] suspends while the buffer is empty and the
//!   channel open. After close it drains the remaining messages and
//!   then yields `Ok(None)` (end-of-stream).
//! - Close is idempotent and wakes every suspended task.
//! - Abort discards buffered messages and wakes every suspended task
//!   with the abort reason instead of data.
//!
//! Every suspension point also selects on the channel's
//! [`CancellationToken`]; cancelling the token aborts the channel with
//! [`AbortReason::Cancelled`] unless a more specific reason was set first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use conduit_types::{AbortReason, ConduitError, Message, Result};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Direction of a session channel, seen from the server.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Client -> handler.
    Inbound,
    /// Handler -> client.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Lifecycle hooks a channel owner (the stream session) receives.
///
/// Hooks are always invoked after the channel lock is released.
pub(crate) trait ChannelObserver: Send + Sync {
    /// A message was sent or received.
    fn on_activity(&self);
    /// The channel transitioned to closed (first close only).
    fn on_closed(&self, direction: Direction);
    /// End-of-stream was observed by the receiver, or the buffer was released.
    fn on_drained(&self, direction: Direction);
    /// The channel was aborted (first abort only).
    fn on_aborted(&self, reason: AbortReason);
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct State {
    queue: VecDeque<Message>,
    next_seq: u64,
    closed: bool,
    /// End-of-stream delivered to the receiver, or the buffer released.
    drained: bool,
    aborted: Option<AbortReason>,
}

struct Shared {
    capacity: usize,
    direction: Direction,
    state: Mutex<State>,
    not_empty: Notify,
    not_full: Notify,
    cancel: CancellationToken,
    observer: Option<Weak<dyn ChannelObserver>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observer(&self) -> Option<Arc<dyn ChannelObserver>> {
        self.observer.as_ref().and_then(Weak::upgrade)
    }

    fn wake_all(&self) {
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn close(&self) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }
        self.wake_all();
        if let Some(observer) = self.observer() {
            observer.on_closed(self.direction);
        }
        true
    }

    /// Closes the channel and discards unread messages.
    fn release(&self) {
        let (newly_closed, newly_drained) = {
            let mut state = self.lock();
            let newly_closed = !state.closed;
            let newly_drained = !state.drained;
            state.closed = true;
            state.drained = true;
            state.queue.clear();
            state.queue.shrink_to_fit();
            (newly_closed, newly_drained)
        };
        self.wake_all();
        if let Some(observer) = self.observer() {
            if newly_closed {
                observer.on_closed(self.direction);
            }
            if newly_drained {
                observer.on_drained(self.direction);
            }
        }
    }

    fn abort(&self, reason: AbortReason) -> bool {
        {
            let mut state = self.lock();
            if state.aborted.is_some() {
                return false;
            }
            state.aborted = Some(reason.clone());
            state.closed = true;
            state.drained = true;
            state.queue.clear();
            state.queue.shrink_to_fit();
        }
        self.wake_all();
        if let Some(observer) = self.observer() {
            observer.on_aborted(reason);
        }
        true
    }

    fn touch(&self) {
        if let Some(observer) = self.observer() {
            observer.on_activity();
        }
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

/// Creates a standalone bounded channel with its own cancellation token.
///
/// Dropping the [`Sender`] closes the channel; dropping the [`Receiver`]
/// closes it and discards unread messages.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn bounded(capacity: usize) -> (Sender, Receiver) {
    let (tx, rx, _) = build(
        capacity,
        Direction::Outbound,
        CancellationToken::new(),
        None,
        true,
    );
    (tx, rx)
}

/// Creates a session-owned channel.
///
/// The sender does not close on drop: the session decides whether a
/// producer that went away finished or failed.
pub(crate) fn session_channel(
    capacity: usize,
    direction: Direction,
    cancel: CancellationToken,
    observer: Weak<dyn ChannelObserver>,
) -> (Sender, Receiver, ChannelHandle) {
    build(capacity, direction, cancel, Some(observer), false)
}

fn build(
    capacity: usize,
    direction: Direction,
    cancel: CancellationToken,
    observer: Option<Weak<dyn ChannelObserver>>,
    close_on_drop: bool,
) -> (Sender, Receiver, ChannelHandle) {
    assert!(capacity > 0, "channel capacity must be at least 1");
    let shared = Arc::new(Shared {
        capacity,
        direction,
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity),
            next_seq: 0,
            closed: false,
            drained: false,
            aborted: None,
        }),
        not_empty: Notify::new(),
        not_full: Notify::new(),
        cancel,
        observer,
    });
    (
        Sender {
            shared: shared.clone(),
            close_on_drop,
        },
        Receiver {
            shared: shared.clone(),
        },
        ChannelHandle { shared },
    )
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Producing end of a bounded channel. Not cloneable: one producer.
pub struct Sender {
    shared: Arc<Shared>,
    close_on_drop: bool,
}

impl Sender {
    /// Appends a message, suspending while the channel is full.
    ///
    /// Returns the message's sequence number.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::ChannelClosed`] once the channel is closed.
    /// - The abort reason (see `From<AbortReason> for ConduitError`)
    ///   once the channel is aborted, including while suspended.
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<u64> {
        let payload = payload.into();
        let shared = &*self.shared;
        loop {
            let notified = shared.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.lock();
                if let Some(reason) = &state.aborted {
                    return Err(reason.clone().into());
                }
                if state.closed {
                    return Err(ConduitError::ChannelClosed);
                }
                if state.queue.len() < shared.capacity {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.queue.push_back(Message::new(seq, payload));
                    drop(state);
                    shared.not_empty.notify_one();
                    shared.touch();
                    return Ok(seq);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shared.cancel.cancelled() => {
                    shared.abort(AbortReason::Cancelled);
                }
            }
        }
    }

    /// Closes the channel. Idempotent; returns `true` on the first call.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Returns a handle for inspecting or tearing down the channel.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        if self.close_on_drop {
            self.shared.close();
        }
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("direction", &self.shared.direction)
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Consuming end of a bounded channel. Not cloneable: one consumer.
pub struct Receiver {
    shared: Arc<Shared>,
}

impl Receiver {
    /// Takes the next message in FIFO order.
    ///
    /// Returns `Ok(None)` once the channel is closed and drained.
    ///
    /// # Errors
    ///
    /// Returns the abort reason if the channel was aborted, including
    /// while suspended. Buffered messages are not delivered after abort.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        let shared = &*self.shared;
        loop {
            let notified = shared.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.lock();
                if let Some(reason) = &state.aborted {
                    return Err(reason.clone().into());
                }
                if let Some(message) = state.queue.pop_front() {
                    drop(state);
                    shared.not_full.notify_one();
                    shared.touch();
                    return Ok(Some(message));
                }
                if state.closed {
                    let newly_drained = !state.drained;
                    state.drained = true;
                    drop(state);
                    if newly_drained {
                        if let Some(observer) = shared.observer() {
                            observer.on_drained(shared.direction);
                        }
                    }
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shared.cancel.cancelled() => {
                    shared.abort(AbortReason::Cancelled);
                }
            }
        }
    }

    /// Closes the channel for further sends; buffered messages stay readable.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Returns a handle for inspecting or tearing down the channel.
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Number of buffered, unread messages.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("direction", &self.shared.direction)
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ChannelHandle
// ---------------------------------------------------------------------------

/// Owner-side view of a channel: inspection and teardown, no data access.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Closes the channel. Idempotent; returns `true` on the first call.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Closes the channel and discards unread messages.
    ///
    /// Readers observe end-of-stream, not an error.
    pub fn release(&self) {
        self.shared.release()
    }

    /// Aborts the channel, discarding buffered messages.
    ///
    /// Idempotent; the first reason wins. Returns `true` on the first call.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.shared.abort(reason)
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of buffered, unread messages.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// `true` once the receiver saw end-of-stream or the buffer was released.
    pub fn is_drained(&self) -> bool {
        self.shared.lock().drained
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.shared.lock().aborted.clone()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ChannelHandle")
            .field("direction", &self.shared.direction)
            .field("capacity", &self.shared.capacity)
            .field("buffered", &state.queue.len())
            .field("closed", &state.closed)
            .field("aborted", &state.aborted)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn send_blocks_at_capacity() {
        for capacity in [1usize, 2, 5, 32] {
            let (mut tx, mut rx) = bounded(capacity);
            for i in 0..capacity {
                assert_eq!(tx.send(Bytes::from(vec![i as u8])).await, Ok(i as u64));
            }

            // The (C+1)-th send must suspend, not fail or drop.
            let blocked = timeout(SHORT, tx.send(Bytes::from_static(b"over"))).await;
            assert!(blocked.is_err(), "send beyond capacity {capacity} must block");
            assert_eq!(rx.len(), capacity);

            // One receive frees exactly one slot.
            assert!(rx.recv().await.is_ok());
            assert!(timeout(SHORT, tx.send(Bytes::from_static(b"fits"))).await.is_ok());
            assert_eq!(rx.len(), capacity);
        }
    }

    #[tokio::test]
    async fn blocked_sender_resumes_after_receive() {
        let (mut tx, mut rx) = bounded(1);
        tx.send(Bytes::from_static(b"a")).await.ok();

        let producer = tokio::spawn(async move {
            let seq = tx.send(Bytes::from_static(b"b")).await;
            (tx, seq)
        });
        tokio::time::sleep(SHORT).await;
        assert!(!producer.is_finished());

        let first = rx.recv().await.ok().flatten().map(|m| m.payload);
        assert_eq!(first, Some(Bytes::from_static(b"a")));

        let (_tx, seq) = producer.await.expect("producer task");
        assert_eq!(seq, Ok(1));
    }

    #[tokio::test]
    async fn fifo_order_with_concurrent_producer() {
        let (mut tx, mut rx) = bounded(3);
        let producer = tokio::spawn(async move {
            for i in 0u32..200 {
                tx.send(Bytes::from(i.to_be_bytes().to_vec())).await?;
            }
            Ok::<_, ConduitError>(())
        });

        let mut expected = 0u32;
        while let Some(message) = rx.recv().await.expect("recv") {
            assert_eq!(message.seq, u64::from(expected));
            assert_eq!(message.payload.as_ref(), expected.to_be_bytes());
            expected += 1;
        }
        assert_eq!(expected, 200);
        assert!(producer.await.expect("producer task").is_ok());
    }

    #[tokio::test]
    async fn close_drains_then_end_of_stream() {
        let (mut tx, mut rx) = bounded(4);
        tx.send(Bytes::from_static(b"1")).await.ok();
        tx.send(Bytes::from_static(b"2")).await.ok();
        assert!(tx.close());

        assert_eq!(tx.send(Bytes::from_static(b"3")).await, Err(ConduitError::ChannelClosed));
        assert_eq!(rx.recv().await.ok().flatten().map(|m| m.seq), Some(0));
        assert_eq!(rx.recv().await.ok().flatten().map(|m| m.seq), Some(1));
        assert_eq!(rx.recv().await, Ok(None));
        assert_eq!(rx.recv().await, Ok(None));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tx, rx) = bounded(2);
        assert!(tx.close());
        assert!(!tx.close());
        assert!(!rx.close());
        assert!(!rx.handle().close());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn close_wakes_blocked_receiver() {
        let (tx, mut rx) = bounded(2);
        let consumer = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(SHORT).await;
        tx.close();

        let result = timeout(Duration::from_secs(1), consumer).await;
        assert_eq!(result.ok().and_then(|r| r.ok()), Some(Ok(None)));
    }

    #[tokio::test]
    async fn close_wakes_blocked_sender() {
        let (mut tx, rx) = bounded(1);
        tx.send(Bytes::from_static(b"x")).await.ok();
        let handle = rx.handle();

        let producer = tokio::spawn(async move { tx.send(Bytes::from_static(b"y")).await });
        tokio::time::sleep(SHORT).await;
        handle.close();

        let result = timeout(Duration::from_secs(1), producer).await;
        assert_eq!(
            result.ok().and_then(|r| r.ok()),
            Some(Err(ConduitError::ChannelClosed))
        );
        drop(rx);
    }

    #[tokio::test]
    async fn abort_discards_buffer_and_signals_reason() {
        let (mut tx, mut rx) = bounded(4);
        tx.send(Bytes::from_static(b"lost")).await.ok();
        let handle = tx.handle();

        assert!(handle.abort(AbortReason::Disconnected));
        assert!(!handle.abort(AbortReason::Cancelled));
        assert_eq!(handle.len(), 0);
        assert_eq!(handle.abort_reason(), Some(AbortReason::Disconnected));

        let expected = ConduitError::Aborted {
            reason: AbortReason::Disconnected,
        };
        assert_eq!(rx.recv().await, Err(expected.clone()));
        assert_eq!(tx.send(Bytes::from_static(b"more")).await, Err(expected));
    }

    #[tokio::test]
    async fn cancellation_token_unblocks_receiver() {
        let token = CancellationToken::new();
        let (_tx, mut rx, handle) = build(2, Direction::Inbound, token.clone(), None, false);

        let consumer = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(SHORT).await;
        token.cancel();

        let result = timeout(Duration::from_secs(1), consumer).await;
        assert_eq!(
            result.ok().and_then(|r| r.ok()),
            Some(Err(ConduitError::Aborted {
                reason: AbortReason::Cancelled
            }))
        );
        assert_eq!(handle.abort_reason(), Some(AbortReason::Cancelled));
    }

    #[tokio::test]
    async fn dropping_sender_closes_standalone_channel() {
        let (mut tx, mut rx) = bounded(2);
        tx.send(Bytes::from_static(b"last")).await.ok();
        drop(tx);
        assert!(rx.recv().await.ok().flatten().is_some());
        assert_eq!(rx.recv().await, Ok(None));
    }

    #[tokio::test]
    async fn dropping_receiver_fails_sender() {
        let (mut tx, rx) = bounded(1);
        drop(rx);
        assert_eq!(tx.send(Bytes::from_static(b"x")).await, Err(ConduitError::ChannelClosed));
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn zero_capacity_panics() {
        let _ = bounded(0);
    }
}
