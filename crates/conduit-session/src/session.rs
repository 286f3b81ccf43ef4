//! Stream session: the runtime state of one streaming call.
//!
//! A session couples two independent bounded channels, inbound
//! (client -> handler) and outbound (handler -> client), and tracks the
//! lifecycle of the call:
//!
//! ```text
//! Active --finish outbound--> Draining --all channels drained--> Closed
//!    |                           |
//!    +------- abort -------------+-------------------------------> Aborted
//! ```
//!
//! The call kind decides which channels exist: `ServerStream` allocates
//! only the outbound channel, `BidiStream` both. Unary calls never open
//! a session.
//!
//! # Ownership
//!
//! [`Session::open`] returns the owning [`Session`], which holds the four
//! channel ends until they are handed out with [`Session::into_parts`].
//! The [`SessionRegistry`](crate::registry::SessionRegistry) keeps a
//! [`SessionHandle`] for lookup and forced teardown. Reaching `Closed`
//! or `Aborted` deregisters the session in the same call.
//!
//! # Cancellation
//!
//! Each session carries a [`CancellationToken`]. Both channels select on
//! it at every suspension point, so [`SessionHandle::abort`] unblocks any
//! task waiting on either channel with the abort reason. If the call has
//! a deadline, a watcher task aborts the session with
//! [`AbortReason::DeadlineExceeded`] when it elapses.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use conduit_types::{
    AbortReason, Call, CallKind, ConduitError, Message, Result, SessionId, SessionStatus,
    Timestamp,
};

use crate::channel::{self, ChannelHandle, ChannelObserver, Direction};
use crate::registry::RegistryShared;

// ---------------------------------------------------------------------------
// SessionCore
// ---------------------------------------------------------------------------

struct CoreState {
    status: SessionStatus,
    abort_reason: Option<AbortReason>,
}

pub(crate) struct SessionCore {
    id: SessionId,
    kind: CallKind,
    method: String,
    deadline: Option<Instant>,
    created_at: Timestamp,
    last_activity_ms: AtomicI64,
    state: Mutex<CoreState>,
    inbound: Option<ChannelHandle>,
    outbound: Option<ChannelHandle>,
    /// Aborts the session; every channel wait selects on it.
    cancel: CancellationToken,
    /// Fires on any terminal transition.
    done: CancellationToken,
    registry: OnceLock<Weak<RegistryShared>>,
}

impl SessionCore {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.lock().status
    }

    /// Links the session to `registry` unless it already belongs to
    /// another one. Returns `false` in that case.
    pub(crate) fn link_registry(&self, registry: &Arc<RegistryShared>) -> bool {
        let linked = self.registry.get_or_init(|| Arc::downgrade(registry));
        std::ptr::eq(linked.as_ptr(), Arc::as_ptr(registry))
    }

    pub(crate) fn buffered(&self) -> usize {
        self.channels().map(ChannelHandle::len).sum()
    }

    fn channels(&self) -> impl Iterator<Item = &ChannelHandle> {
        self.inbound.iter().chain(self.outbound.iter())
    }

    fn begin_draining(&self) {
        let mut state = self.lock();
        if state.status == SessionStatus::Active {
            state.status = SessionStatus::Draining;
            tracing::debug!(session = %self.id, "session draining");
        }
    }

    /// Moves a draining session to `Closed` once every channel is drained.
    fn try_complete(&self) {
        {
            let mut state = self.lock();
            if state.status != SessionStatus::Draining {
                return;
            }
            if !self.channels().all(ChannelHandle::is_drained) {
                return;
            }
            state.status = SessionStatus::Closed;
        }
        tracing::debug!(session = %self.id, "session closed");
        self.finish_terminal(SessionStatus::Closed);
    }

    pub(crate) fn abort(&self, reason: AbortReason) -> bool {
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = SessionStatus::Aborted;
            state.abort_reason = Some(reason.clone());
        }

        match &reason {
            AbortReason::HandlerError(_) | AbortReason::DeadlineExceeded => {
                tracing::warn!(session = %self.id, method = %self.method, %reason, "session aborted");
            }
            _ => {
                tracing::info!(session = %self.id, method = %self.method, %reason, "session aborted");
            }
        }

        for channel in self.channels() {
            channel.abort(reason.clone());
        }
        self.cancel.cancel();
        self.finish_terminal(SessionStatus::Aborted);
        true
    }

    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.lock();
            if state.status.is_terminal() {
                return false;
            }
            state.status = SessionStatus::Closed;
        }
        tracing::debug!(session = %self.id, "session closed by owner");

        for channel in self.channels() {
            channel.release();
        }
        self.finish_terminal(SessionStatus::Closed);
        true
    }

    fn finish_terminal(&self, status: SessionStatus) {
        self.done.cancel();
        if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
            registry.on_terminal(self, status);
        }
    }
}

impl ChannelObserver for SessionCore {
    fn on_activity(&self) {
        self.last_activity_ms
            .store(Timestamp::now().as_millis(), Ordering::Relaxed);
    }

    fn on_closed(&self, direction: Direction) {
        if direction == Direction::Outbound {
            self.begin_draining();
        }
        self.try_complete();
    }

    fn on_drained(&self, _direction: Direction) {
        self.try_complete();
    }

    fn on_aborted(&self, reason: AbortReason) {
        self.abort(reason);
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Shared, non-owning reference to a session.
///
/// Cloneable; used by the registry and by anyone who needs to observe
/// or tear down a session without touching its channels.
#[derive(Clone)]
pub struct SessionHandle {
    core: Arc<SessionCore>,
}

impl SessionHandle {
    pub(crate) fn from_core(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    /// `true` if both handles refer to the same session.
    pub(crate) fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub fn id(&self) -> SessionId {
        self.core.id
    }

    pub fn kind(&self) -> CallKind {
        self.core.kind
    }

    pub fn method(&self) -> &str {
        &self.core.method
    }

    pub fn status(&self) -> SessionStatus {
        self.core.status()
    }

    /// Reason of the abort, once the session is `Aborted`.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.core.lock().abort_reason.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.core.deadline
    }

    pub fn created_at(&self) -> Timestamp {
        self.core.created_at
    }

    /// Time of the last send or receive on either channel.
    pub fn last_activity(&self) -> Timestamp {
        Timestamp::from_millis(self.core.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Number of buffered, unread messages across both channels.
    pub fn buffered(&self) -> usize {
        self.core.buffered()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Aborts the session from any non-terminal state.
    ///
    /// Both channels close immediately, buffered messages are discarded
    /// and every suspended task is woken with `reason`. Idempotent:
    /// returns `false` if the session was already terminal.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.core.abort(reason)
    }

    /// Completes the session immediately.
    ///
    /// Channels are closed and their buffers released; readers observe
    /// end-of-stream. Idempotent: returns `false` if already terminal.
    pub fn close(&self) -> bool {
        self.core.close()
    }

    /// Closes the outbound channel (`Active -> Draining`).
    ///
    /// Used by whoever drives the handler once it returns, since the
    /// writer itself may already be gone. Returns `false` if already
    /// closed or the kind has no outbound channel.
    pub fn finish_outbound(&self) -> bool {
        self.core
            .outbound
            .as_ref()
            .is_some_and(ChannelHandle::close)
    }

    /// Closes the inbound channel. Unread messages stay readable.
    pub fn finish_inbound(&self) -> bool {
        self.core.inbound.as_ref().is_some_and(ChannelHandle::close)
    }

    /// Closes the inbound channel and discards unread client messages.
    pub fn release_inbound(&self) {
        if let Some(inbound) = &self.core.inbound {
            inbound.release();
        }
    }

    /// Token cancelled when the session is aborted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.cancel.clone()
    }

    /// Resolves once the session is aborted.
    pub async fn cancelled(&self) {
        self.core.cancel.cancelled().await
    }

    /// Resolves once the session reaches `Closed` or `Aborted`.
    pub async fn finished(&self) {
        self.core.done.cancelled().await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("method", &self.core.method)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Channel ends
// ---------------------------------------------------------------------------

/// Handler end of the inbound channel: reads client messages.
#[derive(Debug)]
pub struct InboundReader {
    rx: channel::Receiver,
}

impl InboundReader {
    /// Next client message, `Ok(None)` once the client finished sending.
    pub async fn message(&mut self) -> Result<Option<Message>> {
        self.rx.recv().await
    }
}

/// Handler end of the outbound channel: writes messages to the client.
#[derive(Debug)]
pub struct OutboundWriter {
    tx: channel::Sender,
}

impl OutboundWriter {
    /// Sends a message, suspending while the outbound channel is full.
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<u64> {
        self.tx.send(payload).await
    }

    /// Signals that the handler has no more messages (`Active -> Draining`).
    pub fn finish(&self) -> bool {
        self.tx.close()
    }
}

/// Client end of the inbound channel: sends messages to the handler.
#[derive(Debug)]
pub struct InboundWriter {
    tx: channel::Sender,
}

impl InboundWriter {
    /// Sends a message, suspending while the inbound channel is full.
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<u64> {
        self.tx.send(payload).await
    }

    /// Signals that the client has no more messages.
    pub fn finish(&self) -> bool {
        self.tx.close()
    }
}

/// Client end of the outbound channel: reads handler messages.
#[derive(Debug)]
pub struct OutboundReader {
    rx: channel::Receiver,
}

impl OutboundReader {
    /// Next handler message, `Ok(None)` once the stream completed.
    pub async fn message(&mut self) -> Result<Option<Message>> {
        self.rx.recv().await
    }
}

/// A session split into its handle and its four channel ends.
///
/// Ends that the call kind does not allocate are `None`.
#[derive(Debug)]
pub struct SessionParts {
    pub handle: SessionHandle,
    pub inbound_reader: Option<InboundReader>,
    pub outbound_writer: Option<OutboundWriter>,
    pub inbound_writer: Option<InboundWriter>,
    pub outbound_reader: Option<OutboundReader>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Owning view of a streaming session.
///
/// Holds the channel ends for single-task use; split them across tasks
/// with [`Session::into_parts`].
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    inbound_reader: Option<InboundReader>,
    outbound_writer: Option<OutboundWriter>,
    inbound_writer: Option<InboundWriter>,
    outbound_reader: Option<OutboundReader>,
}

impl Session {
    /// Opens a session for `call`, allocating the channels its kind needs.
    ///
    /// If the call has a deadline and a tokio runtime is available, a
    /// watcher task aborts the session when the deadline elapses.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::UnarySession`] for unary calls, which never
    ///   open a session.
    /// - [`ConduitError::ConfigError`] for a zero capacity.
    pub fn open(id: SessionId, call: &Call, capacity: usize) -> Result<Self> {
        if call.kind == CallKind::Unary {
            return Err(ConduitError::UnarySession {
                method: call.method.clone(),
            });
        }
        if capacity == 0 {
            return Err(ConduitError::ConfigError {
                reason: "channel capacity must be greater than 0".into(),
            });
        }

        let cancel = CancellationToken::new();
        let mut inbound_ends = None;
        let mut outbound_ends = None;

        let core = Arc::new_cyclic(|weak: &Weak<SessionCore>| {
            let observer: Weak<dyn ChannelObserver> = weak.clone();

            let inbound = call.kind.has_inbound().then(|| {
                let (tx, rx, handle) = channel::session_channel(
                    capacity,
                    Direction::Inbound,
                    cancel.clone(),
                    observer.clone(),
                );
                inbound_ends = Some((tx, rx));
                handle
            });
            let outbound = call.kind.has_outbound().then(|| {
                let (tx, rx, handle) = channel::session_channel(
                    capacity,
                    Direction::Outbound,
                    cancel.clone(),
                    observer.clone(),
                );
                outbound_ends = Some((tx, rx));
                handle
            });

            let created_at = Timestamp::now();
            SessionCore {
                id,
                kind: call.kind,
                method: call.method.clone(),
                deadline: call.deadline,
                created_at,
                last_activity_ms: AtomicI64::new(created_at.as_millis()),
                state: Mutex::new(CoreState {
                    status: SessionStatus::Active,
                    abort_reason: None,
                }),
                inbound,
                outbound,
                cancel: cancel.clone(),
                done: CancellationToken::new(),
                registry: OnceLock::new(),
            }
        });

        tracing::debug!(
            session = %id,
            method = %call.method,
            kind = %call.kind,
            capacity,
            "session opened"
        );

        if let Some(deadline) = call.deadline {
            spawn_deadline_watch(&core, deadline);
        }

        let (inbound_writer, inbound_reader) = match inbound_ends {
            Some((tx, rx)) => (Some(InboundWriter { tx }), Some(InboundReader { rx })),
            None => (None, None),
        };
        let (outbound_writer, outbound_reader) = match outbound_ends {
            Some((tx, rx)) => (Some(OutboundWriter { tx }), Some(OutboundReader { rx })),
            None => (None, None),
        };

        Ok(Self {
            handle: SessionHandle::from_core(core),
            inbound_reader,
            outbound_writer,
            inbound_writer,
            outbound_reader,
        })
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    pub fn status(&self) -> SessionStatus {
        self.handle.status()
    }

    /// Returns a shared handle to this session.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Handler side: sends a message to the client.
    ///
    /// Fails with [`ConduitError::ChannelClosed`] if the outbound end was
    /// taken or the channel is closed.
    pub async fn write_outbound(&mut self, payload: impl Into<Bytes>) -> Result<u64> {
        match self.outbound_writer.as_mut() {
            Some(writer) => writer.send(payload).await,
            None => Err(ConduitError::ChannelClosed),
        }
    }

    /// Handler side: reads the next client message.
    pub async fn read_inbound(&mut self) -> Result<Option<Message>> {
        match self.inbound_reader.as_mut() {
            Some(reader) => reader.message().await,
            None => Err(ConduitError::ChannelClosed),
        }
    }

    /// Client side: sends a message to the handler.
    pub async fn write_inbound(&mut self, payload: impl Into<Bytes>) -> Result<u64> {
        match self.inbound_writer.as_mut() {
            Some(writer) => writer.send(payload).await,
            None => Err(ConduitError::ChannelClosed),
        }
    }

    /// Client side: reads the next handler message.
    pub async fn read_outbound(&mut self) -> Result<Option<Message>> {
        match self.outbound_reader.as_mut() {
            Some(reader) => reader.message().await,
            None => Err(ConduitError::ChannelClosed),
        }
    }

    /// Handler side: no more outbound messages (`Active -> Draining`).
    pub fn finish_outbound(&self) -> bool {
        self.handle.finish_outbound()
    }

    /// Client side: no more inbound messages.
    pub fn finish_inbound(&self) -> bool {
        self.handle.finish_inbound()
    }

    /// See [`SessionHandle::abort`].
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.handle.abort(reason)
    }

    /// See [`SessionHandle::close`].
    pub fn close(&self) -> bool {
        self.handle.close()
    }

    /// Splits the session into its handle and channel ends.
    pub fn into_parts(self) -> SessionParts {
        SessionParts {
            handle: self.handle,
            inbound_reader: self.inbound_reader,
            outbound_writer: self.outbound_writer,
            inbound_writer: self.inbound_writer,
            outbound_reader: self.outbound_reader,
        }
    }
}

// ---------------------------------------------------------------------------
// Deadline watcher
// ---------------------------------------------------------------------------

/// Spawns a task that aborts the session once `deadline` passes.
///
/// The task holds only a weak reference and exits as soon as the
/// session reaches a terminal state.
fn spawn_deadline_watch(core: &Arc<SessionCore>, deadline: Instant) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(session = %core.id, "no tokio runtime; deadline will not be enforced");
        return;
    };

    let weak = Arc::downgrade(core);
    let done = core.done.clone();
    runtime.spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if let Some(core) = weak.upgrade() {
                    core.abort(AbortReason::DeadlineExceeded);
                }
            }
            _ = done.cancelled() => {}
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn server_stream() -> Call {
        Call::new(CallKind::ServerStream, "History")
    }

    fn bidi() -> Call {
        Call::new(CallKind::BidiStream, "Chat")
    }

    #[test]
    fn unary_never_opens_a_session() {
        let call = Call::new(CallKind::Unary, "Pay");
        let err = Session::open(SessionId::new(1), &call, 32).map(|s| s.id());
        assert_eq!(
            err,
            Err(ConduitError::UnarySession {
                method: "Pay".into()
            })
        );
        assert_eq!(
            err.map_err(|e| e.to_string()),
            Err("unary call 'Pay' does not open a session".to_string())
        );
    }

    #[test]
    fn channel_allocation_follows_kind() -> Result<()> {
        let parts = Session::open(SessionId::new(1), &server_stream(), 4)?.into_parts();
        assert!(parts.inbound_reader.is_none());
        assert!(parts.inbound_writer.is_none());
        assert!(parts.outbound_reader.is_some());
        assert!(parts.outbound_writer.is_some());

        let parts = Session::open(SessionId::new(2), &bidi(), 4)?.into_parts();
        assert!(parts.inbound_reader.is_some());
        assert!(parts.inbound_writer.is_some());
        assert!(parts.outbound_reader.is_some());
        assert!(parts.outbound_writer.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn server_stream_lifecycle() -> Result<()> {
        let mut session = Session::open(SessionId::new(1), &server_stream(), 4)?;
        assert_eq!(session.status(), SessionStatus::Active);

        session.write_outbound(Bytes::from_static(b"a")).await?;
        assert!(session.finish_outbound());
        assert!(!session.finish_outbound());
        assert_eq!(session.status(), SessionStatus::Draining);

        assert!(session.read_outbound().await?.is_some());
        assert_eq!(session.status(), SessionStatus::Draining);
        assert_eq!(session.read_outbound().await?, None);
        assert_eq!(session.status(), SessionStatus::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn bidi_closes_only_when_both_directions_drain() -> Result<()> {
        let mut session = Session::open(SessionId::new(1), &bidi(), 4)?;

        session.write_inbound(Bytes::from_static(b"hello")).await?;
        session.finish_inbound();
        assert_eq!(session.status(), SessionStatus::Active);

        session.finish_outbound();
        assert_eq!(session.status(), SessionStatus::Draining);
        assert_eq!(session.read_outbound().await?, None);
        assert_eq!(session.status(), SessionStatus::Draining);

        assert!(session.read_inbound().await?.is_some());
        assert_eq!(session.read_inbound().await?, None);
        assert_eq!(session.status(), SessionStatus::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn closed_never_returns_to_active() -> Result<()> {
        let mut session = Session::open(SessionId::new(1), &server_stream(), 2)?;
        session.finish_outbound();
        assert_eq!(session.read_outbound().await?, None);
        assert_eq!(session.status(), SessionStatus::Closed);

        assert_eq!(
            session.write_outbound(Bytes::from_static(b"late")).await,
            Err(ConduitError::ChannelClosed)
        );
        assert!(!session.abort(AbortReason::Cancelled));
        assert_eq!(session.status(), SessionStatus::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn abort_discards_and_is_idempotent() -> Result<()> {
        let mut session = Session::open(SessionId::new(1), &bidi(), 4)?;
        session.write_outbound(Bytes::from_static(b"1")).await?;
        session.write_outbound(Bytes::from_static(b"2")).await?;
        let handle = session.handle();
        assert_eq!(handle.buffered(), 2);

        assert!(session.abort(AbortReason::Disconnected));
        assert!(!session.abort(AbortReason::Cancelled));
        assert_eq!(handle.status(), SessionStatus::Aborted);
        assert_eq!(handle.abort_reason(), Some(AbortReason::Disconnected));
        assert_eq!(handle.buffered(), 0);

        let aborted = Err(ConduitError::Aborted {
            reason: AbortReason::Disconnected,
        });
        assert_eq!(session.read_outbound().await, aborted);
        assert_eq!(session.read_inbound().await, aborted);
        Ok(())
    }

    #[tokio::test]
    async fn abort_unblocks_suspended_writer() -> Result<()> {
        let session = Session::open(SessionId::new(1), &server_stream(), 1)?;
        let handle = session.handle();
        let mut parts = session.into_parts();
        let mut writer = parts.outbound_writer.take().expect("outbound writer");

        let producer = tokio::spawn(async move {
            writer.send(Bytes::from_static(b"fills")).await?;
            writer.send(Bytes::from_static(b"blocks")).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        handle.abort(AbortReason::Cancelled);
        let result = timeout(Duration::from_secs(1), producer).await;
        assert_eq!(
            result.ok().and_then(|r| r.ok()),
            Some(Err(ConduitError::Aborted {
                reason: AbortReason::Cancelled
            }))
        );
        Ok(())
    }

    #[tokio::test]
    async fn deadline_aborts_idle_session() -> Result<()> {
        let call = server_stream().with_deadline(Instant::now() + Duration::from_millis(50));
        let session = Session::open(SessionId::new(1), &call, 4)?;
        let handle = session.handle();

        timeout(Duration::from_secs(1), handle.finished())
            .await
            .map_err(|_| ConduitError::handler("deadline watcher did not fire"))?;
        assert_eq!(handle.status(), SessionStatus::Aborted);
        assert_eq!(handle.abort_reason(), Some(AbortReason::DeadlineExceeded));
        drop(session);
        Ok(())
    }

    #[tokio::test]
    async fn explicit_close_releases_buffers() -> Result<()> {
        let mut session = Session::open(SessionId::new(1), &server_stream(), 4)?;
        session.write_outbound(Bytes::from_static(b"unread")).await?;
        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(session.handle().buffered(), 0);
        assert_eq!(session.read_outbound().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn activity_updates_timestamp() -> Result<()> {
        let mut session = Session::open(SessionId::new(1), &server_stream(), 4)?;
        let handle = session.handle();
        let before = handle.last_activity();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.write_outbound(Bytes::from_static(b"x")).await?;
        assert!(handle.last_activity() >= before);
        assert!(handle.created_at() <= handle.last_activity());
        Ok(())
    }
}
