//! Client end of a streaming call.
//!
//! A [`ClientStream`] is what the transport relays to the remote peer:
//! it reads the session's outbound channel and, for bidirectional calls,
//! writes its inbound channel. The handler runs in its own task; the two
//! sides communicate only through the session's channels.
//!
//! Dropping a `ClientStream` before its session reached a terminal state
//! is treated as a client disconnect and aborts the session.

use bytes::Bytes;
use futures::stream::{self, Stream};

use conduit_session::{InboundWriter, OutboundReader, SessionHandle};
use conduit_types::{
    AbortReason, CallKind, ConduitError, Message, Result, SessionId, SessionStatus,
};

/// Client-facing end of a server-streaming or bidirectional session.
#[derive(Debug)]
pub struct ClientStream {
    handle: SessionHandle,
    outbound: OutboundReader,
    inbound: Option<InboundWriter>,
    /// A terminal error was already returned once.
    terminal_reported: bool,
}

impl ClientStream {
    pub(crate) fn new(
        handle: SessionHandle,
        outbound: OutboundReader,
        inbound: Option<InboundWriter>,
    ) -> Self {
        Self {
            handle,
            outbound,
            inbound,
            terminal_reported: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.handle.id()
    }

    pub fn kind(&self) -> CallKind {
        self.handle.kind()
    }

    pub fn status(&self) -> SessionStatus {
        self.handle.status()
    }

    /// Shared handle of the underlying session.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Sends a message to the handler, suspending while the inbound
    /// channel is full.
    ///
    /// Server-streaming calls have no inbound channel and always fail
    /// with [`ConduitError::ChannelClosed`].
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<u64> {
        let result = match self.inbound.as_mut() {
            Some(writer) => writer.send(payload).await,
            None => Err(ConduitError::ChannelClosed),
        };
        result.map_err(|e| self.report(e))
    }

    /// Signals that the client has no more messages.
    pub fn close_send(&self) -> bool {
        self.inbound.as_ref().is_some_and(InboundWriter::finish)
    }

    /// Next message from the handler.
    ///
    /// Returns `Ok(None)` once the handler finished and every message was
    /// delivered. If the session was aborted, the abort is reported once
    /// as an error (`DeadlineExceeded`, `HandlerError` or `Aborted`);
    /// later calls return [`ConduitError::ChannelClosed`].
    pub async fn message(&mut self) -> Result<Option<Message>> {
        let result = self.outbound.message().await;
        result.map_err(|e| self.report(e))
    }

    /// Reads every remaining message until end-of-stream.
    pub async fn collect(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(message) = self.message().await? {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Cancels the call on behalf of the client.
    pub fn cancel(self) {
        self.handle.abort(AbortReason::Cancelled);
    }

    /// Tears the call down as a client disconnect.
    pub fn disconnect(self) {
        self.handle.abort(AbortReason::Disconnected);
    }

    /// Converts the outbound side into a [`Stream`] that ends after
    /// end-of-stream or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut client = state?;
            match client.message().await {
                Ok(Some(message)) => Some((Ok(message), Some(client))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn report(&mut self, err: ConduitError) -> ConduitError {
        if !err.is_abort_signal() {
            return err;
        }
        if self.terminal_reported {
            ConduitError::ChannelClosed
        } else {
            self.terminal_reported = true;
            err
        }
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if !self.handle.is_terminal() && self.handle.abort(AbortReason::Disconnected) {
            tracing::debug!(session = %self.handle.id(), "client stream dropped before completion");
        }
    }
}
