//! Call dispatcher: routes an allowed call to its handler.
//!
//! Handlers are registered per method together with their declared
//! [`CallKind`] in a [`MethodTable`]. Dispatch then depends on the kind:
//!
//! - **Unary**: the handler runs in the caller's task with the single
//!   request and its response is returned directly. No session exists.
//! - **ServerStream**: a session with only an outbound channel is opened
//!   and registered; the handler runs in its own task and writes zero or
//!   more messages. The caller gets a [`ClientStream`] reading them.
//! - **BidiStream**: a full session is opened; the handler task gets both
//!   handler ends, the caller gets the client ends.
//!
//! # Handler completion
//!
//! When a streaming handler returns `Ok`, the dispatcher releases any
//! unread inbound messages and finishes the outbound channel, moving the
//! session to `Draining`. When it returns `Err` or panics, the session
//! is aborted with [`AbortReason::HandlerError`]: buffered outbound
//! messages are discarded and the client sees the error once.
//!
//! If the session is aborted while the handler is still running (client
//! disconnect, deadline, shutdown), the handler future is dropped at its
//! next suspension point.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::runtime::Handle;

use conduit_session::{
    InboundReader, OutboundWriter, Session, SessionHandle, SessionParts, SessionRegistry,
};
use conduit_types::{AbortReason, Call, CallKind, ConduitError, Result};

use crate::stream::ClientStream;

/// Abort reason recorded when a handler panics.
pub const PANIC_REASON: &str = "handler panicked";

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// Handler for unary calls: one request, one response.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn handle(&self, call: Arc<Call>, request: Bytes) -> Result<Bytes>;
}

/// Handler for server-streaming calls.
///
/// Writes zero or more messages to `outbound`; returning `Ok` finishes
/// the stream.
#[async_trait]
pub trait ServerStreamHandler: Send + Sync {
    async fn handle(&self, call: Arc<Call>, request: Bytes, outbound: OutboundWriter)
        -> Result<()>;
}

/// Handler for bidirectional calls.
///
/// Reads and writes independently; returning `Ok` finishes the stream.
#[async_trait]
pub trait BidiHandler: Send + Sync {
    async fn handle(
        &self,
        call: Arc<Call>,
        inbound: InboundReader,
        outbound: OutboundWriter,
    ) -> Result<()>;
}

/// Unary handler built from a closure. See [`unary_fn`].
pub struct UnaryFn<F>(F);

/// Server-streaming handler built from a closure. See [`server_stream_fn`].
pub struct ServerStreamFn<F>(F);

/// Bidirectional handler built from a closure. See [`bidi_fn`].
pub struct BidiFn<F>(F);

pub fn unary_fn<F, Fut>(f: F) -> UnaryFn<F>
where
    F: Fn(Arc<Call>, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes>> + Send,
{
    UnaryFn(f)
}

pub fn server_stream_fn<F, Fut>(f: F) -> ServerStreamFn<F>
where
    F: Fn(Arc<Call>, Bytes, OutboundWriter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    ServerStreamFn(f)
}

pub fn bidi_fn<F, Fut>(f: F) -> BidiFn<F>
where
    F: Fn(Arc<Call>, InboundReader, OutboundWriter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    BidiFn(f)
}

#[async_trait]
impl<F, Fut> UnaryHandler for UnaryFn<F>
where
    F: Fn(Arc<Call>, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Bytes>> + Send,
{
    async fn handle(&self, call: Arc<Call>, request: Bytes) -> Result<Bytes> {
        (self.0)(call, request).await
    }
}

#[async_trait]
impl<F, Fut> ServerStreamHandler for ServerStreamFn<F>
where
    F: Fn(Arc<Call>, Bytes, OutboundWriter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(
        &self,
        call: Arc<Call>,
        request: Bytes,
        outbound: OutboundWriter,
    ) -> Result<()> {
        (self.0)(call, request, outbound).await
    }
}

#[async_trait]
impl<F, Fut> BidiHandler for BidiFn<F>
where
    F: Fn(Arc<Call>, InboundReader, OutboundWriter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(
        &self,
        call: Arc<Call>,
        inbound: InboundReader,
        outbound: OutboundWriter,
    ) -> Result<()> {
        (self.0)(call, inbound, outbound).await
    }
}

// ---------------------------------------------------------------------------
// MethodTable
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum MethodHandler {
    Unary(Arc<dyn UnaryHandler>),
    ServerStream(Arc<dyn ServerStreamHandler>),
    Bidi(Arc<dyn BidiHandler>),
}

impl MethodHandler {
    fn kind(&self) -> CallKind {
        match self {
            Self::Unary(_) => CallKind::Unary,
            Self::ServerStream(_) => CallKind::ServerStream,
            Self::Bidi(_) => CallKind::BidiStream,
        }
    }
}

/// Handlers keyed by method identifier, each with its declared kind.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodHandler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unary(&mut self, method: impl Into<String>, handler: impl UnaryHandler + 'static) {
        self.insert(method.into(), MethodHandler::Unary(Arc::new(handler)));
    }

    pub fn add_server_stream(
        &mut self,
        method: impl Into<String>,
        handler: impl ServerStreamHandler + 'static,
    ) {
        self.insert(method.into(), MethodHandler::ServerStream(Arc::new(handler)));
    }

    pub fn add_bidi(&mut self, method: impl Into<String>, handler: impl BidiHandler + 'static) {
        self.insert(method.into(), MethodHandler::Bidi(Arc::new(handler)));
    }

    fn insert(&mut self, method: String, handler: MethodHandler) {
        let kind = handler.kind();
        if let Some(previous) = self.methods.insert(method.clone(), handler) {
            tracing::warn!(
                method = %method,
                previous = %previous.kind(),
                %kind,
                "handler replaced"
            );
        }
    }

    /// Declared kind of `method`, if registered.
    pub fn kind_of(&self, method: &str) -> Option<CallKind> {
        self.methods.get(method).map(MethodHandler::kind)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn resolve(&self, method: &str, requested: CallKind) -> Result<&MethodHandler> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| ConduitError::UnknownMethod {
                method: method.to_string(),
            })?;
        let declared = handler.kind();
        if declared != requested {
            return Err(ConduitError::KindMismatch {
                method: method.to_string(),
                declared,
                requested,
            });
        }
        Ok(handler)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for name in self.methods() {
            if let Some(kind) = self.kind_of(name) {
                map.entry(&name, &kind);
            }
        }
        map.finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Result of dispatching a call.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The response of a unary call.
    Response(Bytes),
    /// The client end of a streaming call.
    Stream(ClientStream),
}

/// Routes calls to handlers and owns the sessions it opens until they
/// are handed to the handler task and the client.
pub struct Dispatcher {
    methods: MethodTable,
    registry: SessionRegistry,
    channel_capacity: usize,
}

impl Dispatcher {
    pub fn new(methods: MethodTable, registry: SessionRegistry, channel_capacity: usize) -> Self {
        Self {
            methods,
            registry,
            channel_capacity,
        }
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Checks that `call` names a registered method of the same kind.
    ///
    /// # Errors
    ///
    /// [`ConduitError::UnknownMethod`] or [`ConduitError::KindMismatch`].
    pub fn check(&self, call: &Call) -> Result<()> {
        self.methods.resolve(&call.method, call.kind).map(|_| ())
    }

    /// Dispatches `call` according to its kind.
    ///
    /// `request` is the single request message of unary and
    /// server-streaming calls (empty if `None`); it is ignored for
    /// bidirectional calls.
    pub async fn handle(&self, call: Call, request: Option<Bytes>) -> Result<DispatchOutcome> {
        let call = Arc::new(call);
        let request = request.unwrap_or_default();
        match call.kind {
            CallKind::Unary => self.unary(call, request).await.map(DispatchOutcome::Response),
            CallKind::ServerStream => self.server_stream(call, request).map(DispatchOutcome::Stream),
            CallKind::BidiStream => self.bidi(call).map(DispatchOutcome::Stream),
        }
    }

    /// Runs a unary handler in the caller's task.
    ///
    /// The call deadline, if any, bounds the handler. Handler errors are
    /// returned unchanged; a panic becomes [`ConduitError::HandlerError`].
    pub async fn unary(&self, call: Arc<Call>, request: Bytes) -> Result<Bytes> {
        let MethodHandler::Unary(handler) = self.methods.resolve(&call.method, CallKind::Unary)?
        else {
            return Err(ConduitError::KindMismatch {
                method: call.method.clone(),
                declared: CallKind::Unary,
                requested: call.kind,
            });
        };

        let work = AssertUnwindSafe(handler.handle(Arc::clone(&call), request)).catch_unwind();
        let outcome = match call.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, work).await.map_err(|_| {
                tracing::warn!(method = %call.method, "unary call deadline exceeded");
                ConduitError::DeadlineExceeded
            })?,
            None => work.await,
        };

        match outcome {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::warn!(method = %call.method, error = %e, "unary handler failed");
                }
                result
            }
            Err(panic) => {
                tracing::error!(
                    method = %call.method,
                    panic = %panic_message(panic.as_ref()),
                    "unary handler panicked"
                );
                Err(ConduitError::handler(PANIC_REASON))
            }
        }
    }

    /// Opens a server-streaming session and starts its handler task.
    ///
    /// # Errors
    ///
    /// Besides method resolution and registry errors, fails with
    /// [`ConduitError::ConfigError`] when called outside a tokio runtime.
    pub fn server_stream(&self, call: Arc<Call>, request: Bytes) -> Result<ClientStream> {
        let MethodHandler::ServerStream(handler) =
            self.methods.resolve(&call.method, CallKind::ServerStream)?
        else {
            return Err(ConduitError::KindMismatch {
                method: call.method.clone(),
                declared: CallKind::ServerStream,
                requested: call.kind,
            });
        };
        let handler = Arc::clone(handler);
        let runtime = current_runtime()?;

        let parts = self.open_session(&call)?;
        let (Some(outbound_writer), Some(outbound_reader)) =
            (parts.outbound_writer, parts.outbound_reader)
        else {
            parts.handle.close();
            return Err(ConduitError::ChannelClosed);
        };

        spawn_handler(&runtime, parts.handle.clone(), async move {
            handler.handle(call, request, outbound_writer).await
        });
        Ok(ClientStream::new(parts.handle, outbound_reader, None))
    }

    /// Opens a bidirectional session and starts its handler task.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::server_stream`].
    pub fn bidi(&self, call: Arc<Call>) -> Result<ClientStream> {
        let MethodHandler::Bidi(handler) =
            self.methods.resolve(&call.method, CallKind::BidiStream)?
        else {
            return Err(ConduitError::KindMismatch {
                method: call.method.clone(),
                declared: CallKind::BidiStream,
                requested: call.kind,
            });
        };
        let handler = Arc::clone(handler);
        let runtime = current_runtime()?;

        let parts = self.open_session(&call)?;
        let (Some(inbound_reader), Some(outbound_writer), Some(inbound_writer), Some(outbound_reader)) = (
            parts.inbound_reader,
            parts.outbound_writer,
            parts.inbound_writer,
            parts.outbound_reader,
        ) else {
            parts.handle.close();
            return Err(ConduitError::ChannelClosed);
        };

        spawn_handler(&runtime, parts.handle.clone(), async move {
            handler.handle(call, inbound_reader, outbound_writer).await
        });
        Ok(ClientStream::new(
            parts.handle,
            outbound_reader,
            Some(inbound_writer),
        ))
    }

    fn open_session(&self, call: &Call) -> Result<SessionParts> {
        let id = self.registry.allocate_id();
        let session = Session::open(id, call, self.channel_capacity)?;
        if let Err(e) = self.registry.register(&session) {
            // Never registered: completing it stops the deadline watcher
            // and frees the channels.
            session.close();
            return Err(e);
        }
        Ok(session.into_parts())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.methods)
            .field("channel_capacity", &self.channel_capacity)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Handler task
// ---------------------------------------------------------------------------

fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|_| ConduitError::ConfigError {
        reason: "streaming calls must be dispatched inside a tokio runtime".into(),
    })
}

/// Runs a streaming handler in its own task and applies its outcome to
/// the session.
fn spawn_handler<F>(runtime: &Handle, handle: SessionHandle, work: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    runtime.spawn(async move {
        let id = handle.id();
        let guarded = AssertUnwindSafe(work).catch_unwind();

        let outcome = tokio::select! {
            outcome = guarded => outcome,
            _ = handle.cancelled() => {
                tracing::debug!(session = %id, "handler stopped by abort");
                return;
            }
        };

        match outcome {
            Ok(Ok(())) => {
                handle.release_inbound();
                handle.finish_outbound();
                tracing::debug!(session = %id, "handler completed");
            }
            Ok(Err(err)) => {
                let reason = match err {
                    ConduitError::HandlerError { reason } => reason,
                    other => other.to_string(),
                };
                if handle.abort(AbortReason::HandlerError(reason.clone())) {
                    tracing::warn!(session = %id, error = %reason, "handler failed");
                }
            }
            Err(panic) => {
                tracing::error!(
                    session = %id,
                    panic = %panic_message(panic.as_ref()),
                    "handler panicked"
                );
                handle.abort(AbortReason::HandlerError(PANIC_REASON.to_string()));
            }
        }
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
