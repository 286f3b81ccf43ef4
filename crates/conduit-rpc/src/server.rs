//! Call server facade: the entry point transports talk to.
//!
//! [`CallServer::submit_call`] admits a call: it applies the default
//! deadline, runs the [`InterceptorChain`] and checks the method table.
//! The returned [`CallHandle`] then dispatches the call with its request.
//! Nothing is allocated for a call that fails admission.
//!
//! # Graceful shutdown
//!
//! [`CallServer::shutdown`] stops admitting calls, seals the session
//! registry and aborts every live session with
//! [`AbortReason::Shutdown`], so no task stays blocked on a channel.
//! Transports watch [`CallServer::shutdown_signal`], a
//! `tokio::sync::watch::Receiver<bool>` that becomes `true` at that
//! point, to stop accepting connections.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

use conduit_session::SessionRegistry;
use conduit_types::config::ServerConfig;
use conduit_types::{AbortReason, Call, CallKind, ConduitError, Metadata, Result};

use crate::dispatcher::{
    BidiHandler, DispatchOutcome, Dispatcher, MethodTable, ServerStreamHandler, UnaryHandler,
};
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::stream::ClientStream;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`CallServer`] from a config, interceptors and handlers.
pub struct CallServerBuilder {
    config: ServerConfig,
    chain: InterceptorChain,
    methods: MethodTable,
}

impl CallServerBuilder {
    /// Appends an interceptor. Interceptors run in the order added.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.chain.push(interceptor);
        self
    }

    pub fn unary(mut self, method: impl Into<String>, handler: impl UnaryHandler + 'static) -> Self {
        self.methods.add_unary(method, handler);
        self
    }

    pub fn server_stream(
        mut self,
        method: impl Into<String>,
        handler: impl ServerStreamHandler + 'static,
    ) -> Self {
        self.methods.add_server_stream(method, handler);
        self
    }

    pub fn bidi(mut self, method: impl Into<String>, handler: impl BidiHandler + 'static) -> Self {
        self.methods.add_bidi(method, handler);
        self
    }

    /// Validates the config and builds the server.
    ///
    /// # Errors
    ///
    /// Returns `ConduitError::ConfigError` if config validation fails.
    pub fn build(self) -> Result<CallServer> {
        self.config.validate()?;

        let registry = SessionRegistry::with_limit(self.config.max_sessions);
        let dispatcher = Dispatcher::new(
            self.methods,
            registry.clone(),
            self.config.channel_capacity,
        );
        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(
            capacity = self.config.channel_capacity,
            default_deadline_ms = self.config.default_deadline.map(|d| d.as_millis() as u64),
            max_sessions = self.config.max_sessions,
            interceptors = self.chain.len(),
            methods = dispatcher.methods().len(),
            "call server ready"
        );

        Ok(CallServer {
            inner: Arc::new(ServerInner {
                config: self.config,
                chain: self.chain,
                dispatcher,
                registry,
                accepting: AtomicBool::new(true),
                shutdown_tx,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// CallServer
// ---------------------------------------------------------------------------

struct ServerInner {
    config: ServerConfig,
    chain: InterceptorChain,
    dispatcher: Dispatcher,
    registry: SessionRegistry,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Admits and dispatches calls. Cheap to clone.
#[derive(Clone)]
pub struct CallServer {
    inner: Arc<ServerInner>,
}

impl CallServer {
    pub fn builder(config: ServerConfig) -> CallServerBuilder {
        CallServerBuilder {
            config,
            chain: InterceptorChain::new(),
            methods: MethodTable::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The session registry backing this server.
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.inner.chain
    }

    /// Declared kind of `method`, if a handler is registered for it.
    pub fn method_kind(&self, method: &str) -> Option<CallKind> {
        self.inner.dispatcher.methods().kind_of(method)
    }

    /// Admits a call described by its parts. See [`CallServer::admit`].
    pub fn submit_call(
        &self,
        kind: CallKind,
        method: impl Into<String>,
        metadata: Metadata,
        deadline: Option<Instant>,
    ) -> Result<CallHandle> {
        let mut call = Call::new(kind, method).with_metadata(metadata);
        call.deadline = deadline;
        self.admit(call)
    }

    /// Admits `call`: default deadline, interceptor chain, method check.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::ShuttingDown`] after [`CallServer::shutdown`].
    /// - [`ConduitError::Auth`] if an interceptor denies the call.
    /// - [`ConduitError::UnknownMethod`] / [`ConduitError::KindMismatch`].
    /// - [`ConduitError::DeadlineExceeded`] if the deadline already passed.
    pub fn admit(&self, mut call: Call) -> Result<CallHandle> {
        if self.is_shutting_down() {
            tracing::debug!(method = %call.method, "call refused: shutting down");
            return Err(ConduitError::ShuttingDown);
        }

        if call.deadline.is_none() {
            if let Some(default) = self.inner.config.default_deadline {
                call.deadline = Some(Instant::now() + default);
            }
        }

        self.inner.chain.evaluate(&mut call).into_result()?;
        self.inner.dispatcher.check(&call)?;

        if call.is_expired() {
            tracing::warn!(method = %call.method, "call arrived past its deadline");
            return Err(ConduitError::DeadlineExceeded);
        }

        tracing::debug!(method = %call.method, kind = %call.kind, "call admitted");
        Ok(CallHandle {
            call,
            server: self.clone(),
        })
    }

    /// Refuses new calls and aborts every live session.
    ///
    /// Idempotent. Returns the number of sessions aborted by this call.
    pub fn shutdown(&self) -> usize {
        let first = self.inner.accepting.swap(false, Ordering::SeqCst);
        let aborted = self.inner.registry.shutdown(AbortReason::Shutdown);
        self.inner.shutdown_tx.send_replace(true);
        if first {
            tracing::info!(aborted, "call server shut down");
        }
        aborted
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Watch receiver that becomes `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Resolves once shutdown begins.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_signal();
        loop {
            if *rx.borrow_and_update() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl fmt::Debug for CallServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallServer")
            .field("config", &self.inner.config)
            .field("interceptors", &self.inner.chain)
            .field("dispatcher", &self.inner.dispatcher)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CallHandle
// ---------------------------------------------------------------------------

/// An admitted call, ready to be dispatched.
///
/// Holds the call as annotated by the interceptor chain. Exactly one of
/// the dispatch methods matching the call kind succeeds.
#[derive(Debug)]
pub struct CallHandle {
    call: Call,
    server: CallServer,
}

impl CallHandle {
    /// The call, including interceptor annotations.
    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn kind(&self) -> CallKind {
        self.call.kind
    }

    /// Runs a unary call and returns its response.
    pub async fn unary(self, request: impl Into<Bytes>) -> Result<Bytes> {
        self.expect_kind(CallKind::Unary)?;
        self.server.inner.dispatcher.unary(Arc::new(self.call), request.into()).await
    }

    /// Starts a server-streaming call.
    pub fn server_stream(self, request: impl Into<Bytes>) -> Result<ClientStream> {
        self.expect_kind(CallKind::ServerStream)?;
        self.server
            .inner
            .dispatcher
            .server_stream(Arc::new(self.call), request.into())
    }

    /// Starts a bidirectional call.
    pub fn bidi(self) -> Result<ClientStream> {
        self.expect_kind(CallKind::BidiStream)?;
        self.server.inner.dispatcher.bidi(Arc::new(self.call))
    }

    /// Dispatches according to the call kind.
    pub async fn dispatch(self, request: Option<Bytes>) -> Result<DispatchOutcome> {
        if self.server.is_shutting_down() {
            return Err(ConduitError::ShuttingDown);
        }
        self.server.inner.dispatcher.handle(self.call, request).await
    }

    fn expect_kind(&self, requested: CallKind) -> Result<()> {
        if self.server.is_shutting_down() {
            return Err(ConduitError::ShuttingDown);
        }
        if self.call.kind != requested {
            return Err(ConduitError::KindMismatch {
                method: self.call.method.clone(),
                declared: self.call.kind,
                requested,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
