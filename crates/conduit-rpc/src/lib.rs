//! Call admission and dispatch for the conduit session manager.
//!
//! A call submitted by a transport passes through three stages:
//!
//! 1. The [`InterceptorChain`] authenticates and authorizes it, possibly
//!    annotating its metadata. A denial is terminal and allocates nothing.
//! 2. The [`Dispatcher`] looks up the handler registered for the method
//!    and checks that the call kind matches the declared one.
//! 3. Unary calls run to completion in the caller's task. Streaming calls
//!    get a session from `conduit-session`; the handler runs in its own
//!    task and the caller receives a [`ClientStream`].
//!
//! [`CallServer`] ties the stages together behind `submit_call` and
//! `shutdown`.
//!
//! # Modules
//!
//! - [`interceptor`]: `Interceptor`, `InterceptorChain`, token and
//!   method-ACL interceptors.
//! - [`dispatcher`]: handler traits, `MethodTable`, `Dispatcher`.
//! - [`stream`]: `ClientStream`, the client end of a streaming call.
//! - [`server`]: `CallServer`, `CallHandle`.
//! - [`grpc`]: status mapping and adapters for tonic transports.

pub mod dispatcher;
pub mod grpc;
pub mod interceptor;
pub mod server;
pub mod stream;

// Re-exports for consumers.
pub use dispatcher::{
    bidi_fn, server_stream_fn, unary_fn, BidiHandler, DispatchOutcome, Dispatcher, MethodTable,
    ServerStreamHandler, UnaryHandler,
};
pub use interceptor::{
    Interceptor, InterceptorChain, InterceptorResult, MethodAclInterceptor, TokenAuthInterceptor,
};
pub use server::{CallHandle, CallServer, CallServerBuilder};
pub use stream::ClientStream;
