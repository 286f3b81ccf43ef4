//! Bridge between the session manager and tonic-based transports.
//!
//! The core is transport-agnostic; this module holds the pieces a gRPC
//! service implementation needs to put it behind tonic:
//!
//! - [`to_status`] maps a [`ConduitError`] to a `tonic::Status`.
//! - [`metadata_from_tonic`] and [`parse_grpc_timeout`] turn request
//!   headers into a [`Call`].
//! - [`admit_request`] admits a tonic request through a [`CallServer`]
//!   from inside a service method.
//! - [`GrpcInterceptor`] runs an [`InterceptorChain`] as a service-wide
//!   `tonic::service::Interceptor`, writing annotations back into the
//!   request metadata.
//! - [`into_status_stream`] adapts a [`ClientStream`] into the response
//!   stream type of a server-streaming method.

use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};
use tonic::{Request, Status};

use conduit_types::{AbortReason, AuthFailure, Call, CallKind, ConduitError, Metadata};

use crate::interceptor::{InterceptorChain, InterceptorResult};
use crate::server::{CallHandle, CallServer};
use crate::stream::ClientStream;

/// Header carrying the client's timeout.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Maps a [`ConduitError`] to the matching gRPC status.
pub fn to_status(err: &ConduitError) -> Status {
    let message = err.to_string();
    match err {
        ConduitError::Auth(AuthFailure::Unauthenticated { .. }) => Status::unauthenticated(message),
        ConduitError::Auth(AuthFailure::PermissionDenied { .. }) => {
            Status::permission_denied(message)
        }
        ConduitError::ChannelClosed => Status::failed_precondition(message),
        ConduitError::DeadlineExceeded => Status::deadline_exceeded(message),
        ConduitError::HandlerError { .. } => Status::internal(message),
        ConduitError::CapacityExceeded { .. } => Status::internal(message),
        ConduitError::Aborted { reason } => match reason {
            AbortReason::Cancelled | AbortReason::Disconnected => Status::cancelled(message),
            AbortReason::DeadlineExceeded => Status::deadline_exceeded(message),
            AbortReason::HandlerError(_) => Status::internal(message),
            AbortReason::Shutdown => Status::unavailable(message),
        },
        ConduitError::UnknownMethod { .. } => Status::unimplemented(message),
        ConduitError::KindMismatch { .. } => Status::unimplemented(message),
        ConduitError::UnarySession { .. } => Status::internal(message),
        ConduitError::ShuttingDown => Status::unavailable(message),
        ConduitError::AlreadyRegistered { .. } => Status::already_exists(message),
        ConduitError::SessionNotFound { .. } => Status::not_found(message),
        ConduitError::ResourceExhausted { .. } => Status::resource_exhausted(message),
        ConduitError::ConfigError { .. } => Status::failed_precondition(message),
    }
}

// ---------------------------------------------------------------------------
// Request conversion
// ---------------------------------------------------------------------------

/// Copies the ASCII entries of a tonic metadata map.
///
/// Binary (`-bin`) entries and values that are not valid visible ASCII
/// are skipped.
pub fn metadata_from_tonic(map: &MetadataMap) -> Metadata {
    let mut metadata = Metadata::new();
    for entry in map.iter() {
        if let KeyAndValueRef::Ascii(key, value) = entry {
            if let Ok(value) = value.to_str() {
                metadata.insert(key.as_str(), value);
            }
        }
    }
    metadata
}

/// Parses a `grpc-timeout` value: 1 to 8 digits followed by a unit
/// (`H`, `M`, `S`, `m`, `u` or `n`).
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Builds a [`Call`] from tonic request metadata.
///
/// A valid `grpc-timeout` header becomes the call deadline.
pub fn call_from_metadata(kind: CallKind, method: impl Into<String>, map: &MetadataMap) -> Call {
    let metadata = metadata_from_tonic(map);
    let timeout = metadata.get(GRPC_TIMEOUT_HEADER).and_then(parse_grpc_timeout);
    let mut call = Call::new(kind, method).with_metadata(metadata);
    call.deadline = timeout.map(|t| Instant::now() + t);
    call
}

/// Admits a tonic request through `server`.
///
/// Called from a generated service method, where kind and method are
/// known.
pub fn admit_request<T>(
    server: &CallServer,
    kind: CallKind,
    method: &str,
    request: &Request<T>,
) -> Result<CallHandle, Status> {
    let call = call_from_metadata(kind, method, request.metadata());
    server.admit(call).map_err(|e| to_status(&e))
}

// ---------------------------------------------------------------------------
// GrpcInterceptor
// ---------------------------------------------------------------------------

/// Runs an interceptor chain as a `tonic::service::Interceptor`.
///
/// Tonic interceptors see neither the method nor its kind, so the chain
/// evaluates a unary call named after `scope` (usually the service
/// name). Use it for service-wide checks such as token authentication;
/// per-method checks belong in the [`CallServer`] chain.
#[derive(Clone, Debug)]
pub struct GrpcInterceptor {
    chain: InterceptorChain,
    scope: String,
}

impl GrpcInterceptor {
    pub fn new(chain: InterceptorChain, scope: impl Into<String>) -> Self {
        Self {
            chain,
            scope: scope.into(),
        }
    }

    /// Shares the interceptor chain of `server`.
    pub fn from_server(server: &CallServer, scope: impl Into<String>) -> Self {
        Self::new(server.interceptors().clone(), scope)
    }
}

impl tonic::service::Interceptor for GrpcInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let mut call = call_from_metadata(CallKind::Unary, self.scope.as_str(), request.metadata());

        if let InterceptorResult::Deny(failure) = self.chain.evaluate(&mut call) {
            return Err(to_status(&ConduitError::Auth(failure)));
        }

        let target = request.metadata_mut();
        for (key, value) in call.metadata.iter() {
            let current = target.get(key).and_then(|v| v.to_str().ok());
            if current == Some(value) {
                continue;
            }
            let parsed_key = AsciiMetadataKey::from_bytes(key.as_bytes());
            let parsed_value = value.parse::<AsciiMetadataValue>();
            match (parsed_key, parsed_value) {
                (Ok(k), Ok(v)) => {
                    target.insert(k, v);
                }
                _ => tracing::debug!(key, "annotation not representable as gRPC metadata"),
            }
        }
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// Response streams
// ---------------------------------------------------------------------------

/// Adapts a client stream into a gRPC response stream.
///
/// Yields each payload, then ends; a terminal error is yielded once as
/// a `Status`.
pub fn into_status_stream(stream: ClientStream) -> impl Stream<Item = Result<Bytes, Status>> + Send {
    stream.into_stream().map(|item| match item {
        Ok(message) => Ok(message.into_payload()),
        Err(e) => Err(to_status(&e)),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
