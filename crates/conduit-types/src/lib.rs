//! Core shared types for the conduit streaming session manager.
//!
//! This crate defines all fundamental types used across the workspace:
//! calls and their metadata, session identifiers and states, stream
//! messages, and the central [`ConduitError`]. No other crate should
//! define shared types; everything lives here.

pub mod config;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// CallKind
// ---------------------------------------------------------------------------

/// Interaction pattern declared by an RPC call.
///
/// The kind decides which channels a session allocates: `Unary`
/// allocates none, `ServerStream` only outbound, `BidiStream` both.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// One request, one response. No session is created.
    Unary,
    /// One request, a stream of responses.
    ServerStream,
    /// Independent request and response streams.
    BidiStream,
}

impl CallKind {
    /// Returns `true` if this kind allocates an inbound channel.
    pub fn has_inbound(self) -> bool {
        matches!(self, Self::BidiStream)
    }

    /// Returns `true` if this kind allocates an outbound channel.
    pub fn has_outbound(self) -> bool {
        matches!(self, Self::ServerStream | Self::BidiStream)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary => write!(f, "unary"),
            Self::ServerStream => write!(f, "server-stream"),
            Self::BidiStream => write!(f, "bidi-stream"),
        }
    }
}

impl FromStr for CallKind {
    type Err = ConduitError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unary" | "Unary" => Ok(Self::Unary),
            "server-stream" | "ServerStream" => Ok(Self::ServerStream),
            "bidi-stream" | "BidiStream" => Ok(Self::BidiStream),
            other => Err(ConduitError::ConfigError {
                reason: format!("unknown call kind '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Ordered header map attached to a call.
///
/// Keys are case-insensitive: they are normalised to ASCII lowercase
/// on insertion and lookup. Insertion order is preserved; replacing an
/// existing key keeps its original position.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Creates an empty metadata map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `key`, returning the previous value if any.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        let key = key.as_ref().to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Returns the value stored under `key`, ignoring ASCII case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.entries.remove(idx).1)
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterates entries in insertion order. Keys are lowercase.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// One RPC invocation as seen by interceptors and handlers.
///
/// Interceptors receive `&mut Call` and may annotate its metadata.
/// Once dispatch begins the call is shared read-only with the handler.
#[derive(Clone, Debug)]
pub struct Call {
    /// Declared interaction pattern.
    pub kind: CallKind,
    /// Method identifier used for routing (e.g. `"Pay"`).
    pub method: String,
    /// Request headers.
    pub metadata: Metadata,
    /// Absolute deadline, if any.
    pub deadline: Option<Instant>,
}

impl Call {
    /// Creates a call with empty metadata and no deadline.
    pub fn new(kind: CallKind, method: impl Into<String>) -> Self {
        Self {
            kind,
            method: method.into(),
            metadata: Metadata::new(),
            deadline: None,
        }
    }

    /// Replaces the call metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Returns `true` if the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Identifier of a streaming session.
///
/// Allocated monotonically by the session registry, so identifiers
/// are unique for the registry's lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a `SessionId` from its raw value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{:08x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a streaming session.
///
/// ```text
/// Active -> Draining -> Closed
///    \          \
///     +----------+----> Aborted
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Both directions may carry messages.
    Active,
    /// The handler finished writing; remaining messages are being drained.
    Draining,
    /// All allocated channels are closed and drained.
    Closed,
    /// Torn down early; buffered messages were discarded.
    Aborted,
}

impl SessionStatus {
    /// Returns `true` for `Closed` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

// ---------------------------------------------------------------------------
// AbortReason
// ---------------------------------------------------------------------------

/// Why a session was aborted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Explicit cancellation by either side.
    Cancelled,
    /// The client went away.
    Disconnected,
    /// The call deadline elapsed.
    DeadlineExceeded,
    /// The handler failed mid-stream.
    HandlerError(String),
    /// The process is shutting down.
    Shutdown,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Disconnected => write!(f, "client disconnected"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::HandlerError(reason) => write!(f, "handler error: {reason}"),
            Self::Shutdown => write!(f, "server shutting down"),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One unit of payload on a stream.
///
/// `seq` is assigned by the channel on send (monotonic per channel,
/// starting at 0). It is for ordering assertions only and is never
/// transmitted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    /// Per-channel sequence number.
    pub seq: u64,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Creates a message.
    pub fn new(seq: u64, payload: Bytes) -> Self {
        Self { seq, payload }
    }

    /// Consumes the message, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// UTC wall-clock timestamp, used for session bookkeeping.
///
/// Deadlines use the monotonic `tokio::time::Instant` instead; these
/// timestamps are for reporting only.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a `Timestamp` representing the current UTC time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a `Timestamp` from milliseconds since the Unix epoch.
    ///
    /// Out-of-range values clamp to the epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }

    /// Returns milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the inner `DateTime<Utc>`.
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// AuthFailure
// ---------------------------------------------------------------------------

/// Reason an interceptor denied a call.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AuthFailure {
    /// The caller could not be identified (missing or invalid credentials).
    #[error("unauthenticated: {reason}")]
    Unauthenticated {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The caller is known but not allowed to invoke this method.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl AuthFailure {
    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::Unauthenticated {
            reason: reason.into(),
        }
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConduitError
// ---------------------------------------------------------------------------

/// Central error type for the conduit workspace.
///
/// All crates in the workspace convert their internal errors into variants
/// of this enum, ensuring a unified error handling surface.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConduitError {
    /// An interceptor denied the call before dispatch.
    #[error("auth failure: {0}")]
    Auth(#[from] AuthFailure),

    /// Send or receive attempted on a closed channel.
    ///
    /// Signals end of communication, not a defect.
    #[error("channel closed")]
    ChannelClosed,

    /// The call deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Application handler failure.
    #[error("handler error: {reason}")]
    HandlerError {
        /// Human-readable description of the handler failure.
        reason: String,
    },

    /// A channel held more messages than its capacity.
    ///
    /// Sends block under backpressure, so this indicates a bug.
    #[error("channel capacity {capacity} exceeded")]
    CapacityExceeded {
        /// Configured channel capacity.
        capacity: usize,
    },

    /// The session was aborted while the caller was using it.
    #[error("session aborted: {reason}")]
    Aborted {
        /// Why the session was torn down.
        reason: AbortReason,
    },

    /// No handler is registered under the method identifier.
    #[error("unknown method '{method}'")]
    UnknownMethod {
        /// Requested method identifier.
        method: String,
    },

    /// The call kind does not match the kind the method was registered with.
    #[error("method '{method}' is {declared}, called as {requested}")]
    KindMismatch {
        /// Method identifier.
        method: String,
        /// Kind declared at registration.
        declared: CallKind,
        /// Kind the caller requested.
        requested: CallKind,
    },

    /// A unary call was asked to open a session. Unary calls run in the
    /// caller's task and never own channels.
    #[error("unary call '{method}' does not open a session")]
    UnarySession {
        /// Method identifier.
        method: String,
    },

    /// The server no longer accepts calls.
    #[error("server is shutting down")]
    ShuttingDown,

    /// The session belongs to another registry, or its identifier is
    /// already taken by a different session.
    #[error("session {id} is already registered")]
    AlreadyRegistered {
        /// Identifier of the rejected session.
        id: SessionId,
    },

    /// Lookup of an unknown or already removed session.
    #[error("session {id} not found")]
    SessionNotFound {
        /// Requested session identifier.
        id: SessionId,
    },

    /// A resource limit (e.g. maximum concurrent sessions) was reached.
    #[error("resource exhausted: {reason}")]
    ResourceExhausted {
        /// Human-readable description of the exhausted resource.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },
}

impl ConduitError {
    /// Builds a [`ConduitError::HandlerError`] from any displayable reason.
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::HandlerError {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is the cancellation signal of an
    /// aborted session rather than a failure of its own.
    pub fn is_abort_signal(&self) -> bool {
        matches!(
            self,
            Self::Aborted { .. } | Self::DeadlineExceeded | Self::HandlerError { .. }
        )
    }
}

impl From<AbortReason> for ConduitError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::DeadlineExceeded => Self::DeadlineExceeded,
            AbortReason::HandlerError(reason) => Self::HandlerError { reason },
            other => Self::Aborted { reason: other },
        }
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`ConduitError`].
pub type Result<T> = std::result::Result<T, ConduitError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn metadata_keys_are_case_insensitive() {
        let mut md = Metadata::new();
        md.insert("Authorization", "Bearer abc");
        assert_eq!(md.get("authorization"), Some("Bearer abc"));
        assert_eq!(md.get("AUTHORIZATION"), Some("Bearer abc"));
        assert!(md.contains_key("AuThOrIzAtIoN"));
    }

    #[test]
    fn metadata_replace_keeps_position() {
        let mut md: Metadata = [("a", "1"), ("b", "2"), ("c", "3")].into_iter().collect();
        let previous = md.insert("B", "20");
        assert_eq!(previous.as_deref(), Some("2"));

        let entries: Vec<_> = md.iter().collect();
        assert_eq!(entries, vec![("a", "1"), ("b", "20"), ("c", "3")]);
    }

    #[test]
    fn metadata_remove() {
        let mut md: Metadata = [("x-one", "1")].into_iter().collect();
        assert_eq!(md.remove("X-ONE").as_deref(), Some("1"));
        assert!(md.is_empty());
        assert_eq!(md.remove("x-one"), None);
    }

    #[test]
    fn call_kind_channel_allocation() {
        assert!(!CallKind::Unary.has_inbound());
        assert!(!CallKind::Unary.has_outbound());
        assert!(!CallKind::ServerStream.has_inbound());
        assert!(CallKind::ServerStream.has_outbound());
        assert!(CallKind::BidiStream.has_inbound());
        assert!(CallKind::BidiStream.has_outbound());
    }

    #[test]
    fn call_kind_parse() -> std::result::Result<(), Box<dyn std::error::Error>> {
        assert_eq!("unary".parse::<CallKind>()?, CallKind::Unary);
        assert_eq!("ServerStream".parse::<CallKind>()?, CallKind::ServerStream);
        assert_eq!("bidi-stream".parse::<CallKind>()?, CallKind::BidiStream);
        assert!("client-stream".parse::<CallKind>().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn call_expiry() {
        let past = Call::new(CallKind::Unary, "Pay").with_deadline(Instant::now());
        assert!(past.is_expired());

        let future = Call::new(CallKind::Unary, "Pay")
            .with_deadline(Instant::now() + Duration::from_secs(60));
        assert!(!future.is_expired());

        assert!(!Call::new(CallKind::Unary, "Pay").is_expired());
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Draining.is_terminal());
        assert!(SessionStatus::Closed.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
    }

    #[test]
    fn abort_reason_maps_to_error() {
        assert_eq!(
            ConduitError::from(AbortReason::DeadlineExceeded),
            ConduitError::DeadlineExceeded
        );
        assert_eq!(
            ConduitError::from(AbortReason::HandlerError("boom".into())),
            ConduitError::handler("boom")
        );
        assert_eq!(
            ConduitError::from(AbortReason::Disconnected),
            ConduitError::Aborted {
                reason: AbortReason::Disconnected
            }
        );
    }

    #[test]
    fn timestamp_millis_roundtrip() {
        let ts = Timestamp::now();
        let back = Timestamp::from_millis(ts.as_millis());
        assert_eq!(ts.as_millis(), back.as_millis());
        assert!(back.to_string().contains('T'), "ISO 8601 must contain 'T' separator");
    }

    #[test]
    fn session_id_display() {
        assert_eq!(SessionId::new(0x2a).to_string(), "sess-0000002a");
    }

    #[test]
    fn error_display() {
        let err = ConduitError::from(AuthFailure::unauthenticated("missing token"));
        assert!(err.to_string().contains("missing token"));

        let err = ConduitError::KindMismatch {
            method: "Chat".into(),
            declared: CallKind::BidiStream,
            requested: CallKind::Unary,
        };
        assert_eq!(err.to_string(), "method 'Chat' is bidi-stream, called as unary");
    }
}
