//! Interceptor chain applied to every call before dispatch.
//!
//! An [`Interceptor`] inspects a [`Call`] and either allows it, possibly
//! annotating its metadata, or denies it with an [`AuthFailure`]. The
//! [`InterceptorChain`] runs interceptors in registration order and stops
//! at the first denial. Annotations written by an interceptor are
//! visible to every later interceptor and to the handler.
//!
//! Evaluation is synchronous and completes before any session is opened,
//! so a denied call never allocates channels.
//!
//! # Provided interceptors
//!
//! - [`TokenAuthInterceptor`]: resolves a bearer token to an identity
//!   using **constant-time comparison** and records it under
//!   [`IDENTITY_HEADER`].
//! - [`MethodAclInterceptor`]: checks the resolved identity against a
//!   per-method grant table.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use conduit_types::{AuthFailure, Call, ConduitError, Result};

/// Metadata key carrying the bearer token.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Metadata key under which the resolved caller identity is recorded.
pub const IDENTITY_HEADER: &str = "x-conduit-identity";

/// Identity assigned to every call by a local-mode token interceptor.
pub const LOCAL_IDENTITY: &str = "local";

/// Grant that matches every method.
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// InterceptorResult
// ---------------------------------------------------------------------------

/// Outcome of evaluating one interceptor or a whole chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterceptorResult {
    /// The call may proceed. Any annotations were applied in place.
    Allow,
    /// The call is rejected.
    Deny(AuthFailure),
}

impl InterceptorResult {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Converts a denial into [`ConduitError::Auth`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(failure) => Err(ConduitError::Auth(failure)),
        }
    }
}

// ---------------------------------------------------------------------------
// Interceptor
// ---------------------------------------------------------------------------

/// A request inspector run before dispatch.
pub trait Interceptor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Inspects `call`, optionally annotating its metadata.
    fn evaluate(&self, call: &mut Call) -> InterceptorResult;
}

/// Interceptor built from a closure. See [`from_fn`].
pub struct FnInterceptor<F> {
    name: String,
    f: F,
}

/// Wraps a closure as a named [`Interceptor`].
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnInterceptor<F>
where
    F: Fn(&mut Call) -> InterceptorResult + Send + Sync,
{
    FnInterceptor {
        name: name.into(),
        f,
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(&mut Call) -> InterceptorResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, call: &mut Call) -> InterceptorResult {
        (self.f)(call)
    }
}

// ---------------------------------------------------------------------------
// InterceptorChain
// ---------------------------------------------------------------------------

/// Ordered list of interceptors.
///
/// Cloning is cheap; clones share the interceptor instances.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor; it runs after all previously added ones.
    pub fn push(&mut self, interceptor: impl Interceptor + 'static) {
        self.interceptors.push(Arc::new(interceptor));
    }

    /// Builder-style [`InterceptorChain::push`].
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Interceptor names in evaluation order.
    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Runs every interceptor in order; the first denial short-circuits.
    pub fn evaluate(&self, call: &mut Call) -> InterceptorResult {
        for interceptor in &self.interceptors {
            if let InterceptorResult::Deny(failure) = interceptor.evaluate(call) {
                tracing::warn!(
                    interceptor = interceptor.name(),
                    method = %call.method,
                    kind = %call.kind,
                    %failure,
                    "call denied"
                );
                return InterceptorResult::Deny(failure);
            }
        }
        InterceptorResult::Allow
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ---------------------------------------------------------------------------
// TokenAuthInterceptor
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AuthMode {
    /// Every call is allowed as [`LOCAL_IDENTITY`].
    Local,
    /// A known token is required.
    Remote,
}

#[derive(Clone)]
struct TokenEntry {
    /// Raw bytes, compared in constant time.
    token: Vec<u8>,
    identity: String,
}

/// Resolves a bearer token to a caller identity.
///
/// In remote mode the token is read from [`AUTHORIZATION_HEADER`] (or
/// the header set with [`TokenAuthInterceptor::header`]). An optional,
/// case-insensitive `Bearer ` prefix is stripped. The token is compared
/// against every configured entry so the time taken does not reveal
/// which entry matched. On success the identity overwrites any
/// client-supplied [`IDENTITY_HEADER`].
#[derive(Clone)]
pub struct TokenAuthInterceptor {
    mode: AuthMode,
    header: String,
    tokens: Arc<Vec<TokenEntry>>,
}

impl TokenAuthInterceptor {
    /// Local mode: no token required, every call runs as `local`.
    pub fn local() -> Self {
        Self {
            mode: AuthMode::Local,
            header: AUTHORIZATION_HEADER.to_string(),
            tokens: Arc::new(Vec::new()),
        }
    }

    /// Remote mode with an empty token table. Add tokens with
    /// [`TokenAuthInterceptor::with_token`].
    pub fn remote() -> Self {
        Self {
            mode: AuthMode::Remote,
            ..Self::local()
        }
    }

    /// Reads the token from `header` instead of `authorization`.
    pub fn header(mut self, header: impl Into<String>) -> Self {
        self.header = header.into().to_ascii_lowercase();
        self
    }

    /// Accepts `token` and resolves it to `identity`.
    pub fn with_token(mut self, token: &str, identity: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.tokens).push(TokenEntry {
            token: token.as_bytes().to_vec(),
            identity: identity.into(),
        });
        self
    }

    fn resolve(&self, provided: &[u8]) -> Option<&str> {
        let mut matched = None;
        for entry in self.tokens.iter() {
            if constant_time_eq(provided, &entry.token) && matched.is_none() {
                matched = Some(entry.identity.as_str());
            }
        }
        matched
    }
}

impl Interceptor for TokenAuthInterceptor {
    fn name(&self) -> &str {
        "token-auth"
    }

    fn evaluate(&self, call: &mut Call) -> InterceptorResult {
        if self.mode == AuthMode::Local {
            call.metadata.insert(IDENTITY_HEADER, LOCAL_IDENTITY);
            return InterceptorResult::Allow;
        }

        let Some(value) = call.metadata.get(&self.header) else {
            return InterceptorResult::Deny(AuthFailure::unauthenticated(format!(
                "missing {} header",
                self.header
            )));
        };

        let provided = value.as_bytes();
        let token = if provided.len() > 7 && provided[..7].eq_ignore_ascii_case(b"Bearer ") {
            &provided[7..]
        } else {
            provided
        };

        match self.resolve(token) {
            Some(identity) => {
                let identity = identity.to_string();
                tracing::debug!(method = %call.method, identity = %identity, "token accepted");
                call.metadata.insert(IDENTITY_HEADER, identity);
                InterceptorResult::Allow
            }
            None => InterceptorResult::Deny(AuthFailure::unauthenticated("invalid token")),
        }
    }
}

impl fmt::Debug for TokenAuthInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthInterceptor")
            .field("mode", &self.mode)
            .field("header", &self.header)
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MethodAclInterceptor
// ---------------------------------------------------------------------------

/// Per-identity method grants.
///
/// Must run after an interceptor that records [`IDENTITY_HEADER`].
#[derive(Clone, Debug, Default)]
pub struct MethodAclInterceptor {
    grants: HashMap<String, HashSet<String>>,
}

impl MethodAclInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `identity` to call `method`. Use [`WILDCARD`] for all methods.
    pub fn grant(mut self, identity: impl Into<String>, method: impl Into<String>) -> Self {
        self.grants
            .entry(identity.into())
            .or_default()
            .insert(method.into());
        self
    }

    /// Allows `identity` to call every method.
    pub fn grant_all(self, identity: impl Into<String>) -> Self {
        self.grant(identity, WILDCARD)
    }

    pub fn is_granted(&self, identity: &str, method: &str) -> bool {
        self.grants
            .get(identity)
            .is_some_and(|methods| methods.contains(WILDCARD) || methods.contains(method))
    }
}

impl Interceptor for MethodAclInterceptor {
    fn name(&self) -> &str {
        "method-acl"
    }

    fn evaluate(&self, call: &mut Call) -> InterceptorResult {
        let Some(identity) = call.metadata.get(IDENTITY_HEADER) else {
            return InterceptorResult::Deny(AuthFailure::unauthenticated(
                "no resolved caller identity",
            ));
        };

        if self.is_granted(identity, &call.method) {
            InterceptorResult::Allow
        } else {
            InterceptorResult::Deny(AuthFailure::permission_denied(format!(
                "'{identity}' may not call '{}'",
                call.method
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Constant-time comparison
// ---------------------------------------------------------------------------

/// Compares two byte slices in constant time.
///
/// Returns `true` if and only if `a` and `b` are equal in both length
/// and content. The time taken depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
