//! Process-wide table of active sessions.
//!
//! The registry is the only structure mutated concurrently by many
//! sessions, so every mutation goes through a single mutex. It holds
//! [`SessionHandle`]s (references, not owners) keyed by [`SessionId`].
//!
//! # Invariants
//!
//! - Only `Active` or `Draining` sessions are present. A session that
//!   reaches `Closed` or `Aborted` removes itself in the same call that
//!   performs the transition.
//! - Session identifiers are allocated monotonically and never reused
//!   for the lifetime of the registry.
//!
//! [`SessionRegistry::abort_all`] is used at shutdown so that no channel
//! is left blocking a caller indefinitely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use conduit_types::{AbortReason, ConduitError, Result, SessionId, SessionStatus};

use crate::session::{Session, SessionCore, SessionHandle};

// ---------------------------------------------------------------------------
// RegistryStats
// ---------------------------------------------------------------------------

/// Point-in-time resource accounting snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RegistryStats {
    /// Registered sessions in `Active` state.
    pub active: usize,
    /// Registered sessions in `Draining` state.
    pub draining: usize,
    /// Unread messages buffered across all registered sessions.
    pub buffered_messages: usize,
    /// Sessions registered since the registry was created.
    pub opened: u64,
    /// Sessions that completed normally.
    pub closed: u64,
    /// Sessions that were aborted.
    pub aborted: u64,
    /// Sessions removed by [`SessionRegistry::deregister`] while still live.
    pub deregistered: u64,
}

// ---------------------------------------------------------------------------
// RegistryShared
// ---------------------------------------------------------------------------

struct Counters {
    opened: u64,
    closed: u64,
    aborted: u64,
    deregistered: u64,
}

struct RegistryInner {
    sessions: HashMap<SessionId, SessionHandle>,
    counters: Counters,
    /// Set by `shutdown`; refuses further registrations.
    sealed: bool,
}

pub(crate) struct RegistryShared {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    max_sessions: Option<usize>,
}

impl RegistryShared {
    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called by a session right after it turned `Closed` or `Aborted`.
    pub(crate) fn on_terminal(&self, core: &SessionCore, status: SessionStatus) {
        let id = core.id();
        let mut inner = self.lock();
        let owned = inner
            .sessions
            .get(&id)
            .is_some_and(|handle| std::ptr::eq(Arc::as_ptr(handle.core()), core));
        if !owned {
            return;
        }
        inner.sessions.remove(&id);
        match status {
            SessionStatus::Aborted => inner.counters.aborted += 1,
            _ => inner.counters.closed += 1,
        }
        let remaining = inner.sessions.len();
        drop(inner);
        tracing::debug!(session = %id, %status, remaining, "session deregistered");
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Thread-safe registry of active sessions.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Creates an unbounded registry.
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Creates a registry holding at most `max_sessions` sessions.
    pub fn with_limit(max_sessions: Option<usize>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                inner: Mutex::new(RegistryInner {
                    sessions: HashMap::new(),
                    counters: Counters {
                        opened: 0,
                        closed: 0,
                        aborted: 0,
                        deregistered: 0,
                    },
                    sealed: false,
                }),
                next_id: AtomicU64::new(1),
                max_sessions,
            }),
        }
    }

    /// Allocates a session identifier unique for this registry's lifetime.
    pub fn allocate_id(&self) -> SessionId {
        SessionId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a session for lookup and teardown.
    ///
    /// Once registered, the session deregisters itself when it reaches
    /// a terminal state. Registering a session that is already present
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// - [`ConduitError::ShuttingDown`] after [`SessionRegistry::shutdown`].
    /// - [`ConduitError::AlreadyRegistered`] if the session belongs to
    ///   another registry or a different session holds its identifier.
    /// - [`ConduitError::ResourceExhausted`] if the session limit is reached.
    /// - [`ConduitError::ChannelClosed`] if the session is already terminal.
    pub fn register(&self, session: &Session) -> Result<()> {
        let handle = session.handle();
        let id = handle.id();
        let mut inner = self.shared.lock();

        if inner.sealed {
            return Err(ConduitError::ShuttingDown);
        }

        if let Some(existing) = inner.sessions.get(&id) {
            if existing.same_session(&handle) {
                return Ok(());
            }
            tracing::warn!(session = %id, "session id already in use");
            return Err(ConduitError::AlreadyRegistered { id });
        }

        if let Some(max) = self.shared.max_sessions {
            if inner.sessions.len() >= max {
                tracing::warn!(session = %id, max, "session limit reached");
                return Err(ConduitError::ResourceExhausted {
                    reason: format!("session limit of {max} reached"),
                });
            }
        }

        // Link first so that a concurrent terminal transition after the
        // status check below finds the entry and removes it.
        if !handle.core().link_registry(&self.shared) {
            tracing::warn!(session = %id, "session belongs to another registry");
            return Err(ConduitError::AlreadyRegistered { id });
        }
        if handle.core().status().is_terminal() {
            return Err(ConduitError::ChannelClosed);
        }

        inner.sessions.insert(id, handle.clone());
        inner.counters.opened += 1;
        let active = inner.sessions.len();
        drop(inner);

        tracing::debug!(
            session = %id,
            method = handle.method(),
            kind = %handle.kind(),
            active,
            "session registered"
        );
        Ok(())
    }

    /// Removes a session from the table without changing its state.
    ///
    /// The session stays linked to this registry and may be registered
    /// here again, but no other registry accepts it.
    pub fn deregister(&self, id: SessionId) -> Option<SessionHandle> {
        let removed = {
            let mut inner = self.shared.lock();
            let removed = inner.sessions.remove(&id);
            if removed.is_some() {
                inner.counters.deregistered += 1;
            }
            removed
        };
        if removed.is_some() {
            tracing::debug!(session = %id, "session deregistered explicitly");
        }
        removed
    }

    /// Looks up an active or draining session.
    pub fn lookup(&self, id: SessionId) -> Result<SessionHandle> {
        self.shared
            .lock()
            .sessions
            .get(&id)
            .cloned()
            .ok_or(ConduitError::SessionNotFound { id })
    }

    /// Returns `true` if `id` is registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.shared.lock().sessions.contains_key(&id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of all registered sessions, in ascending order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.shared.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Aborts every registered session with `reason`.
    ///
    /// Returns the number of sessions aborted by this call. Sessions
    /// abort outside the registry lock; each removes itself as it goes.
    pub fn abort_all(&self, reason: AbortReason) -> usize {
        let handles: Vec<SessionHandle> = self.shared.lock().sessions.values().cloned().collect();
        let aborted = handles
            .iter()
            .filter(|handle| handle.abort(reason.clone()))
            .count();
        tracing::info!(aborted, %reason, "aborted all sessions");
        aborted
    }

    /// Refuses further registrations, then aborts every registered session.
    ///
    /// Sealing and registering serialize on the registry lock, so no
    /// session can slip in after the abort sweep.
    pub fn shutdown(&self, reason: AbortReason) -> usize {
        self.shared.lock().sealed = true;
        self.abort_all(reason)
    }

    /// `true` once [`SessionRegistry::shutdown`] has been called.
    pub fn is_sealed(&self) -> bool {
        self.shared.lock().sealed
    }

    /// Returns a resource accounting snapshot.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.shared.lock();
        let mut stats = RegistryStats {
            opened: inner.counters.opened,
            closed: inner.counters.closed,
            aborted: inner.counters.aborted,
            deregistered: inner.counters.deregistered,
            ..RegistryStats::default()
        };
        let handles: Vec<SessionHandle> = inner.sessions.values().cloned().collect();
        drop(inner);

        for handle in handles {
            match handle.status() {
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Draining => stats.draining += 1,
                _ => {}
            }
            stats.buffered_messages += handle.buffered();
        }
        stats
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("max_sessions", &self.shared.max_sessions)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
