//! Per-connection authentication context

use std::fmt;
use std::sync::Weak;

use parking_lot::{Mutex, MutexGuard};

use super::{AuthState, AuthVariables, OperationSet};
use crate::mtls::Identity;
use crate::token::{UserInfo, UserJson};

/// Host connection that is waiting on an authentication context.
pub trait Connection: Send + Sync {
    /// Re-enter the connection's evaluation. Called once a context settles.
    fn resume(&self);
}

/// Identifier of an authentication context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey(u64);

impl ContextKey {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Progress of one operation within a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot<T> {
    /// The route does not require this operation
    NotRequested,
    /// Dispatched, no answer yet
    Pending,
    /// Answered
    Done(T),
    /// Answered with an error
    Failed,
}

impl<T> Slot<T> {
    pub(crate) fn requested(required: bool) -> Self {
        if required { Self::Pending } else { Self::NotRequested }
    }

    pub(crate) const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub(crate) const fn value(&self) -> Option<&T> {
        match self {
            Self::Done(value) => Some(value),
            _ => None,
        }
    }
}

/// A settled operation result
#[derive(Debug, Clone)]
pub(crate) enum OperationResult {
    UserInfo(UserInfo),
    UserJson(UserJson),
}

#[derive(Debug)]
pub(crate) struct ContextInner {
    pub(crate) state: AuthState,
    pub(crate) user_info: Slot<UserInfo>,
    pub(crate) user_json: Slot<UserJson>,
    pub(crate) poll_attempts: u32,
    pub(crate) timer_armed: bool,
    pub(crate) failure: Option<String>,
}

impl ContextInner {
    pub(crate) const fn outstanding(&self) -> bool {
        self.user_info.is_pending() || self.user_json.is_pending()
    }

    pub(crate) fn record(&mut self, result: OperationResult) {
        match result {
            OperationResult::UserInfo(info) => self.user_info = Slot::Done(info),
            OperationResult::UserJson(json) => self.user_json = Slot::Done(json),
        }
    }

    /// Move to a terminal state, remembering why.
    pub(crate) fn finish(&mut self, state: AuthState, reason: Option<String>) {
        self.state = state;
        if reason.is_some() {
            self.failure = reason;
        }
    }
}

/// Authentication state of one host connection.
///
/// Shared between the host, the poll timer and the completion callbacks;
/// the pending registry lock is always taken before the context lock.
pub struct AuthContext {
    key: ContextKey,
    identity: Identity,
    operations: OperationSet,
    connection: Option<Weak<dyn Connection>>,
    inner: Mutex<ContextInner>,
}

impl AuthContext {
    pub(crate) fn new(
        key: ContextKey,
        identity: Identity,
        operations: OperationSet,
        connection: Option<Weak<dyn Connection>>,
    ) -> Self {
        Self {
            key,
            identity,
            operations,
            connection,
            inner: Mutex::new(ContextInner {
                state: AuthState::Uninitialized,
                user_info: Slot::NotRequested,
                user_json: Slot::NotRequested,
                poll_attempts: 0,
                timer_armed: false,
                failure: None,
            }),
        }
    }

    /// A context with no host connection to resume
    #[must_use]
    pub fn detached(key: ContextKey, identity: Identity, operations: OperationSet) -> Self {
        Self::new(key, identity, operations, None)
    }

    /// Context key
    #[must_use]
    pub const fn key(&self) -> ContextKey {
        self.key
    }

    /// Peer identity being authenticated
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Operations this context requires
    #[must_use]
    pub const fn operations(&self) -> OperationSet {
        self.operations
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.inner.lock().state
    }

    /// Poll ticks that found work still outstanding
    #[must_use]
    pub fn poll_attempts(&self) -> u32 {
        self.inner.lock().poll_attempts
    }

    /// Why the context failed or errored, if it did
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        self.inner.lock().failure.clone()
    }

    /// Downstream variables. Only a passed context has any.
    #[must_use]
    pub fn variables(&self) -> Option<AuthVariables> {
        let inner = self.inner.lock();
        if inner.state != AuthState::Passed {
            return None;
        }

        let mut vars = AuthVariables {
            remote_user: self.identity.subject.clone(),
            ..AuthVariables::default()
        };
        if let Some(info) = inner.user_info.value() {
            vars.user_info.clone_from(&info.token);
            vars.user_info_signature.clone_from(&info.signature);
        }
        if let Some(json) = inner.user_json.value() {
            vars.user_info_json.clone_from(&json.json);
            vars.user_info_json_signature.clone_from(&json.signature);
        }
        Some(vars)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock()
    }

    /// Error out a pending context. Returns whether it was pending.
    pub(crate) fn abort(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != AuthState::Pending {
            return false;
        }
        inner.finish(AuthState::Error, Some(reason.to_string()));
        true
    }

    pub(crate) fn resume(&self) {
        if let Some(connection) = self.connection.as_ref().and_then(Weak::upgrade) {
            connection.resume();
        }
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("key", &self.key)
            .field("identity", &self.identity)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}
