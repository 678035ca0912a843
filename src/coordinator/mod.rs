//! Authentication coordinator
//!
//! Drives one [`AuthContext`] per host connection through
//!
//! ```text
//! UNINITIALIZED ──► PENDING ──► PASSED
//!       │              ├──────► FAILED   (an operation was refused)
//!       │              └──────► ERROR    (poll budget exhausted, reset)
//!       ├─────────────────────► PASSED   (every operation answered from cache)
//!       └─────────────────────► ERROR    (dispatch failed, cached credential expired)
//! ```
//!
//! The host calls [`AuthCoordinator::evaluate`], which never blocks. While a
//! context is pending, completions arrive on background tasks and a poll timer
//! re-checks the context; once it settles the host connection is resumed and
//! evaluates again to read the outcome.

mod context;
mod scheduler;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::audit::{self, AuthEvent};
use crate::client::SecurityClient;
use crate::config::AuthConfig;
use crate::mtls::Identity;
use crate::registry::PendingRegistry;
use crate::{Error, Result};

pub use context::{AuthContext, Connection, ContextKey};
pub use scheduler::{Timer, TimerTask, TokioTimer};

use context::{OperationResult, Slot};

/// Authentication state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    /// Not evaluated yet
    Uninitialized,
    /// Waiting on the security service
    Pending,
    /// Every configured operation succeeded
    Passed,
    /// The security service refused the principal
    Failed,
    /// No decision could be reached
    Error,
}

impl AuthState {
    /// Whether the state is final for its context
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Error)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Pending => "PENDING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// What the host should do with the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Let the connection proceed
    Allow,
    /// Come back when the connection is resumed
    Again,
    /// Refuse the connection
    Deny,
    /// Refuse the connection; the gateway could not decide
    InternalError,
}

impl From<AuthState> for Verdict {
    fn from(state: AuthState) -> Self {
        match state {
            AuthState::Uninitialized | AuthState::Pending => Self::Again,
            AuthState::Passed => Self::Allow,
            AuthState::Failed => Self::Deny,
            AuthState::Error => Self::InternalError,
        }
    }
}

/// A security service operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Proxy token for the principal
    UserInfo,
    /// Token JSON for the principal
    UserJson,
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "user_info" => Ok(Self::UserInfo),
            "user_json" => Ok(Self::UserJson),
            other => Err(Error::Config(format!("unknown operation: {other}"))),
        }
    }
}

/// The operations a route requires.
///
/// Serialized as a list, e.g. `[user_info, user_json]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Operation>", into = "Vec<Operation>")]
pub struct OperationSet {
    /// Whether the UserInfo operation is required
    pub user_info: bool,
    /// Whether the UserJson operation is required
    pub user_json: bool,
}

impl OperationSet {
    /// Both operations
    #[must_use]
    pub const fn both() -> Self {
        Self {
            user_info: true,
            user_json: true,
        }
    }

    /// Whether no operation is required
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.user_info && !self.user_json
    }

    /// Whether `operation` is required
    #[must_use]
    pub const fn contains(self, operation: Operation) -> bool {
        match operation {
            Operation::UserInfo => self.user_info,
            Operation::UserJson => self.user_json,
        }
    }
}

impl FromIterator<Operation> for OperationSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), |mut set, op| {
            match op {
                Operation::UserInfo => set.user_info = true,
                Operation::UserJson => set.user_json = true,
            }
            set
        })
    }
}

impl From<Vec<Operation>> for OperationSet {
    fn from(operations: Vec<Operation>) -> Self {
        operations.into_iter().collect()
    }
}

impl From<OperationSet> for Vec<Operation> {
    fn from(set: OperationSet) -> Self {
        [Operation::UserInfo, Operation::UserJson]
            .into_iter()
            .filter(|op| set.contains(*op))
            .collect()
    }
}

/// Values published for a passed connection. Operations the route did not
/// require are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthVariables {
    /// Subject DN of the authenticated principal
    pub remote_user: String,
    /// Proxy token
    pub user_info: String,
    /// Proxy token signature
    pub user_info_signature: String,
    /// Token JSON
    pub user_info_json: String,
    /// Token JSON signature
    pub user_info_json_signature: String,
}

impl AuthVariables {
    /// Variable names paired with their values
    #[must_use]
    pub fn entries(&self) -> [(&'static str, &str); 5] {
        [
            ("remote_user", &self.remote_user),
            ("user_info", &self.user_info),
            ("user_info_signature", &self.user_info_signature),
            ("user_info_json", &self.user_info_json),
            ("user_info_json_signature", &self.user_info_json_signature),
        ]
    }
}

/// Result of driving a context to a terminal state
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// Final verdict
    pub verdict: Verdict,
    /// The settled context
    pub context: Arc<AuthContext>,
}

/// [`Connection`] that wakes an async task
#[derive(Debug, Default)]
pub struct NotifyConnection {
    notify: Notify,
}

impl NotifyConnection {
    /// Wait for the next resume. A resume that happened since the last wait
    /// is not lost.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Connection for NotifyConnection {
    fn resume(&self) {
        self.notify.notify_one();
    }
}

/// Coordinates certificate authentication for every connection of a worker.
pub struct AuthCoordinator {
    client: Arc<SecurityClient>,
    registry: Arc<PendingRegistry>,
    timer: Arc<dyn Timer>,
    settings: AuthConfig,
    next_id: AtomicU64,
}

impl AuthCoordinator {
    /// Create a coordinator
    #[must_use]
    pub fn new(
        client: Arc<SecurityClient>,
        registry: Arc<PendingRegistry>,
        timer: Arc<dyn Timer>,
        settings: AuthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            registry,
            timer,
            settings,
            next_id: AtomicU64::new(1),
        })
    }

    /// Security client in use
    #[must_use]
    pub fn client(&self) -> &Arc<SecurityClient> {
        &self.client
    }

    /// Pending registry in use
    #[must_use]
    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    /// Number of contexts waiting on the security service
    #[must_use]
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    /// Create a context for a connection. `connection` is resumed whenever
    /// the context settles after [`Self::evaluate`] returned [`Verdict::Again`].
    #[must_use]
    pub fn create_context(
        &self,
        identity: Identity,
        operations: OperationSet,
        connection: Option<Weak<dyn Connection>>,
    ) -> Arc<AuthContext> {
        let key = ContextKey::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(AuthContext::new(key, identity, operations, connection))
    }

    /// Advance a context without blocking.
    ///
    /// Terminal contexts report their stored outcome. A panic anywhere below
    /// is contained here: the context is errored and the host gets
    /// [`Verdict::InternalError`].
    pub fn evaluate(self: &Arc<Self>, ctx: &Arc<AuthContext>) -> Verdict {
        match panic::catch_unwind(AssertUnwindSafe(|| self.step(ctx))) {
            Ok(verdict) => verdict,
            Err(_) => {
                error!(context = %ctx.key(), "Authentication evaluation panicked");
                self.abandon(ctx, &Error::Internal("evaluation panicked".to_string()));
                Verdict::InternalError
            }
        }
    }

    /// Drive a fresh context to a terminal state.
    pub async fn authenticate(
        self: &Arc<Self>,
        identity: Identity,
        operations: OperationSet,
    ) -> AuthOutcome {
        let waker = Arc::new(NotifyConnection::default());
        let connection: Arc<dyn Connection> = waker.clone();
        let ctx = self.create_context(identity, operations, Some(Arc::downgrade(&connection)));

        loop {
            let verdict = self.evaluate(&ctx);
            if verdict != Verdict::Again {
                return AuthOutcome {
                    verdict,
                    context: ctx,
                };
            }
            waker.notified().await;
        }
    }

    /// Abort every pending context and, if configured and anything was
    /// pending, reinitialize the security client. Returns whether anything
    /// was pending.
    pub fn reset_pending(&self) -> bool {
        let drained = self
            .registry
            .lock()
            .drain_and_abort(crate::registry::RESET_REASON);
        let any = !drained.is_empty();
        self.reset(&drained);
        any
    }

    fn step(self: &Arc<Self>, ctx: &Arc<AuthContext>) -> Verdict {
        match ctx.state() {
            AuthState::Uninitialized => self.start(ctx),
            AuthState::Pending => {
                trace!(context = %ctx.key(), "Context still pending");
                Verdict::Again
            }
            settled => Verdict::from(settled),
        }
    }

    fn start(self: &Arc<Self>, ctx: &Arc<AuthContext>) -> Verdict {
        let operations = ctx.operations();
        if operations.is_empty() {
            {
                let mut inner = ctx.lock();
                if inner.state != AuthState::Uninitialized {
                    return Verdict::from(inner.state);
                }
                inner.finish(
                    AuthState::Failed,
                    Some("no authentication operations configured".to_string()),
                );
            }
            report(ctx);
            return Verdict::Deny;
        }

        {
            let mut registry = self.registry.lock();
            let mut inner = ctx.lock();
            if inner.state != AuthState::Uninitialized {
                return Verdict::from(inner.state);
            }
            inner.state = AuthState::Pending;
            inner.user_info = Slot::requested(operations.user_info);
            inner.user_json = Slot::requested(operations.user_json);
            drop(inner);
            registry.insert(ctx);
        }
        debug!(
            context = %ctx.key(),
            subject = %ctx.identity().subject,
            "Authentication started"
        );

        for operation in [Operation::UserInfo, Operation::UserJson] {
            if operations.contains(operation) && !self.dispatch(ctx, operation) {
                break;
            }
        }

        self.settle(ctx)
    }

    /// Hand one operation to the client. Returns whether the context is
    /// still pending afterwards.
    fn dispatch(&self, ctx: &Arc<AuthContext>, operation: Operation) -> bool {
        let identity = ctx.identity();
        let immediate = match operation {
            Operation::UserInfo => self
                .client
                .try_fetch_user_info(
                    identity,
                    self.on_complete(ctx, operation, OperationResult::UserInfo),
                )
                .map(|hit| hit.map(OperationResult::UserInfo)),
            Operation::UserJson => self
                .client
                .try_fetch_user_json(
                    identity,
                    self.on_complete(ctx, operation, OperationResult::UserJson),
                )
                .map(|hit| hit.map(OperationResult::UserJson)),
        };

        let errored = {
            let mut registry = self.registry.lock();
            if !registry.contains(ctx.key()) {
                return false;
            }
            let mut inner = ctx.lock();
            match immediate {
                Ok(Some(result)) => {
                    inner.record(result);
                    false
                }
                Ok(None) => false,
                Err(e) => {
                    inner.finish(AuthState::Error, Some(e.to_string()));
                    drop(inner);
                    registry.remove(ctx.key());
                    true
                }
            }
        };

        if errored {
            report(ctx);
            ctx.resume();
        }
        !errored
    }

    /// Completion callback for one background operation.
    fn on_complete<T>(
        &self,
        ctx: &Arc<AuthContext>,
        operation: Operation,
        wrap: fn(T) -> OperationResult,
    ) -> impl FnOnce(Result<T>) + Send + 'static
    where
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let ctx = Arc::downgrade(ctx);
        move |result| {
            let Some(ctx) = ctx.upgrade() else {
                return;
            };
            complete(&registry, &ctx, operation, result.map(wrap));
        }
    }

    /// Finalize PASSED if nothing is outstanding, otherwise arm the timer.
    fn settle(self: &Arc<Self>, ctx: &Arc<AuthContext>) -> Verdict {
        let passed = {
            let mut registry = self.registry.lock();
            let mut inner = ctx.lock();
            if inner.state == AuthState::Pending && !inner.outstanding() {
                inner.finish(AuthState::Passed, None);
                drop(inner);
                registry.remove(ctx.key());
                true
            } else {
                false
            }
        };
        if passed {
            report(ctx);
            return Verdict::Allow;
        }

        let state = ctx.state();
        if state == AuthState::Pending {
            self.arm(ctx);
        }
        Verdict::from(state)
    }

    fn abandon(&self, ctx: &AuthContext, reason: &Error) {
        let abandoned = {
            let mut registry = self.registry.lock();
            let mut inner = ctx.lock();
            registry.remove(ctx.key());
            if inner.state.is_terminal() {
                false
            } else {
                inner.finish(AuthState::Error, Some(reason.to_string()));
                true
            }
        };
        if abandoned {
            report(ctx);
        }
    }
}

/// Apply a background completion. A context no longer registered has
/// already settled and is left untouched.
fn complete(
    registry: &PendingRegistry,
    ctx: &AuthContext,
    operation: Operation,
    result: Result<OperationResult>,
) {
    let failed = {
        let mut registry = registry.lock();
        if !registry.contains(ctx.key()) {
            debug!(context = %ctx.key(), ?operation, "Late completion ignored");
            return;
        }
        let mut inner = ctx.lock();
        match result {
            Ok(value) => {
                debug!(context = %ctx.key(), ?operation, "Operation completed");
                inner.record(value);
                false
            }
            Err(e) => {
                match operation {
                    Operation::UserInfo => inner.user_info = Slot::Failed,
                    Operation::UserJson => inner.user_json = Slot::Failed,
                }
                inner.finish(AuthState::Failed, Some(e.to_string()));
                drop(inner);
                registry.remove(ctx.key());
                true
            }
        }
    };

    if failed {
        report(ctx);
        ctx.resume();
    }
}

/// Log and audit a terminal transition.
fn report(ctx: &AuthContext) {
    let subject = &ctx.identity().subject;
    let reason = ctx.failure_reason().unwrap_or_default();
    match ctx.state() {
        AuthState::Passed => {
            info!(context = %ctx.key(), subject = %subject, "Authentication passed");
            audit::emit(&AuthEvent::passed(ctx));
        }
        AuthState::Failed => {
            warn!(context = %ctx.key(), subject = %subject, reason = %reason, "Authentication failed");
            audit::emit(&AuthEvent::failed(ctx, reason));
        }
        AuthState::Error => {
            error!(context = %ctx.key(), subject = %subject, reason = %reason, "Authentication error");
            audit::emit(&AuthEvent::error(ctx, reason));
        }
        AuthState::Uninitialized | AuthState::Pending => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_set_serializes_as_list() {
        let set: OperationSet = serde_json::from_str(r#"["user_json"]"#).unwrap();
        assert!(!set.user_info && set.user_json);
        assert_eq!(
            serde_json::to_string(&OperationSet::both()).unwrap(),
            r#"["user_info","user_json"]"#
        );
    }

    #[test]
    fn operation_parses_from_cli_names() {
        assert_eq!("user_info".parse::<Operation>().unwrap(), Operation::UserInfo);
        assert_eq!(" user_json".parse::<Operation>().unwrap(), Operation::UserJson);
        assert!("both".parse::<Operation>().is_err());
    }

    #[test]
    fn verdict_follows_state() {
        assert_eq!(Verdict::from(AuthState::Passed), Verdict::Allow);
        assert_eq!(Verdict::from(AuthState::Pending), Verdict::Again);
        assert_eq!(Verdict::from(AuthState::Failed), Verdict::Deny);
        assert_eq!(Verdict::from(AuthState::Error), Verdict::InternalError);
    }

    #[test]
    fn empty_operation_set_is_empty() {
        assert!(OperationSet::default().is_empty());
        assert!(!OperationSet::both().is_empty());
        let names: Vec<&str> = AuthVariables::default()
            .entries()
            .iter()
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(names.len(), 5);
    }
}
