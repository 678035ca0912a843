//! Poll timer and the per-tick transition of pending contexts.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

use super::{AuthContext, AuthCoordinator, AuthState, report};
use crate::audit::{self, AuthEvent};
use crate::Error;

/// Boxed timer task
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Single-shot timer facility provided by the host.
pub trait Timer: Send + Sync + 'static {
    /// Run `task` once after `delay`. Must not run it inline.
    fn schedule(&self, delay: Duration, task: TimerTask);
}

/// [`Timer`] backed by a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: Handle,
}

impl TokioTimer {
    /// Schedule on the given runtime
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule on the runtime of the calling task
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

enum Tick {
    Passed,
    Rearm,
    TimedOut {
        attempts: u32,
        drained: Vec<Arc<AuthContext>>,
    },
    Settled,
}

impl AuthCoordinator {
    /// Arm the poll timer unless one is already outstanding.
    pub(super) fn arm(self: &Arc<Self>, ctx: &Arc<AuthContext>) {
        {
            let mut inner = ctx.lock();
            if inner.timer_armed || inner.state != AuthState::Pending {
                return;
            }
            inner.timer_armed = true;
        }

        let coordinator: Weak<Self> = Arc::downgrade(self);
        let ctx = Arc::clone(ctx);
        self.timer.schedule(
            self.settings.poll_period,
            Box::new(move || {
                if let Some(coordinator) = coordinator.upgrade() {
                    coordinator.tick(&ctx);
                }
            }),
        );
    }

    /// One poll tick. Only inspects state the callbacks already mutated.
    pub(crate) fn tick(self: &Arc<Self>, ctx: &Arc<AuthContext>) {
        let outcome = {
            let mut registry = self.registry.lock();
            let mut inner = ctx.lock();
            inner.timer_armed = false;

            if inner.state != AuthState::Pending {
                Tick::Settled
            } else if !inner.outstanding() {
                inner.finish(AuthState::Passed, None);
                drop(inner);
                registry.remove(ctx.key());
                Tick::Passed
            } else {
                inner.poll_attempts += 1;
                let attempts = inner.poll_attempts;
                trace!(context = %ctx.key(), attempts, "Still waiting on security service");

                if attempts >= self.settings.max_poll_attempts {
                    inner.finish(
                        AuthState::Error,
                        Some(Error::Timeout { attempts }.to_string()),
                    );
                    drop(inner);
                    let drained = registry.drain_and_abort(crate::registry::RESET_REASON);
                    Tick::TimedOut { attempts, drained }
                } else {
                    Tick::Rearm
                }
            }
        };

        match outcome {
            Tick::Passed => {
                report(ctx);
                ctx.resume();
            }
            Tick::Rearm => self.arm(ctx),
            Tick::TimedOut { attempts, drained } => {
                error!(
                    context = %ctx.key(),
                    subject = %ctx.identity().subject,
                    attempts,
                    "Security service did not answer in time"
                );
                self.reset(&drained);
            }
            Tick::Settled => {
                debug!(context = %ctx.key(), state = %ctx.state(), "Tick on settled context");
                ctx.resume();
            }
        }
    }

    /// Circuit-breaker side effects after a registry drain.
    pub(super) fn reset(&self, drained: &[Arc<AuthContext>]) {
        let reinitialize = !drained.is_empty() && self.settings.reinit_on_reset;
        let mut reinitialized = false;
        if reinitialize {
            warn!("Reinitializing security client after reset");
            match self.client.initialize() {
                Ok(()) => reinitialized = true,
                Err(e) => error!(error = %e, "Security client reinitialization failed"),
            }
        }
        audit::emit(&AuthEvent::reset(drained.len(), reinitialized));

        for ctx in drained {
            report(ctx);
            ctx.resume();
        }
    }
}
