//! Audit logging for authentication lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the serialized event in
//! the `audit` field, so the trail can be extracted by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.passed` | A context finished with every configured operation answered |
//! | `auth.failed` | The security service refused one of the operations |
//! | `auth.error` | The context could not be decided (transport, expiry, timeout, internal) |
//! | `auth.reset` | The poll budget ran out and pending contexts were aborted |

use serde::Serialize;

use crate::coordinator::{AuthContext, OperationSet};

/// Structured audit event emitted for every terminal authentication transition.
#[derive(Debug, Serialize)]
pub struct AuthEvent {
    /// Event type string (e.g., `"auth.passed"`).
    pub event: &'static str,
    /// Context key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Subject DN of the peer certificate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Issuer DN of the peer certificate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Operations the route required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<OperationSet>,
    /// Poll ticks consumed before the outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_attempts: Option<u32>,
    /// Contexts aborted by a reset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<usize>,
    /// Whether the security client was reinitialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reinitialized: Option<bool>,
    /// Human-readable reason for failure or error events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuthEvent {
    fn for_context(event: &'static str, ctx: &AuthContext, reason: Option<String>) -> Self {
        Self {
            event,
            context: Some(ctx.key().to_string()),
            subject: Some(ctx.identity().subject.clone()),
            issuer: Some(ctx.identity().issuer.clone()),
            operations: Some(ctx.operations()),
            poll_attempts: Some(ctx.poll_attempts()),
            aborted: None,
            reinitialized: None,
            reason,
        }
    }

    /// Construct an `auth.passed` event.
    #[must_use]
    pub fn passed(ctx: &AuthContext) -> Self {
        Self::for_context("auth.passed", ctx, None)
    }

    /// Construct an `auth.failed` event.
    #[must_use]
    pub fn failed(ctx: &AuthContext, reason: impl Into<String>) -> Self {
        Self::for_context("auth.failed", ctx, Some(reason.into()))
    }

    /// Construct an `auth.error` event.
    #[must_use]
    pub fn error(ctx: &AuthContext, reason: impl Into<String>) -> Self {
        Self::for_context("auth.error", ctx, Some(reason.into()))
    }

    /// Construct an `auth.reset` event.
    #[must_use]
    pub fn reset(aborted: usize, reinitialized: bool) -> Self {
        Self {
            event: "auth.reset",
            context: None,
            subject: None,
            issuer: None,
            operations: None,
            poll_attempts: None,
            aborted: Some(aborted),
            reinitialized: Some(reinitialized),
            reason: None,
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO certauth_gateway::audit audit={"event":"auth.passed","subject":...}
/// ```
pub fn emit(event: &AuthEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "auth audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
