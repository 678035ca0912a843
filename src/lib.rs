//! Certificate Authentication Gateway Library
//!
//! Exchanges a TLS client certificate for signed identity tokens issued by a
//! remote security service, without blocking the host's request loop.
//!
//! # Components
//!
//! - **Coordinator**: per-connection state machine (`UNINITIALIZED → PENDING →
//!   PASSED | FAILED | ERROR`) driven by host evaluations, completion
//!   callbacks and a poll timer
//! - **Security client**: cache-or-dispatch and final-result fetches against
//!   the token service, with reinitialization
//! - **Pending registry**: in-flight contexts, drained by the circuit breaker
//!   when the poll budget runs out
//! - **Token requests**: HMAC-signed plain and proxy token requests
//! - **Gateway**: `GET /auth` endpoint for reverse-proxy sub-requests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod mtls;
pub mod registry;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Config(format!("tracing: {e}"))),
    }
}
