//! Mutual TLS peer identity.
//!
//! The TLS terminator (a reverse proxy, or rustls in front of the gateway)
//! validates the client certificate chain; this module only turns the
//! presented certificate into the [`Identity`] used as the authentication
//! principal.
//!
//! ```text
//! TLS handshake (chain verified upstream)
//!   → peer certificate (DER or PEM)
//!   → Identity { subject, issuer }
//!   → AuthCoordinator
//! ```

pub mod identity;

pub use identity::Identity;
