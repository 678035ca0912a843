//! Error types for the certificate authentication gateway

use std::io;

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request signing failed (missing or unusable signing key)
    #[error("Signing error: {0}")]
    Signing(String),

    /// Peer certificate could not be parsed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Security service could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// Security service answered with a protocol-level failure
    #[error("Security service error {status}: {message}")]
    SecurityService {
        /// HTTP status returned by the service
        status: u16,
        /// Message body returned by the service
        message: String,
    },

    /// A cached or freshly fetched credential has already expired
    #[error("Credential expired: {0}")]
    Expired(String),

    /// The security service has no record of the principal
    #[error("Identity not found: {0}")]
    IdentityNotFound(String),

    /// The security client has not been initialized (or its initialization failed)
    #[error("Security client not initialized")]
    NotInitialized,

    /// The in-flight call was discarded before it produced a result
    #[error("Security client reset before the call completed")]
    AdapterReset,

    /// Poll budget exhausted while waiting for the security service
    #[error("Authentication timed out after {attempts} poll attempts")]
    Timeout {
        /// Number of poll ticks that elapsed
        attempts: u32,
    },

    /// Unexpected authentication state
    #[error("Invalid authentication state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a security service error
    pub fn security_service(status: u16, message: impl Into<String>) -> Self {
        Self::SecurityService {
            status,
            message: message.into(),
        }
    }

    /// Whether this error means the principal was refused, as opposed to the
    /// gateway failing to get an answer at all.
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            Self::Expired(_) | Self::IdentityNotFound(_) => true,
            Self::SecurityService { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_and_not_found_are_authentication_failures() {
        assert!(Error::Expired("cn=a".into()).is_authentication_failure());
        assert!(Error::IdentityNotFound("cn=a".into()).is_authentication_failure());
        assert!(Error::security_service(403, "denied").is_authentication_failure());
    }

    #[test]
    fn transport_and_server_errors_are_not_authentication_failures() {
        assert!(!Error::Transport("connection refused".into()).is_authentication_failure());
        assert!(!Error::security_service(503, "unavailable").is_authentication_failure());
        assert!(!Error::Timeout { attempts: 3 }.is_authentication_failure());
        assert!(!Error::AdapterReset.is_authentication_failure());
    }

    #[test]
    fn display_includes_context() {
        let err = Error::security_service(500, "boom");
        assert_eq!(err.to_string(), "Security service error 500: boom");
        assert_eq!(
            Error::Timeout { attempts: 50 }.to_string(),
            "Authentication timed out after 50 poll attempts"
        );
    }
}
