//! Certificate identity extraction.
//!
//! Parses an X.509 peer certificate and renders the subject and issuer
//! distinguished names used as the authentication principal. Names are
//! rendered most-specific first (`CN=alice, OU=eng, O=Example, C=US`), with
//! multi-valued RDNs joined by ` + `.
//!
//! Trust-chain validation is not done here; the certificate is assumed to have
//! been verified by the TLS terminator before it reaches this module.

use serde::{Deserialize, Serialize};
use x509_parser::certificate::X509Certificate;
use x509_parser::objects::{oid_registry, oid2abbrev};
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;

use crate::{Error, Result};

/// Rendering used when a certificate carries no subject or issuer.
const NO_NAME: &str = "(none)";

/// Subject and issuer of a peer certificate.
///
/// Immutable once extracted for a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Subject distinguished name.
    pub subject: String,
    /// Issuer distinguished name.
    pub issuer: String,
}

impl Identity {
    /// Build an identity from already-formatted names.
    pub fn new(subject: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            issuer: issuer.into(),
        }
    }

    /// Parse a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the bytes are not a certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("Failed to parse client certificate: {e}")))?;

        Ok(Self {
            subject: format_name(cert.subject()),
            issuer: format_name(cert.issuer()),
        })
    }

    /// Parse a PEM-encoded certificate (the first `CERTIFICATE` block).
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the input is not PEM or the contents are
    /// not a certificate.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem)
            .map_err(|e| Error::Certificate(format!("Failed to decode PEM certificate: {e}")))?;
        Self::from_der(&pem.contents)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (issuer: {})", self.subject, self.issuer)
    }
}

/// Render a distinguished name in reverse RDN order.
fn format_name(name: &X509Name<'_>) -> String {
    let registry = oid_registry();
    let mut rdns: Vec<String> = name
        .iter()
        .map(|rdn| {
            rdn.iter()
                .map(|attr| {
                    let key = oid2abbrev(attr.attr_type(), registry)
                        .map_or_else(|_| attr.attr_type().to_id_string(), str::to_owned);
                    let value = attr.as_str().unwrap_or("<binary>");
                    format!("{key}={value}")
                })
                .collect::<Vec<_>>()
                .join(" + ")
        })
        .collect();

    if rdns.is_empty() {
        return NO_NAME.to_owned();
    }
    rdns.reverse();
    rdns.join(", ")
}
