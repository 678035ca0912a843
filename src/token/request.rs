//! Signed token requests.
//!
//! Two request shapes are sent to the security service:
//!
//! - [`ProxyTokenRequest`]: asks for a proxy token (the UserInfo operation).
//! - [`TokenRequest`]: asks for the user's token JSON (the UserJson operation).
//!
//! Both carry [`ValidityCaveats`] whose `signature` is an HMAC-SHA256 over
//! every other field. Builders fill in all fields first and sign last; any
//! later mutation must be followed by [`SignedRequest::sign`] or verification
//! fails.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{current_time_millis, format_time_millis};
use crate::mtls::Identity;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Key material and identity used to sign outgoing requests.
#[derive(Clone)]
pub struct SigningConfig {
    key: Vec<u8>,
    /// Security id of this application.
    pub security_id: String,
    /// Audience for plain token requests.
    pub issued_to: String,
    /// How long a signed principal stays valid.
    pub principal_validity: Duration,
}

impl SigningConfig {
    /// Create a signing config.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signing` if the key is empty.
    pub fn new(
        key: Vec<u8>,
        security_id: impl Into<String>,
        issued_to: impl Into<String>,
        principal_validity: Duration,
    ) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::Signing("signing key is empty".to_string()));
        }
        Ok(Self {
            key,
            security_id: security_id.into(),
            issued_to: issued_to.into(),
            principal_validity,
        })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| Error::Signing(format!("invalid key: {e}")))
    }

    fn expiry_from_now(&self) -> i64 {
        let validity = i64::try_from(self.principal_validity.as_millis()).unwrap_or(i64::MAX);
        current_time_millis().saturating_add(validity)
    }
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("key", &"<redacted>")
            .field("security_id", &self.security_id)
            .field("issued_to", &self.issued_to)
            .field("principal_validity", &self.principal_validity)
            .finish()
    }
}

/// Issuer / audience / expiry / signature attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidityCaveats {
    /// Issuing authority (our security id).
    pub issuer: String,
    /// Intended recipient.
    pub issued_to: String,
    /// Expiry, milliseconds since the Unix epoch.
    pub not_after: i64,
    /// Base64 HMAC-SHA256 over the rest of the request.
    pub signature: String,
}

impl ValidityCaveats {
    fn unsigned(issuer: &str, issued_to: &str, not_after: i64) -> Self {
        Self {
            issuer: issuer.to_owned(),
            issued_to: issued_to.to_owned(),
            not_after,
            signature: String::new(),
        }
    }

    fn write_fields(&self, out: &mut Canonical) {
        out.field(&self.issuer);
        out.field(&self.issued_to);
        out.field(&format_time_millis(self.not_after));
    }
}

/// Kind of token requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    /// End-user token
    User,
    /// Application token
    App,
}

impl TokenType {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::App => "APP",
        }
    }
}

/// Request for the user's token JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    /// Requesting application.
    pub security_id: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Principal (subject DN) the token is requested for.
    pub principal: String,
    /// Requested token type.
    pub token_type: TokenType,
    /// Validity caveats, signed last.
    pub caveats: ValidityCaveats,
}

/// Request for a proxy token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTokenRequest {
    /// Peer certificate identity.
    pub x509: Identity,
    /// Validity caveats, signed last.
    pub validity: ValidityCaveats,
}

/// A request whose caveats carry a signature over its other fields.
pub trait SignedRequest {
    /// Canonical bytes covered by the signature.
    fn signing_payload(&self) -> Vec<u8>;

    /// The caveats holding the signature.
    fn caveats(&self) -> &ValidityCaveats;

    /// Mutable access to the caveats.
    fn caveats_mut(&mut self) -> &mut ValidityCaveats;

    /// Recompute and attach the signature.
    fn sign(&mut self, config: &SigningConfig) -> Result<()> {
        let mut mac = config.mac()?;
        mac.update(&self.signing_payload());
        self.caveats_mut().signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(())
    }

    /// Check the attached signature against the current field values.
    fn verify(&self, config: &SigningConfig) -> bool {
        let Ok(provided) = STANDARD.decode(&self.caveats().signature) else {
            return false;
        };
        let Ok(mut mac) = config.mac() else {
            return false;
        };
        mac.update(&self.signing_payload());
        let expected = mac.finalize().into_bytes();
        provided.ct_eq(expected.as_slice()).into()
    }
}

impl SignedRequest for TokenRequest {
    fn signing_payload(&self) -> Vec<u8> {
        let mut out = Canonical::new("token-request");
        out.field(&self.security_id);
        out.field(&format_time_millis(self.timestamp));
        out.field(&self.principal);
        out.field(self.token_type.as_str());
        self.caveats.write_fields(&mut out);
        out.finish()
    }

    fn caveats(&self) -> &ValidityCaveats {
        &self.caveats
    }

    fn caveats_mut(&mut self) -> &mut ValidityCaveats {
        &mut self.caveats
    }
}

impl SignedRequest for ProxyTokenRequest {
    fn signing_payload(&self) -> Vec<u8> {
        let mut out = Canonical::new("proxy-token-request");
        out.field(&self.x509.subject);
        out.field(&self.x509.issuer);
        self.validity.write_fields(&mut out);
        out.finish()
    }

    fn caveats(&self) -> &ValidityCaveats {
        &self.validity
    }

    fn caveats_mut(&mut self) -> &mut ValidityCaveats {
        &mut self.validity
    }
}

/// Build a signed token request for the UserJson operation.
pub fn build_token_request(identity: &Identity, config: &SigningConfig) -> Result<TokenRequest> {
    let mut request = TokenRequest {
        security_id: config.security_id.clone(),
        timestamp: current_time_millis(),
        principal: identity.subject.clone(),
        token_type: TokenType::User,
        caveats: ValidityCaveats::unsigned(
            &config.security_id,
            &config.issued_to,
            config.expiry_from_now(),
        ),
    };
    request.sign(config)?;
    Ok(request)
}

/// Build a signed proxy token request for the UserInfo operation.
pub fn build_proxy_token_request(
    identity: &Identity,
    config: &SigningConfig,
) -> Result<ProxyTokenRequest> {
    let mut request = ProxyTokenRequest {
        x509: identity.clone(),
        validity: ValidityCaveats::unsigned(&config.security_id, "", config.expiry_from_now()),
    };
    request.sign(config)?;
    Ok(request)
}

/// Length-prefixed field encoding so that no two field layouts collide.
struct Canonical(Vec<u8>);

impl Canonical {
    fn new(domain: &str) -> Self {
        let mut out = Self(Vec::with_capacity(256));
        out.field(domain);
        out
    }

    fn field(&mut self, value: &str) {
        self.0.extend_from_slice(&(value.len() as u64).to_be_bytes());
        self.0.extend_from_slice(value.as_bytes());
    }

    fn finish(self) -> Vec<u8> {
        self.0
    }
}
