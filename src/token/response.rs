//! Security service responses and the authentication results derived from them.

use serde::{Deserialize, Serialize};

use super::current_time_millis;
use crate::Result;

/// Proxy token returned for the UserInfo operation.
///
/// `token` is a JSON document issued by the security service; it carries at
/// least a `notAfter` field (milliseconds since the Unix epoch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTokenResponse {
    /// Opaque signed proxy token (JSON text).
    pub token: String,
    /// Security service signature over `token`.
    pub signature: String,
}

/// Token JSON returned for the UserJson operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenJsonResponse {
    /// JSON rendering of the user's security token.
    pub json: String,
    /// Security service signature over `json`.
    pub signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddedExpiry {
    not_after: i64,
}

fn embedded_not_after(document: &str) -> Result<i64> {
    Ok(serde_json::from_str::<EmbeddedExpiry>(document)?.not_after)
}

/// A result that carries its own expiry.
pub trait Expiring {
    /// Expiry, milliseconds since the Unix epoch.
    fn not_after(&self) -> Result<i64>;
}

impl Expiring for ProxyTokenResponse {
    fn not_after(&self) -> Result<i64> {
        embedded_not_after(&self.token)
    }
}

impl Expiring for TokenJsonResponse {
    fn not_after(&self) -> Result<i64> {
        embedded_not_after(&self.json)
    }
}

/// Expiry check. Strictly-past is expired; a result expiring exactly now is
/// still valid.
#[must_use]
pub fn is_expired_at(not_after: i64, now: i64) -> bool {
    not_after < now
}

/// Whether a result has passed its embedded expiry.
pub fn has_expired(result: &impl Expiring) -> Result<bool> {
    Ok(is_expired_at(result.not_after()?, current_time_millis()))
}

/// Verified user info surfaced for a passed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Subject distinguished name.
    pub user_dn: String,
    /// Proxy token string.
    pub token: String,
    /// Proxy token signature.
    pub signature: String,
}

impl UserInfo {
    /// Combine the requesting subject with a proxy token response.
    pub fn from_response(subject: &str, response: ProxyTokenResponse) -> Self {
        Self {
            user_dn: subject.to_owned(),
            token: response.token,
            signature: response.signature,
        }
    }
}

impl Expiring for UserInfo {
    fn not_after(&self) -> Result<i64> {
        embedded_not_after(&self.token)
    }
}

/// Verified user JSON surfaced for a passed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJson {
    /// Token JSON.
    pub json: String,
    /// Token JSON signature.
    pub signature: String,
}

impl From<TokenJsonResponse> for UserJson {
    fn from(response: TokenJsonResponse) -> Self {
        Self {
            json: response.json,
            signature: response.signature,
        }
    }
}

impl Expiring for UserJson {
    fn not_after(&self) -> Result<i64> {
        embedded_not_after(&self.json)
    }
}
