//! Security client adapter
//!
//! Wraps the remote security-token service behind two call shapes:
//!
//! - a cache-or-dispatch shape ([`SecurityClient::try_fetch_user_info`]) that
//!   answers from the local cache immediately or hands the remote call to a
//!   background task and reports later through a [`Completion`];
//! - a final-result shape ([`SecurityClient::fetch_user_info`]) that always
//!   resolves to an answer and is meant for callers allowed to wait.

mod adapter;
pub mod cache;
pub mod completion;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::token::{ProxyTokenRequest, ProxyTokenResponse, TokenJsonResponse, TokenRequest};

pub use adapter::SecurityClient;
pub use cache::{CacheStatsSnapshot, Lookup, ResultCache};
pub use completion::{Completion, OnComplete};
pub use http::{HttpConnector, HttpSecurityService};

/// A live connection to the security-token service
#[async_trait]
pub trait SecurityService: Send + Sync + 'static {
    /// Exchange a signed proxy token request for a proxy token
    async fn request_proxy_token(&self, request: ProxyTokenRequest) -> Result<ProxyTokenResponse>;

    /// Exchange a signed token request for the user's token JSON
    async fn request_user_json(&self, request: TokenRequest) -> Result<TokenJsonResponse>;
}

/// Opens connections to the security-token service
pub trait ServiceConnector: Send + Sync + 'static {
    /// Acquire a fresh connection
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot be configured or reached.
    fn connect(&self) -> Result<Arc<dyn SecurityService>>;
}
