//! HTTP transport to the security-token service

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use super::{SecurityService, ServiceConnector};
use crate::config::SecurityServiceConfig;
use crate::token::{ProxyTokenRequest, ProxyTokenResponse, TokenJsonResponse, TokenRequest};
use crate::{Error, Result};

/// Path of the proxy token endpoint, relative to the service URL
pub const PROXY_TOKEN_PATH: &str = "/v1/proxy-token";
/// Path of the user JSON endpoint, relative to the service URL
pub const USER_JSON_PATH: &str = "/v1/user-json";

/// JSON-over-HTTP security service connection
pub struct HttpSecurityService {
    http: Client,
    base_url: String,
}

impl HttpSecurityService {
    /// Create a connection to `base_url`
    #[must_use]
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<Req, Resp>(&self, path: &str, principal: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, principal = %principal, "Calling security service");

        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::IdentityNotFound(principal.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::security_service(status.as_u16(), message));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| Error::security_service(502, format!("malformed response from {url}: {e}")))
    }
}

#[async_trait]
impl SecurityService for HttpSecurityService {
    async fn request_proxy_token(&self, request: ProxyTokenRequest) -> Result<ProxyTokenResponse> {
        self.post(PROXY_TOKEN_PATH, &request.x509.subject, &request)
            .await
    }

    async fn request_user_json(&self, request: TokenRequest) -> Result<TokenJsonResponse> {
        self.post(USER_JSON_PATH, &request.principal, &request).await
    }
}

/// Builds [`HttpSecurityService`] connections from configuration
pub struct HttpConnector {
    url: String,
    timeout: std::time::Duration,
}

impl HttpConnector {
    /// Create a connector for the configured service
    #[must_use]
    pub fn new(config: &SecurityServiceConfig) -> Self {
        Self {
            url: config.url.clone(),
            timeout: config.request_timeout,
        }
    }
}

impl ServiceConnector for HttpConnector {
    fn connect(&self) -> Result<Arc<dyn SecurityService>> {
        if self.url.is_empty() {
            return Err(Error::Config("security.url is not set".to_string()));
        }
        let http = Client::builder().timeout(self.timeout).build()?;
        Ok(Arc::new(HttpSecurityService::new(http, &self.url)))
    }
}
