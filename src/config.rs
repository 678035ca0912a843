//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::coordinator::OperationSet;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP auth endpoint configuration
    pub server: ServerConfig,
    /// Remote security-token service configuration
    pub security: SecurityServiceConfig,
    /// Poll/retry behaviour of the authentication coordinator
    pub auth: AuthConfig,
    /// Per-route operation sets, keyed by path prefix
    pub routes: HashMap<String, RouteConfig>,
}

/// HTTP auth endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9180,
        }
    }
}

/// Remote security-token service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityServiceConfig {
    /// Base URL of the token service
    pub url: String,
    /// Security id of this application (the requester)
    pub security_id: String,
    /// Audience written into plain token requests
    pub issued_to: String,
    /// Shared signing key. Supports a literal value or `env:VAR_NAME`.
    pub signing_key: Option<String>,
    /// How long a signed request principal stays valid
    #[serde(with = "humantime_serde")]
    pub principal_validity: Duration,
    /// Per-call HTTP timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Upper bound on how long a result may be served from the cache
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for SecurityServiceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8443".to_string(),
            security_id: "efe".to_string(),
            issued_to: "EzSecurity".to_string(),
            signing_key: None,
            principal_validity: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl SecurityServiceConfig {
    /// Resolve the signing key (expand `env:` references)
    ///
    /// # Errors
    ///
    /// Returns `Error::Signing` if no key is configured, the referenced
    /// environment variable is unset, or the key is empty.
    pub fn resolve_signing_key(&self) -> Result<Vec<u8>> {
        let raw = self
            .signing_key
            .as_deref()
            .ok_or_else(|| Error::Signing("security.signing_key is not set".to_string()))?;

        let key = if let Some(var_name) = raw.strip_prefix("env:") {
            env::var(var_name)
                .map_err(|_| Error::Signing(format!("environment variable {var_name} is not set")))?
        } else {
            raw.to_string()
        };

        if key.is_empty() {
            return Err(Error::Signing("signing key is empty".to_string()));
        }
        Ok(key.into_bytes())
    }
}

/// Poll/retry behaviour of the authentication coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Delay between poll ticks while a context is pending
    #[serde(with = "humantime_serde")]
    pub poll_period: Duration,
    /// Poll ticks allowed before a pending context is aborted
    pub max_poll_attempts: u32,
    /// Reinitialize the security client after a circuit-breaker reset
    pub reinit_on_reset: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_millis(600),
            max_poll_attempts: 50,
            reinit_on_reset: true,
        }
    }
}

/// Operations required for requests under a path prefix
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Operations to run (`user_info`, `user_json`)
    pub operations: OperationSet,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (CERTAUTH_ prefix)
        figment = figment.merge(Env::prefixed("CERTAUTH_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.auth.poll_period.is_zero() {
            return Err(Error::Config("auth.poll_period must be non-zero".to_string()));
        }
        if self.auth.max_poll_attempts == 0 {
            return Err(Error::Config(
                "auth.max_poll_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Operation set for a request path (longest matching prefix wins).
    ///
    /// Returns an empty set when no route matches.
    #[must_use]
    pub fn operations_for(&self, path: &str) -> OperationSet {
        self.routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, route)| route.operations)
            .unwrap_or_default()
    }
}
