//! The security client: connection lifecycle, cache, and both fetch shapes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::cache::{CacheStatsSnapshot, Lookup, ResultCache};
use super::completion::Completion;
use super::http::HttpConnector;
use super::{SecurityService, ServiceConnector};
use crate::config::SecurityServiceConfig;
use crate::mtls::Identity;
use crate::token::{
    Expiring, SigningConfig, UserInfo, UserJson, build_proxy_token_request, build_token_request,
    current_time_millis, is_expired_at,
};
use crate::{Error, Result};

/// Live connection tagged with the initialization that produced it
#[derive(Clone)]
struct Connection {
    service: Arc<dyn SecurityService>,
    generation: u64,
}

/// Client for the remote security-token service.
///
/// Safe to share between connections; `initialize` may replace the
/// underlying connection while background fetches are still running. Those
/// fetches finish against the connection they started on, and their results
/// are kept out of the cache.
pub struct SecurityClient {
    connector: Arc<dyn ServiceConnector>,
    signing: SigningConfig,
    connection: RwLock<Option<Connection>>,
    user_info_cache: Arc<ResultCache<UserInfo>>,
    user_json_cache: Arc<ResultCache<UserJson>>,
    generation: Arc<RwLock<u64>>,
    runtime: Handle,
}

impl SecurityClient {
    /// Create an uninitialized client. Background fetches run on `runtime`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn ServiceConnector>,
        signing: SigningConfig,
        cache_ttl: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            connector,
            signing,
            connection: RwLock::new(None),
            user_info_cache: Arc::new(ResultCache::new(cache_ttl)),
            user_json_cache: Arc::new(ResultCache::new(cache_ttl)),
            generation: Arc::new(RwLock::new(0)),
            runtime,
        }
    }

    /// Create an uninitialized HTTP-backed client from configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Signing` if the signing key cannot be resolved.
    pub fn from_config(config: &SecurityServiceConfig, runtime: Handle) -> Result<Self> {
        let signing = SigningConfig::new(
            config.resolve_signing_key()?,
            config.security_id.clone(),
            config.issued_to.clone(),
            config.principal_validity,
        )?;
        Ok(Self::new(
            Arc::new(HttpConnector::new(config)),
            signing,
            config.cache_ttl,
            runtime,
        ))
    }

    /// (Re)acquire the service connection.
    ///
    /// Replaces an existing connection and clears both caches. On failure the
    /// client is left uninitialized.
    ///
    /// # Errors
    ///
    /// Returns the connector's error.
    pub fn initialize(&self) -> Result<()> {
        let mut slot = self.connection.write();
        if slot.is_some() {
            warn!("Security client already initialized, replacing connection");
        }
        *slot = None;

        // `accept` checks the generation under this same lock
        let generation = {
            let mut current = self.generation.write();
            *current += 1;
            self.user_info_cache.clear();
            self.user_json_cache.clear();
            *current
        };

        match self.connector.connect() {
            Ok(service) => {
                *slot = Some(Connection {
                    service,
                    generation,
                });
                info!(generation, "Security client initialized");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Security client initialization failed");
                Err(e)
            }
        }
    }

    /// Whether a connection is currently held
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Number of `initialize` attempts so far
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.read()
    }

    /// Signing configuration used for outgoing requests
    #[must_use]
    pub fn signing_config(&self) -> &SigningConfig {
        &self.signing
    }

    /// Statistics of the user info cache
    #[must_use]
    pub fn user_info_cache_stats(&self) -> CacheStatsSnapshot {
        self.user_info_cache.stats()
    }

    /// Statistics of the user JSON cache
    #[must_use]
    pub fn user_json_cache_stats(&self) -> CacheStatsSnapshot {
        self.user_json_cache.stats()
    }

    /// Drop cached results that are no longer servable
    pub fn evict_expired(&self) {
        self.user_info_cache.evict_expired();
        self.user_json_cache.evict_expired();
    }

    fn connection(&self) -> Result<Connection> {
        self.connection.read().clone().ok_or(Error::NotInitialized)
    }

    /// Cache-or-dispatch fetch of the user's proxy token.
    ///
    /// Returns `Ok(Some(_))` on a cache hit; `on_complete` is then never
    /// called. Returns `Ok(None)` after handing the call to a background task;
    /// `on_complete` then runs exactly once. An `Err` means nothing was
    /// dispatched.
    ///
    /// # Errors
    ///
    /// `Expired` for a cached credential past its expiry, `Signing` if the
    /// request cannot be signed, `NotInitialized` without a connection.
    pub fn try_fetch_user_info(
        &self,
        identity: &Identity,
        on_complete: impl FnOnce(Result<UserInfo>) + Send + 'static,
    ) -> Result<Option<UserInfo>> {
        if let Some(hit) = cached(&self.user_info_cache, "user_info", identity)? {
            return Ok(Some(hit));
        }

        let request = build_proxy_token_request(identity, &self.signing)?;
        let connection = self.connection()?;
        info!(subject = %identity.subject, operation = "user_info", "Requesting proxy token");

        let subject = identity.subject.clone();
        let generation = connection.generation;
        let call = async move {
            connection
                .service
                .request_proxy_token(request)
                .await
                .map(|response| UserInfo::from_response(&subject, response))
        };
        self.dispatch(
            Arc::clone(&self.user_info_cache),
            identity.clone(),
            generation,
            call,
            Completion::new(on_complete),
        );
        Ok(None)
    }

    /// Cache-or-dispatch fetch of the user's token JSON.
    ///
    /// Same contract as [`Self::try_fetch_user_info`].
    ///
    /// # Errors
    ///
    /// See [`Self::try_fetch_user_info`].
    pub fn try_fetch_user_json(
        &self,
        identity: &Identity,
        on_complete: impl FnOnce(Result<UserJson>) + Send + 'static,
    ) -> Result<Option<UserJson>> {
        if let Some(hit) = cached(&self.user_json_cache, "user_json", identity)? {
            return Ok(Some(hit));
        }

        let request = build_token_request(identity, &self.signing)?;
        let connection = self.connection()?;
        info!(subject = %identity.subject, operation = "user_json", "Requesting token JSON");

        let generation = connection.generation;
        let call = async move {
            connection
                .service
                .request_user_json(request)
                .await
                .map(UserJson::from)
        };
        self.dispatch(
            Arc::clone(&self.user_json_cache),
            identity.clone(),
            generation,
            call,
            Completion::new(on_complete),
        );
        Ok(None)
    }

    /// Fetch the user's proxy token, waiting for the service if needed.
    ///
    /// # Errors
    ///
    /// Any cache, signing, connection, transport or expiry error.
    pub async fn fetch_user_info(&self, identity: &Identity) -> Result<UserInfo> {
        if let Some(hit) = cached(&self.user_info_cache, "user_info", identity)? {
            return Ok(hit);
        }

        let request = build_proxy_token_request(identity, &self.signing)?;
        let connection = self.connection()?;
        info!(subject = %identity.subject, operation = "user_info", "Requesting proxy token");
        let response = connection.service.request_proxy_token(request).await?;
        accept(
            &self.user_info_cache,
            &self.generation,
            connection.generation,
            identity,
            UserInfo::from_response(&identity.subject, response),
        )
    }

    /// Fetch the user's token JSON, waiting for the service if needed.
    ///
    /// # Errors
    ///
    /// Any cache, signing, connection, transport or expiry error.
    pub async fn fetch_user_json(&self, identity: &Identity) -> Result<UserJson> {
        if let Some(hit) = cached(&self.user_json_cache, "user_json", identity)? {
            return Ok(hit);
        }

        let request = build_token_request(identity, &self.signing)?;
        let connection = self.connection()?;
        info!(subject = %identity.subject, operation = "user_json", "Requesting token JSON");
        let response = connection.service.request_user_json(request).await?;
        accept(
            &self.user_json_cache,
            &self.generation,
            connection.generation,
            identity,
            UserJson::from(response),
        )
    }

    fn dispatch<T, F>(
        &self,
        cache: Arc<ResultCache<T>>,
        identity: Identity,
        generation: u64,
        call: F,
        completion: Completion<T>,
    ) where
        T: Expiring + Clone + Send + Sync + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let current = Arc::clone(&self.generation);
        debug!(subject = %identity.subject, generation, "Dispatching background fetch");
        self.runtime.spawn(async move {
            let result = match call.await {
                Ok(value) => accept(&cache, &current, generation, &identity, value),
                Err(e) => Err(e),
            };
            completion.complete(result);
        });
    }
}

fn cached<T: Clone>(
    cache: &ResultCache<T>,
    operation: &str,
    identity: &Identity,
) -> Result<Option<T>> {
    match cache.get(identity) {
        Lookup::Hit(value) => {
            info!(subject = %identity.subject, operation, "Serving cached result");
            Ok(Some(value))
        }
        Lookup::Expired => {
            warn!(subject = %identity.subject, operation, "Cached credential has expired");
            Err(Error::Expired(identity.subject.clone()))
        }
        Lookup::Miss => Ok(None),
    }
}

/// Expiry-check a fresh result and cache it if its connection is still current.
///
/// The generation check and the insert share one read lock on `current`, so
/// `initialize` cannot clear the cache in between.
fn accept<T: Expiring + Clone>(
    cache: &ResultCache<T>,
    current: &RwLock<u64>,
    generation: u64,
    identity: &Identity,
    value: T,
) -> Result<T> {
    let subject = &identity.subject;
    let not_after = value.not_after()?;
    if is_expired_at(not_after, current_time_millis()) {
        warn!(subject = %subject, not_after, "Security service issued an expired credential");
        return Err(Error::Expired(subject.clone()));
    }
    let current = current.read();
    if *current == generation {
        cache.insert(identity, value.clone(), not_after);
    } else {
        debug!(subject = %subject, generation, "Result from a replaced connection, not cached");
    }
    Ok(value)
}
