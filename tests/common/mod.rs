//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::net::TcpListener;
use tokio::runtime::Handle;

use certauth_gateway::client::{SecurityClient, SecurityService, ServiceConnector};
use certauth_gateway::config::AuthConfig;
use certauth_gateway::coordinator::{AuthCoordinator, TokioTimer};
use certauth_gateway::registry::PendingRegistry;
use certauth_gateway::token::{
    ProxyTokenRequest, ProxyTokenResponse, SignedRequest, SigningConfig, TokenJsonResponse,
    TokenRequest, current_time_millis,
};
use certauth_gateway::{Error, Result};

/// Shared signing key of tests and fake services
pub const SIGNING_KEY: &[u8] = b"integration-test-key";

/// Signing configuration matching [`SIGNING_KEY`]
pub fn signing() -> SigningConfig {
    SigningConfig::new(
        SIGNING_KEY.to_vec(),
        "efe",
        "EzSecurity",
        Duration::from_secs(60),
    )
    .unwrap()
}

/// How the scripted service answers one operation
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Valid credential after `delay`
    Answer(Duration),
    /// Credential that expires `valid_for` after issue
    ShortLived(Duration),
    /// Service error with the given status after `delay`
    Fail(u16, Duration),
    /// Principal unknown to the service
    NotFound,
    /// Never answers
    Hang,
}

/// Poll settings with a short period
pub fn fast_polling(max_poll_attempts: u32) -> AuthConfig {
    AuthConfig {
        poll_period: Duration::from_millis(100),
        max_poll_attempts,
        reinit_on_reset: true,
    }
}

/// Token JSON with an embedded expiry
pub fn token_json(subject: &str, not_after: i64) -> String {
    format!(r#"{{"subject":"{subject}","notAfter":{not_after}}}"#)
}

/// In-memory security service driven by per-operation behaviors
pub struct ScriptedService {
    pub user_info: Behavior,
    pub user_json: Behavior,
    pub calls: Arc<AtomicU32>,
}

impl ScriptedService {
    pub fn new(user_info: Behavior, user_json: Behavior) -> Self {
        Self {
            user_info,
            user_json,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    async fn answer(&self, behavior: Behavior, subject: &str) -> Result<(String, String)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match behavior {
            Behavior::Answer(delay) => {
                tokio::time::sleep(delay).await;
                let not_after = current_time_millis() + 60_000;
                Ok((token_json(subject, not_after), "svc-sig".to_string()))
            }
            Behavior::ShortLived(valid_for) => {
                let valid_for = i64::try_from(valid_for.as_millis()).unwrap();
                let not_after = current_time_millis() + valid_for;
                Ok((token_json(subject, not_after), "svc-sig".to_string()))
            }
            Behavior::Fail(status, delay) => {
                tokio::time::sleep(delay).await;
                Err(Error::security_service(status, "scripted failure"))
            }
            Behavior::NotFound => Err(Error::IdentityNotFound(subject.to_string())),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl SecurityService for ScriptedService {
    async fn request_proxy_token(&self, request: ProxyTokenRequest) -> Result<ProxyTokenResponse> {
        let (token, signature) = self.answer(self.user_info, &request.x509.subject).await?;
        Ok(ProxyTokenResponse { token, signature })
    }

    async fn request_user_json(&self, request: TokenRequest) -> Result<TokenJsonResponse> {
        let (json, signature) = self.answer(self.user_json, &request.principal).await?;
        Ok(TokenJsonResponse { json, signature })
    }
}

/// Connector handing out one shared [`ScriptedService`]
pub struct ScriptedConnector {
    pub service: Arc<ScriptedService>,
    pub connects: Arc<AtomicU32>,
}

impl ServiceConnector for ScriptedConnector {
    fn connect(&self) -> Result<Arc<dyn SecurityService>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.service) as Arc<dyn SecurityService>)
    }
}

/// Everything a coordinator test needs to observe
pub struct Harness {
    pub coordinator: Arc<AuthCoordinator>,
    pub client: Arc<SecurityClient>,
    pub registry: Arc<PendingRegistry>,
    pub calls: Arc<AtomicU32>,
    pub connects: Arc<AtomicU32>,
}

/// Build an initialized coordinator over a scripted service
pub fn harness(service: ScriptedService, settings: AuthConfig) -> Harness {
    let harness = uninitialized_harness(service, settings);
    harness.client.initialize().unwrap();
    harness
}

/// Build a coordinator whose client has not been initialized
pub fn uninitialized_harness(service: ScriptedService, settings: AuthConfig) -> Harness {
    let calls = Arc::clone(&service.calls);
    let connects = Arc::new(AtomicU32::new(0));
    let connector = ScriptedConnector {
        service: Arc::new(service),
        connects: Arc::clone(&connects),
    };
    let client = Arc::new(SecurityClient::new(
        Arc::new(connector),
        signing(),
        Duration::from_secs(300),
        Handle::current(),
    ));
    let registry = Arc::new(PendingRegistry::new());
    let coordinator = AuthCoordinator::new(
        Arc::clone(&client),
        Arc::clone(&registry),
        Arc::new(TokioTimer::current()),
        settings,
    );
    Harness {
        coordinator,
        client,
        registry,
        calls,
        connects,
    }
}

/// Self-signed PEM certificate with the given DN entries (in encoding order)
pub fn pem_cert(entries: &[(DnType, &str)]) -> String {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    for (ty, value) in entries {
        dn.push(ty.clone(), *value);
    }
    params.distinguished_name = dn;
    let key_pair = KeyPair::generate().unwrap();
    params.self_signed(&key_pair).unwrap().pem()
}

/// Subject prefix the HTTP fake does not know
pub const UNKNOWN_SUBJECT: &str = "CN=ghost";
/// Subject prefix the HTTP fake fails on
pub const BROKEN_SUBJECT: &str = "CN=broken";

#[derive(Clone)]
struct FakeState {
    signing: Arc<SigningConfig>,
    calls: Arc<AtomicU32>,
}

fn reject_or<F>(state: &FakeState, verified: bool, subject: &str, ok: F) -> Response
where
    F: FnOnce(String) -> Response,
{
    state.calls.fetch_add(1, Ordering::SeqCst);
    if !verified {
        return (StatusCode::UNAUTHORIZED, "bad signature").into_response();
    }
    if subject.starts_with(UNKNOWN_SUBJECT) {
        StatusCode::NOT_FOUND.into_response()
    } else if subject.starts_with(BROKEN_SUBJECT) {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
    } else {
        ok(token_json(subject, current_time_millis() + 60_000))
    }
}

async fn fake_proxy_token(
    State(state): State<FakeState>,
    Json(request): Json<ProxyTokenRequest>,
) -> Response {
    let verified = request.verify(&state.signing);
    reject_or(&state, verified, &request.x509.subject, |token| {
        Json(ProxyTokenResponse {
            token,
            signature: "proxy-sig".to_string(),
        })
        .into_response()
    })
}

async fn fake_user_json(
    State(state): State<FakeState>,
    Json(request): Json<TokenRequest>,
) -> Response {
    let verified = request.verify(&state.signing);
    reject_or(&state, verified, &request.principal, |json| {
        Json(TokenJsonResponse {
            json,
            signature: "json-sig".to_string(),
        })
        .into_response()
    })
}

/// Spawn an HTTP security service on an ephemeral port.
///
/// Returns the base URL and a call counter.
pub async fn spawn_security_service() -> (String, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let state = FakeState {
        signing: Arc::new(signing()),
        calls: Arc::clone(&calls),
    };
    let app = Router::new()
        .route("/v1/proxy-token", post(fake_proxy_token))
        .route("/v1/user-json", post(fake_user_json))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), calls)
}
