//! HTTP transport tests against an in-process security service

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::runtime::Handle;

use certauth_gateway::Error;
use certauth_gateway::client::{SecurityClient, SecurityService, ServiceConnector};
use certauth_gateway::client::{HttpConnector, HttpSecurityService};
use certauth_gateway::config::SecurityServiceConfig;
use certauth_gateway::mtls::Identity;
use certauth_gateway::token::{
    SigningConfig, build_proxy_token_request, build_token_request,
};

use common::{BROKEN_SUBJECT, SIGNING_KEY, UNKNOWN_SUBJECT, signing, spawn_security_service};

fn service_config(url: &str) -> SecurityServiceConfig {
    SecurityServiceConfig {
        url: url.to_string(),
        signing_key: Some(String::from_utf8(SIGNING_KEY.to_vec()).unwrap()),
        request_timeout: Duration::from_secs(2),
        ..SecurityServiceConfig::default()
    }
}

#[tokio::test]
async fn test_signed_requests_are_accepted() {
    // GIVEN: a service verifying signatures with the shared key
    let (url, calls) = spawn_security_service().await;
    let service = HttpConnector::new(&service_config(&url)).connect().unwrap();
    let identity = Identity::new("CN=alice", "CN=ca");

    // WHEN: both operations are requested
    let proxy = service
        .request_proxy_token(build_proxy_token_request(&identity, &signing()).unwrap())
        .await
        .unwrap();
    let json = service
        .request_user_json(build_token_request(&identity, &signing()).unwrap())
        .await
        .unwrap();

    // THEN: both answered
    assert!(proxy.token.contains("CN=alice"));
    assert_eq!(proxy.signature, "proxy-sig");
    assert_eq!(json.signature, "json-sig");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_wrong_key_is_rejected_as_service_error() {
    let (url, _) = spawn_security_service().await;
    let service = HttpSecurityService::new(reqwest::Client::new(), &url);
    let wrong = SigningConfig::new(b"other".to_vec(), "efe", "EzSecurity", Duration::from_secs(60))
        .unwrap();
    let request = build_proxy_token_request(&Identity::new("CN=alice", "CN=ca"), &wrong).unwrap();

    let err = service.request_proxy_token(request).await.unwrap_err();

    assert!(matches!(err, Error::SecurityService { status: 401, .. }), "{err}");
    assert!(err.is_authentication_failure());
}

#[tokio::test]
async fn test_unknown_principal_maps_to_identity_not_found() {
    let (url, _) = spawn_security_service().await;
    let service = HttpSecurityService::new(reqwest::Client::new(), &url);
    let request =
        build_token_request(&Identity::new(UNKNOWN_SUBJECT, "CN=ca"), &signing()).unwrap();

    let err = service.request_user_json(request).await.unwrap_err();

    assert!(matches!(err, Error::IdentityNotFound(ref s) if s == UNKNOWN_SUBJECT));
}

#[tokio::test]
async fn test_server_error_keeps_status_and_body() {
    let (url, _) = spawn_security_service().await;
    let service = HttpSecurityService::new(reqwest::Client::new(), &url);
    let request =
        build_proxy_token_request(&Identity::new(BROKEN_SUBJECT, "CN=ca"), &signing()).unwrap();

    let err = service.request_proxy_token(request).await.unwrap_err();

    match err {
        Error::SecurityService { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_service_is_transport_error() {
    // Bind then drop to get a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let service = HttpSecurityService::new(reqwest::Client::new(), &format!("http://{addr}"));
    let request = build_token_request(&Identity::new("CN=alice", "CN=ca"), &signing()).unwrap();

    let err = service.request_user_json(request).await.unwrap_err();

    assert!(matches!(err, Error::Transport(_)), "{err}");
    assert!(!err.is_authentication_failure());
}

#[tokio::test]
async fn test_client_from_config_fetches_and_caches() {
    // GIVEN: an HTTP-backed client built from configuration
    let (url, calls) = spawn_security_service().await;
    let client = SecurityClient::from_config(&service_config(&url), Handle::current()).unwrap();
    client.initialize().unwrap();
    let identity = Identity::new("CN=alice", "CN=ca");

    // WHEN: the same user info is fetched twice
    let first = client.fetch_user_info(&identity).await.unwrap();
    let second = client.fetch_user_info(&identity).await.unwrap();

    // THEN: the second answer came from the cache
    assert_eq!(first, second);
    assert_eq!(first.user_dn, "CN=alice");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.user_info_cache_stats().hits, 1);
}
