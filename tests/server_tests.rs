//! Auth endpoint tests - full path from certificate header to response headers

mod common;

use std::collections::HashMap;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use rcgen::DnType;
use reqwest::StatusCode;
use tokio::net::TcpListener;

use certauth_gateway::config::{Config, RouteConfig};
use certauth_gateway::coordinator::OperationSet;
use certauth_gateway::gateway::{CLIENT_CERT_HEADER, Gateway, ORIGINAL_URI_HEADER};

use common::{SIGNING_KEY, pem_cert, spawn_security_service};

fn config(service_url: &str) -> Config {
    let mut config = Config::default();
    config.security.url = service_url.to_string();
    config.security.signing_key = Some(String::from_utf8(SIGNING_KEY.to_vec()).unwrap());
    config.security.request_timeout = Duration::from_secs(2);
    config.auth.poll_period = Duration::from_millis(20);
    config.routes = HashMap::from([
        (
            "/".to_string(),
            RouteConfig {
                operations: OperationSet {
                    user_info: true,
                    user_json: false,
                },
            },
        ),
        (
            "/api".to_string(),
            RouteConfig {
                operations: OperationSet::both(),
            },
        ),
        (
            "/public".to_string(),
            RouteConfig {
                operations: OperationSet::default(),
            },
        ),
    ]);
    config
}

/// Start the gateway on an ephemeral port and return its base URL
async fn start_gateway() -> String {
    let (service_url, _) = spawn_security_service().await;
    start_gateway_with(config(&service_url)).await
}

fn encoded_cert(common_name: &str) -> String {
    let pem = pem_cert(&[
        (DnType::OrganizationName, "Example"),
        (DnType::CommonName, common_name),
    ]);
    utf8_percent_encode(&pem, NON_ALPHANUMERIC).to_string()
}

#[tokio::test]
async fn test_health_reports_pending_count() {
    let base = start_gateway().await;

    let body: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["pending"], 0);
}

#[tokio::test]
async fn test_missing_certificate_is_forbidden() {
    let base = start_gateway().await;

    let response = reqwest::get(format!("{base}/auth")).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_api_route_publishes_all_variables() {
    // GIVEN: a certificate for alice and a route requiring both operations
    let base = start_gateway().await;
    let client = reqwest::Client::new();

    // WHEN: the proxy asks for authorization
    let response = client
        .get(format!("{base}/auth"))
        .header(CLIENT_CERT_HEADER, encoded_cert("alice"))
        .header(ORIGINAL_URI_HEADER, "/api/v1/things?page=2")
        .send()
        .await
        .unwrap();

    // THEN: allowed with every variable as a header
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-remote-user"], "CN=alice, O=Example");
    assert_eq!(headers["x-user-info-signature"], "proxy-sig");
    assert_eq!(headers["x-user-info-json-signature"], "json-sig");
    assert!(headers.contains_key("x-user-info"));
    assert!(headers.contains_key("x-user-info-json"));
}

#[tokio::test]
async fn test_root_route_only_publishes_user_info() {
    let base = start_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/auth"))
        .header(CLIENT_CERT_HEADER, encoded_cert("bob"))
        .header(ORIGINAL_URI_HEADER, "/index.html")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-user-info"));
    assert!(!response.headers().contains_key("x-user-info-json"));
}

#[tokio::test]
async fn test_route_without_operations_is_forbidden() {
    let base = start_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/auth"))
        .header(CLIENT_CERT_HEADER, encoded_cert("alice"))
        .header(ORIGINAL_URI_HEADER, "/public/logo.png")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_principal_is_forbidden() {
    let base = start_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/auth"))
        .header(CLIENT_CERT_HEADER, encoded_cert("ghost"))
        .header(ORIGINAL_URI_HEADER, "/api")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

async fn start_gateway_with(config: Config) -> String {
    let gateway = Gateway::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        gateway.serve(listener).await.unwrap();
    });
    base
}

async fn authorize_api(base: &str) -> StatusCode {
    reqwest::Client::new()
        .get(format!("{base}/auth"))
        .header(CLIENT_CERT_HEADER, encoded_cert("alice"))
        .header(ORIGINAL_URI_HEADER, "/api")
        .send()
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_unreachable_service_fails_the_context() {
    // GIVEN: a gateway pointed at a port nothing listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let base = start_gateway_with(config(&dead)).await;

    // WHEN/THEN: the failed completion denies the request
    assert_eq!(authorize_api(&base).await, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_silent_service_exhausts_poll_budget() {
    // GIVEN: a service that accepts connections but never answers, and a
    // poll budget far shorter than the request timeout
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = config(&format!("http://{}", silent.local_addr().unwrap()));
    config.auth.max_poll_attempts = 5;
    let base = start_gateway_with(config).await;

    // WHEN/THEN: the context errors out
    assert_eq!(authorize_api(&base).await, StatusCode::INTERNAL_SERVER_ERROR);

    let body: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["pending"], 0);
    drop(silent);
}
